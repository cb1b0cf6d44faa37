use crate::SmrError;
use crate::session::exit_code;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use command_group::{CommandGroup, GroupChild};
use std::process::{ChildStdin, Command, Stdio};
use tracing::{info, warn};

/// The single aggregating consumer of the merged result stream.
pub trait ReducerSink: Send {
    /// Writes one entry verbatim and flushes it.
    fn write_entry(&mut self, entry: &[u8]) -> std::io::Result<()>;
    /// Non-blocking: `Some(code)` once the reducer has terminated.
    fn try_exit(&mut self) -> std::io::Result<Option<i32>>;
    /// Signals end of input.
    fn close_input(&mut self);
    /// Blocks until the reducer exits.
    fn wait(&mut self) -> std::io::Result<i32>;
    fn kill(&mut self);
}

/// Reducer command run locally through `sh -c` in its own process group, stdout
/// redirected to the output file.
pub struct ReducerProcess {
    child: GroupChild,
    stdin: Option<ChildStdin>,
}

impl ReducerProcess {
    pub fn spawn(command: &str, output: &Path) -> Result<Self, SmrError> {
        let out = File::create(output).map_err(|e| {
            SmrError::Reducer(format!("cannot create {}: {}", output.display(), e))
        })?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::inherit())
            .group_spawn()
            .map_err(|e| SmrError::Reducer(format!("cannot start `{}`: {}", command, e)))?;
        let stdin = child.inner().stdin.take();
        info!(pid = child.id(), command, output = %output.display(), "reducer started");
        Ok(Self { child, stdin })
    }
}

impl ReducerSink for ReducerProcess {
    fn write_entry(&mut self, entry: &[u8]) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reducer input already closed")
        })?;
        stdin.write_all(entry)?;
        stdin.flush()
    }

    fn try_exit(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn close_input(&mut self) {
        self.stdin.take();
    }

    fn wait(&mut self) -> std::io::Result<i32> {
        self.close_input();
        Ok(exit_code(self.child.wait()?))
    }

    fn kill(&mut self) {
        self.close_input();
        if let Err(e) = self.child.kill() {
            warn!(pid = self.child.id(), error = %e, "could not kill reducer");
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reducer_writes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let mut reducer = ReducerProcess::spawn("sort", &output).unwrap();
        reducer.write_entry(b"b\n").unwrap();
        reducer.write_entry(b"a\n").unwrap();
        assert_eq!(reducer.wait().unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_reducer_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut reducer = ReducerProcess::spawn("exit 4", &dir.path().join("out")).unwrap();
        assert_eq!(reducer.wait().unwrap(), 4);
        assert!(reducer.write_entry(b"late\n").is_err());
    }

    #[test]
    fn test_kill_takes_down_the_whole_reducer() {
        let dir = tempfile::tempdir().unwrap();
        let mut reducer =
            ReducerProcess::spawn("sleep 30; cat", &dir.path().join("out")).unwrap();
        let started = std::time::Instant::now();
        reducer.kill();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
