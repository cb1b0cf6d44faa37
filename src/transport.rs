use crate::SmrError;
use crate::session::{RemoteProcess, SessionParts, exit_code};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use command_group::{CommandGroup, GroupChild};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Output of a one-shot remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stderr: Vec<String>,
}

/// How commands reach an instance. Addresses come from the instance provider.
pub trait Transport: Send + Sync {
    /// Succeeds once the instance accepts connections.
    fn probe(&self, address: &str) -> Result<(), SmrError>;
    /// Starts a long-running worker with its three endpoints attached.
    fn launch(&self, address: &str, command: &str) -> Result<SessionParts, SmrError>;
    /// Runs a command to completion, collecting its stderr lines.
    fn run(&self, address: &str, command: &str) -> Result<CommandOutput, SmrError>;
    fn upload(&self, address: &str, local: &Path, remote: &str) -> Result<(), SmrError>;
}

/// A session child spawned as its own process group, so closing it also takes down
/// whatever the worker command started.
struct ChildProcess {
    group: GroupChild,
    exited: Option<i32>,
}

impl RemoteProcess for ChildProcess {
    fn try_exit(&mut self) -> std::io::Result<Option<i32>> {
        if self.exited.is_none() {
            self.exited = self.group.try_wait()?.map(exit_code);
        }
        Ok(self.exited)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        let killed = self.group.kill();
        // reap so the pipes are released
        let status = self.group.wait()?;
        self.exited.get_or_insert(exit_code(status));
        killed
    }
}

/// Spawns `cmd` with stdin/stdout/stderr as the assignment/result/status endpoints.
fn spawn_session(mut cmd: Command) -> Result<SessionParts, SmrError> {
    let mut group = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .group_spawn()
        .map_err(|e| SmrError::Transport(format!("spawn {:?}: {}", cmd.get_program(), e)))?;
    let missing = || SmrError::Transport("child stream was not piped".to_string());
    let child = group.inner();
    let assignment = child.stdin.take().ok_or_else(missing)?;
    let results = child.stdout.take().ok_or_else(missing)?;
    let status = child.stderr.take().ok_or_else(missing)?;
    Ok(SessionParts {
        assignment: Box::new(assignment),
        status: Box::new(status),
        results: Box::new(results),
        process: Box::new(ChildProcess {
            group,
            exited: None,
        }),
    })
}

fn run_collecting_stderr(mut cmd: Command, label: &str) -> Result<CommandOutput, SmrError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SmrError::Transport(format!("spawn {:?}: {}", cmd.get_program(), e)))?;
    let mut stderr = Vec::new();
    if let Some(pipe) = child.stderr.take() {
        for line in BufReader::new(pipe).lines() {
            let line = line?;
            info!(instance = label, "stderr: {}", line);
            stderr.push(line);
        }
    }
    let status = child.wait()?;
    Ok(CommandOutput {
        code: exit_code(status),
        stderr,
    })
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

/// Runs everything on this machine through `sh -c`; the address is informational.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    workdir: Option<PathBuf>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = shell(command);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl Transport for LocalTransport {
    fn probe(&self, _address: &str) -> Result<(), SmrError> {
        Ok(())
    }

    fn launch(&self, address: &str, command: &str) -> Result<SessionParts, SmrError> {
        debug!(address, command, "launching local worker");
        spawn_session(self.command(command))
    }

    fn run(&self, address: &str, command: &str) -> Result<CommandOutput, SmrError> {
        run_collecting_stderr(self.command(command), address)
    }

    fn upload(&self, _address: &str, local: &Path, remote: &str) -> Result<(), SmrError> {
        let target = match &self.workdir {
            Some(dir) => dir.join(remote),
            None => PathBuf::from(remote),
        };
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::copy(local, &target)?;
        Ok(())
    }
}

/// Reaches instances with the system `ssh` and `scp` clients.
///
/// Killing the local `ssh` child closes the channel, which is how a blocked session is
/// force-closed.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    user: Option<String>,
    identity_file: Option<PathBuf>,
    extra_options: Vec<String>,
}

impl SshTransport {
    pub fn new(user: Option<String>, identity_file: Option<PathBuf>) -> Self {
        Self {
            user,
            identity_file,
            extra_options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        for option in &self.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args
    }

    fn destination(&self, address: &str) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, address),
            None => address.to_string(),
        }
    }

    pub fn ssh_args(&self, address: &str, command: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(self.destination(address));
        args.push(command.to_string());
        args
    }

    pub fn scp_args(&self, address: &str, local: &Path, remote: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{}", self.destination(address), remote));
        args
    }

    fn ssh(&self, address: &str, command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_args(address, command));
        cmd
    }
}

impl Transport for SshTransport {
    fn probe(&self, address: &str) -> Result<(), SmrError> {
        let status = self
            .ssh(address, "true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SmrError::Transport(format!(
                "ssh to {} failed with code {}",
                address,
                exit_code(status)
            )))
        }
    }

    fn launch(&self, address: &str, command: &str) -> Result<SessionParts, SmrError> {
        debug!(address, command, "launching remote worker");
        spawn_session(self.ssh(address, command))
    }

    fn run(&self, address: &str, command: &str) -> Result<CommandOutput, SmrError> {
        run_collecting_stderr(self.ssh(address, command), address)
    }

    fn upload(&self, address: &str, local: &Path, remote: &str) -> Result<(), SmrError> {
        let status = Command::new("scp")
            .args(self.scp_args(address, local, remote))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SmrError::Transport(format!(
                "scp {} to {}:{} failed with code {}",
                local.display(),
                address,
                remote,
                exit_code(status)
            )))
        }
    }
}
