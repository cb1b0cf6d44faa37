use crate::SmrError;
use crate::abort::AbortCoordinator;
use crate::task_queue::WorkItem;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// The process behind a session, as seen from the controlling side.
pub trait RemoteProcess: Send {
    /// Non-blocking: `Some(code)` once the remote process has exited.
    fn try_exit(&mut self) -> std::io::Result<Option<i32>>;
    /// Tears down the transport, unblocking any reader of its streams.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Raw endpoints of a freshly launched worker.
pub struct SessionParts {
    pub assignment: Box<dyn Write + Send>,
    pub status: Box<dyn Read + Send>,
    pub results: Box<dyn Read + Send>,
    pub process: Box<dyn RemoteProcess>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    Success(WorkItem),
    Failure(WorkItem),
    Malformed(String),
}

impl StatusRecord {
    /// Parses one status line: `+<id>` success, `!<id>` failure, anything else malformed.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\n', '\r']);
        let parsed = if let Some(id) = line.strip_prefix('+') {
            WorkItem::new(id).ok().map(StatusRecord::Success)
        } else if let Some(id) = line.strip_prefix('!') {
            WorkItem::new(id).ok().map(StatusRecord::Failure)
        } else {
            None
        };
        parsed.unwrap_or_else(|| StatusRecord::Malformed(line.to_string()))
    }

    /// Like [`StatusRecord::parse`]; a line that is not UTF-8 is malformed.
    pub fn parse_bytes(line: &[u8]) -> Self {
        match std::str::from_utf8(line) {
            Ok(line) => Self::parse(line),
            Err(_) => StatusRecord::Malformed(
                String::from_utf8_lossy(line)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Pending,
    /// Signal terminations are reported as -1.
    Exited(i32),
}

impl ExitState {
    pub fn is_exited(&self) -> bool {
        matches!(self, ExitState::Exited(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ExitState::Exited(code) if *code != 0)
    }
}

struct ProcessSlot {
    process: Box<dyn RemoteProcess>,
    exit: ExitState,
    closed: bool,
}

/// Shared handle to a session's process, usable from other threads to poll or force-close it.
#[derive(Clone)]
pub struct SessionHandle {
    label: Arc<str>,
    slot: Arc<Mutex<ProcessSlot>>,
}

impl SessionHandle {
    fn lock(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn exit_state(&self) -> ExitState {
        let mut slot = self.lock();
        if slot.exit == ExitState::Pending {
            match slot.process.try_exit() {
                Ok(Some(code)) => slot.exit = ExitState::Exited(code),
                Ok(None) => {}
                Err(e) => warn!(session = %self.label, error = %e, "could not poll worker exit status"),
            }
        }
        slot.exit
    }

    /// Kills the transport if the worker is still running. Safe to call repeatedly.
    pub fn force_close(&self) {
        let mut slot = self.lock();
        if slot.closed {
            return;
        }
        slot.closed = true;
        if slot.exit == ExitState::Pending {
            if let Ok(Some(code)) = slot.process.try_exit() {
                slot.exit = ExitState::Exited(code);
                return;
            }
            debug!(session = %self.label, "force-closing worker transport");
            if let Err(e) = slot.process.kill() {
                warn!(session = %self.label, error = %e, "could not close worker transport");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Control relationship with one remote worker: assignment out, status in, results in.
///
/// At most one assignment is outstanding at a time; `assign` refuses a second one.
pub struct WorkerSession {
    assignment: Option<BufWriter<Box<dyn Write + Send>>>,
    status: BufReader<Box<dyn Read + Send>>,
    results: Option<Box<dyn Read + Send>>,
    handle: SessionHandle,
    in_flight: Option<WorkItem>,
    line: Vec<u8>,
}

impl WorkerSession {
    pub fn new(label: impl Into<String>, parts: SessionParts) -> Self {
        let label: String = label.into();
        Self {
            assignment: Some(BufWriter::new(parts.assignment)),
            status: BufReader::new(parts.status),
            results: Some(parts.results),
            handle: SessionHandle {
                label: Arc::from(label.as_str()),
                slot: Arc::new(Mutex::new(ProcessSlot {
                    process: parts.process,
                    exit: ExitState::Pending,
                    closed: false,
                })),
            },
            in_flight: None,
            line: Vec::new(),
        }
    }

    pub fn label(&self) -> &str {
        self.handle.label()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// The result endpoint; handed once to a collector reader.
    pub fn take_results(&mut self) -> Option<Box<dyn Read + Send>> {
        self.results.take()
    }

    pub fn in_flight(&self) -> Option<&WorkItem> {
        self.in_flight.as_ref()
    }

    /// Clears and returns the outstanding assignment.
    pub fn settle(&mut self) -> Option<WorkItem> {
        self.in_flight.take()
    }

    pub fn assignments_closed(&self) -> bool {
        self.assignment.is_none()
    }

    /// Writes one item id as a line and flushes it to the worker.
    pub fn assign(&mut self, item: WorkItem) -> Result<(), SmrError> {
        if let Some(outstanding) = &self.in_flight {
            return Err(SmrError::Protocol(format!(
                "{} already has {} outstanding",
                self.label(),
                outstanding
            )));
        }
        let writer = self.assignment.as_mut().ok_or_else(|| {
            SmrError::Protocol(format!("{} assignment endpoint is closed", self.handle.label))
        })?;
        writer.write_all(item.as_str().as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.in_flight = Some(item);
        Ok(())
    }

    /// Signals end of input by closing the assignment write side.
    pub fn close_assignments(&mut self) {
        if let Some(mut writer) = self.assignment.take() {
            if let Err(e) = writer.flush() {
                debug!(session = %self.label(), error = %e, "flush on close failed");
            }
        }
    }

    /// Blocks for the next status line; `None` once the worker closed the endpoint.
    pub fn read_status(&mut self) -> Result<Option<StatusRecord>, SmrError> {
        self.line.clear();
        let read = self.status.read_until(b'\n', &mut self.line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(StatusRecord::parse_bytes(&self.line)))
    }

    /// Polls until the worker's exit status is known, giving up early on abort.
    pub fn wait_exit(&self, interval: Duration, abort: &AbortCoordinator) -> ExitState {
        loop {
            let state = self.handle.exit_state();
            if state.is_exited() || abort.wait_timeout(interval) {
                return self.handle.exit_state();
            }
        }
    }

    /// Releases the transport.
    pub fn release(mut self) -> ExitState {
        self.close_assignments();
        self.handle.force_close();
        self.handle.exit_state()
    }
}

pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeProcess {
        exit: Option<i32>,
        killed: Arc<AtomicBool>,
    }

    impl RemoteProcess for FakeProcess {
        fn try_exit(&mut self) -> std::io::Result<Option<i32>> {
            Ok(self.exit)
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            self.exit = Some(-1);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session(status: &str, exit: Option<i32>) -> (WorkerSession, SharedBuf, Arc<AtomicBool>) {
        let written = SharedBuf::default();
        let killed = Arc::new(AtomicBool::new(false));
        let parts = SessionParts {
            assignment: Box::new(written.clone()),
            status: Box::new(Cursor::new(status.as_bytes().to_vec())),
            results: Box::new(Cursor::new(Vec::new())),
            process: Box::new(FakeProcess {
                exit,
                killed: Arc::clone(&killed),
            }),
        };
        (WorkerSession::new("test#0", parts), written, killed)
    }

    #[test]
    fn test_parse_status_lines() {
        let item = WorkItem::new("s3://b/k").unwrap();
        assert_eq!(StatusRecord::parse("+s3://b/k\n"), StatusRecord::Success(item.clone()));
        assert_eq!(StatusRecord::parse("!s3://b/k\r\n"), StatusRecord::Failure(item));
        assert_eq!(
            StatusRecord::parse("Traceback (most recent call last):"),
            StatusRecord::Malformed("Traceback (most recent call last):".into())
        );
        assert_eq!(StatusRecord::parse("+"), StatusRecord::Malformed("+".into()));
    }

    #[test]
    fn test_non_utf8_status_line_is_malformed() {
        assert_eq!(
            StatusRecord::parse_bytes(b"\xff\xfe garbage\n"),
            StatusRecord::Malformed("\u{fffd}\u{fffd} garbage".into())
        );
        assert_eq!(
            StatusRecord::parse_bytes(b"+a\n"),
            StatusRecord::Success(WorkItem::new("a").unwrap())
        );
    }

    #[test]
    fn test_assign_writes_line_and_blocks_second() {
        let (mut session, written, _) = session("", None);
        session.assign(WorkItem::new("a").unwrap()).unwrap();
        assert_eq!(&*written.0.lock().unwrap(), b"a\n");
        assert!(session.assign(WorkItem::new("b").unwrap()).is_err());
        assert_eq!(session.settle(), Some(WorkItem::new("a").unwrap()));
        session.assign(WorkItem::new("b").unwrap()).unwrap();
        assert_eq!(&*written.0.lock().unwrap(), b"a\nb\n");
    }

    #[test]
    fn test_assign_after_close_fails() {
        let (mut session, _, _) = session("", None);
        session.close_assignments();
        assert!(session.assignments_closed());
        assert!(session.assign(WorkItem::new("a").unwrap()).is_err());
        assert!(session.in_flight().is_none());
    }

    #[test]
    fn test_read_status_until_eof() {
        let (mut session, _, _) = session("+a\n!b\ngarbage\n", Some(0));
        assert!(matches!(session.read_status().unwrap(), Some(StatusRecord::Success(_))));
        assert!(matches!(session.read_status().unwrap(), Some(StatusRecord::Failure(_))));
        assert!(matches!(session.read_status().unwrap(), Some(StatusRecord::Malformed(_))));
        assert_eq!(session.read_status().unwrap(), None);
    }

    #[test]
    fn test_force_close_kills_running_worker_once() {
        let (session, _, killed) = session("", None);
        let handle = session.handle();
        assert_eq!(handle.exit_state(), ExitState::Pending);
        handle.force_close();
        handle.force_close();
        assert!(killed.load(Ordering::SeqCst));
        assert!(handle.is_closed());
        assert_eq!(session.release(), ExitState::Exited(-1));
    }

    #[test]
    fn test_release_leaves_exited_worker_alone() {
        let (session, _, killed) = session("", Some(3));
        let abort = AbortCoordinator::new();
        assert_eq!(session.wait_exit(Duration::from_millis(1), &abort), ExitState::Exited(3));
        assert!(ExitState::Exited(3).is_failure());
        assert_eq!(session.release(), ExitState::Exited(3));
        assert!(!killed.load(Ordering::SeqCst));
    }
}
