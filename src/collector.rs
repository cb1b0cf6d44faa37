use crate::abort::{AbortCoordinator, AbortReason};
use crate::reducer::ReducerSink;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorReport {
    /// Entries written to the reducer.
    pub entries: usize,
    pub bytes: usize,
    /// Entries received but never written, after an interrupt or reducer failure.
    pub discarded: usize,
}

/// Merges the result endpoints of all sessions into one stream feeding the reducer.
///
/// One reader thread per attached endpoint pushes complete lines into a shared unbounded
/// channel; a single consumer thread writes them to the reducer in arrival order.
pub struct ResultCollector {
    sender: Sender<Vec<u8>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    consumer: JoinHandle<(Box<dyn ReducerSink>, CollectorReport)>,
}

impl ResultCollector {
    pub fn start(
        sink: Box<dyn ReducerSink>,
        abort: Arc<AbortCoordinator>,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let consumer = std::thread::Builder::new()
            .name("collector".to_string())
            .spawn(move || consume(receiver, sink, &abort, poll))?;
        Ok(Self {
            sender,
            readers: Mutex::new(Vec::new()),
            consumer,
        })
    }

    /// Starts draining one session's result endpoint.
    pub fn attach(&self, label: &str, results: Box<dyn Read + Send>) -> std::io::Result<()> {
        let sender = self.sender.clone();
        let label = label.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("results-{}", label))
            .spawn(move || read_entries(&label, results, &sender))?;
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Waits for every reader to reach end of stream and for the consumer to finish,
    /// handing the reducer back to the caller.
    pub fn finish(self) -> (Box<dyn ReducerSink>, CollectorReport) {
        let Self {
            sender,
            readers,
            consumer,
        } = self;
        drop(sender);
        for reader in readers.into_inner().unwrap_or_else(PoisonError::into_inner) {
            let _ = reader.join();
        }
        match consumer.join() {
            Ok(done) => done,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn read_entries(label: &str, results: Box<dyn Read + Send>, sender: &Sender<Vec<u8>>) {
    let mut reader = BufReader::new(results);
    loop {
        let mut entry = Vec::new();
        match reader.read_until(b'\n', &mut entry) {
            Ok(0) => break,
            Ok(_) => {
                if sender.send(entry).is_err() {
                    // consumer is gone, nothing more will be written
                    break;
                }
            }
            Err(e) => {
                debug!(session = label, error = %e, "result stream closed");
                break;
            }
        }
    }
    debug!(session = label, "result reader finished");
}

fn consume(
    receiver: Receiver<Vec<u8>>,
    mut sink: Box<dyn ReducerSink>,
    abort: &AbortCoordinator,
    poll: Duration,
) -> (Box<dyn ReducerSink>, CollectorReport) {
    let mut report = CollectorReport::default();
    let mut failed = false;
    loop {
        if abort
            .reason()
            .is_some_and(|reason| reason.skips_final_flush())
        {
            report.discarded += receiver.try_iter().count();
            info!(discarded = report.discarded, "interrupted, dropping unflushed results");
            break;
        }
        match receiver.recv_timeout(poll) {
            Ok(entry) => {
                if failed {
                    report.discarded += 1;
                    continue;
                }
                match write_checked(sink.as_mut(), &entry) {
                    Ok(()) => {
                        report.entries += 1;
                        report.bytes += entry.len();
                    }
                    Err(reason) => {
                        failed = true;
                        report.discarded += 1;
                        abort.trigger(AbortReason::ReducerFailed(reason));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !failed {
                    if let Some(reason) = terminated(sink.as_mut()) {
                        failed = true;
                        abort.trigger(AbortReason::ReducerFailed(reason));
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    sink.close_input();
    (sink, report)
}

/// Returns a description if the reducer is no longer running.
fn terminated(sink: &mut dyn ReducerSink) -> Option<String> {
    match sink.try_exit() {
        Ok(None) => None,
        Ok(Some(code)) => Some(format!("reducer exited with code {} before end of input", code)),
        Err(e) => {
            warn!(error = %e, "could not poll reducer");
            None
        }
    }
}

fn write_checked(sink: &mut dyn ReducerSink, entry: &[u8]) -> Result<(), String> {
    if let Some(reason) = terminated(sink) {
        return Err(reason);
    }
    sink.write_entry(entry)
        .map_err(|e| format!("write to reducer failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Default)]
    struct MemorySink {
        entries: Arc<Mutex<Vec<Vec<u8>>>>,
        exit_after: Option<usize>,
        closed: Arc<Mutex<bool>>,
    }

    impl ReducerSink for MemorySink {
        fn write_entry(&mut self, entry: &[u8]) -> std::io::Result<()> {
            self.entries.lock().unwrap().push(entry.to_vec());
            Ok(())
        }

        fn try_exit(&mut self) -> std::io::Result<Option<i32>> {
            let written = self.entries.lock().unwrap().len();
            Ok(self.exit_after.filter(|limit| written >= *limit).map(|_| 1))
        }

        fn close_input(&mut self) {
            *self.closed.lock().unwrap() = true;
        }

        fn wait(&mut self) -> std::io::Result<i32> {
            Ok(0)
        }

        fn kill(&mut self) {}
    }

    #[test]
    fn test_lines_and_trailing_partial_are_forwarded() {
        let sink = MemorySink::default();
        let entries = Arc::clone(&sink.entries);
        let closed = Arc::clone(&sink.closed);
        let abort = Arc::new(AbortCoordinator::new());
        let collector =
            ResultCollector::start(Box::new(sink), abort.clone(), Duration::from_millis(5)).unwrap();
        collector
            .attach("w#0", Box::new(Cursor::new(b"one\ntwo\ntail".to_vec())))
            .unwrap();
        let (_, report) = collector.finish();

        assert_eq!(
            *entries.lock().unwrap(),
            vec![b"one\n".to_vec(), b"two\n".to_vec(), b"tail".to_vec()]
        );
        assert_eq!(report.entries, 3);
        assert_eq!(report.bytes, 12);
        assert!(*closed.lock().unwrap());
        assert!(!abort.is_aborted());
    }

    #[test]
    fn test_terminated_reducer_aborts_and_stops_writes() {
        let sink = MemorySink {
            exit_after: Some(1),
            ..Default::default()
        };
        let entries = Arc::clone(&sink.entries);
        let abort = Arc::new(AbortCoordinator::new());
        let collector =
            ResultCollector::start(Box::new(sink), abort.clone(), Duration::from_millis(5)).unwrap();
        collector
            .attach("w#0", Box::new(Cursor::new(b"a\nb\nc\n".to_vec())))
            .unwrap();
        let (_, report) = collector.finish();

        assert_eq!(entries.lock().unwrap().len(), 1);
        assert_eq!(report.discarded, 2);
        assert!(matches!(abort.reason(), Some(AbortReason::ReducerFailed(_))));
    }

    #[test]
    fn test_interrupt_discards_pending_results() {
        let sink = MemorySink::default();
        let entries = Arc::clone(&sink.entries);
        let abort = Arc::new(AbortCoordinator::new());
        abort.trigger(AbortReason::Interrupted);
        let collector =
            ResultCollector::start(Box::new(sink), abort.clone(), Duration::from_millis(5)).unwrap();
        collector
            .attach("w#0", Box::new(Cursor::new(b"a\nb\n".to_vec())))
            .unwrap();
        let _ = collector.finish();
        assert!(entries.lock().unwrap().is_empty());
    }
}
