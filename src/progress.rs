use crate::abort::AbortCoordinator;
use crate::task_queue::WorkItem;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::info;

const MAX_LOG_ENTRIES: usize = 100;

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: u64,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub failure_events: usize,
    pub abandoned: usize,
    pub last_processed: Option<WorkItem>,
    pub elapsed: Duration,
    pub logs: Vec<LogEntry>,
}

impl ProgressSnapshot {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f64 / self.total as f64
        }
    }
}

struct ProgressInner {
    last_processed: Option<WorkItem>,
    failure_events: usize,
    abandoned: usize,
    logs: VecDeque<LogEntry>,
}

/// Read-mostly job observability: acknowledged count, last item, and a bounded message tail.
///
/// Writers are the protocol pumps; readers (status display, tests) only take snapshots.
/// The processed counter is informational and never drives control flow.
pub struct Progress {
    total: usize,
    started: Instant,
    processed: Arc<AtomicUsize>,
    inner: Arc<Mutex<ProgressInner>>,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            started: Instant::now(),
            processed: Arc::new(AtomicUsize::new(0)),
            inner: Arc::new(Mutex::new(ProgressInner {
                last_processed: None,
                failure_events: 0,
                abandoned: 0,
                logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            })),
        }
    }

    pub fn clone_handle(&self) -> Self {
        Self {
            total: self.total,
            started: self.started,
            processed: Arc::clone(&self.processed),
            inner: Arc::clone(&self.inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Records one success acknowledgment and returns the new processed count.
    pub fn acknowledge(&self, item: &WorkItem) -> usize {
        let count = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock().last_processed = Some(item.clone());
        count
    }

    pub fn record_failure(&self, item: &WorkItem, failures: u32) {
        self.lock().failure_events += 1;
        self.add_log(format!(
            "error processing {} (failure {}), requeuing...",
            item, failures
        ));
    }

    pub fn record_abandoned(&self, item: &WorkItem, failures: u32) {
        {
            let mut inner = self.lock();
            inner.failure_events += 1;
            inner.abandoned += 1;
        }
        self.add_log(format!(
            "giving up on {} after {} failed attempts",
            item, failures
        ));
    }

    pub fn add_log(&self, message: String) {
        let mut inner = self.lock();
        inner.logs.push_back(LogEntry {
            timestamp: Self::current_timestamp(),
            message,
        });
        if inner.logs.len() > MAX_LOG_ENTRIES {
            inner.logs.pop_front();
        }
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        ProgressSnapshot {
            total: self.total,
            processed: self.processed(),
            failure_events: inner.failure_events,
            abandoned: inner.abandoned,
            last_processed: inner.last_processed.clone(),
            elapsed: self.started.elapsed(),
            logs: inner.logs.iter().cloned().collect(),
        }
    }
}

/// Background thread that periodically logs a progress line until stopped.
pub struct ProgressReporter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    pub fn spawn(
        progress: Progress,
        abort: Arc<AbortCoordinator>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || report_loop(progress, abort, interval, stopped))?;
        Ok(Self { stop, handle })
    }

    pub fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

fn report_loop(
    progress: Progress,
    abort: Arc<AbortCoordinator>,
    interval: Duration,
    stopped: Receiver<()>,
) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if abort.is_aborted() {
            break;
        }
        let snapshot = progress.snapshot();
        info!(
            processed = snapshot.processed,
            total = snapshot.total,
            failures = snapshot.failure_events,
            last = snapshot.last_processed.as_ref().map(|i| i.as_str()).unwrap_or("-"),
            elapsed_secs = snapshot.elapsed.as_secs(),
            "job progress: {:.1}%",
            snapshot.fraction() * 100.0
        );
    }
}
