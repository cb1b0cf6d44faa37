use crate::SmrError;
use crate::abort::AbortCoordinator;
use crate::config::TimingConfig;
use crate::progress::Progress;
use crate::retry::{RetryPolicy, RetryTracker};
use crate::task_queue::{TaskQueue, WorkItem};
use std::sync::Arc;

/// Shared state of one job run, built once and handed to every pump by `Arc`.
pub struct JobContext {
    pub queue: TaskQueue,
    pub retry: RetryTracker,
    pub abort: Arc<AbortCoordinator>,
    pub progress: Progress,
    pub timing: TimingConfig,
}

impl JobContext {
    pub fn new(
        items: Vec<WorkItem>,
        retry: RetryPolicy,
        timing: TimingConfig,
        abort: Arc<AbortCoordinator>,
    ) -> Result<Self, SmrError> {
        let progress = Progress::new(items.len());
        Ok(Self {
            queue: TaskQueue::seeded(items)?,
            retry: RetryTracker::new(retry),
            abort,
            progress,
            timing,
        })
    }
}
