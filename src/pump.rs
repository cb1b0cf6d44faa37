use crate::SmrError;
use crate::context::JobContext;
use crate::retry::RetryDecision;
use crate::session::{ExitState, StatusRecord, WorkerSession};
use crate::task_queue::{QueuedItem, Take, WorkItem};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one session did over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub label: String,
    pub acknowledged: usize,
    pub failures: usize,
    pub malformed: usize,
    pub exit: ExitState,
    /// Set when the control channel broke (write or read error).
    pub error: Option<String>,
}

impl SessionReport {
    /// Nonzero worker exits and broken control channels are session failures.
    pub fn check(&self) -> Result<(), SmrError> {
        if let ExitState::Exited(code) = self.exit {
            if code != 0 {
                return Err(SmrError::Session(format!(
                    "{} exited with code {}",
                    self.label, code
                )));
            }
        }
        if let Some(error) = &self.error {
            return Err(SmrError::Session(format!("{}: {}", self.label, error)));
        }
        Ok(())
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one session: take an item, assign it, wait for its status, settle or retry.
pub struct ProtocolPump {
    session: WorkerSession,
    ctx: Arc<JobContext>,
    acknowledged: usize,
    failures: usize,
    malformed: usize,
}

impl ProtocolPump {
    pub fn new(session: WorkerSession, ctx: Arc<JobContext>) -> Self {
        Self {
            session,
            ctx,
            acknowledged: 0,
            failures: 0,
            malformed: 0,
        }
    }

    pub fn run(mut self) -> SessionReport {
        let label = self.session.label().to_string();
        let error = match self.pump() {
            Ok(()) => None,
            Err(e) => {
                if self.ctx.abort.is_aborted() {
                    debug!(session = %label, error = %e, "session closed during abort");
                } else {
                    warn!(session = %label, error = %e, "session control channel failed");
                }
                Some(e.to_string())
            }
        };
        if let Some(item) = self.session.settle() {
            self.requeue_unfinished(item);
        }

        let Self {
            mut session,
            ctx,
            acknowledged,
            failures,
            malformed,
        } = self;
        if !ctx.abort.is_aborted() {
            session.close_assignments();
            session.wait_exit(ctx.timing.exit_poll(), &ctx.abort);
        }
        let exit = session.release();
        info!(session = %label, acknowledged, failures, malformed, ?exit, "session finished");
        SessionReport {
            label,
            acknowledged,
            failures,
            malformed,
            exit,
            error,
        }
    }

    fn pump(&mut self) -> Result<(), SmrError> {
        loop {
            if self.ctx.abort.is_aborted() {
                debug!(session = %self.session.label(), "abort observed, not assigning");
                return Ok(());
            }
            match self.ctx.queue.take(self.ctx.timing.take_timeout()) {
                Take::Empty => continue,
                Take::Exhausted => {
                    debug!(session = %self.session.label(), "input exhausted");
                    self.session.close_assignments();
                    return self.drain_status();
                }
                Take::Item(entry) => {
                    let Some(entry) = self.hold(entry)? else { continue };
                    if !self.assign(entry)? {
                        return Ok(());
                    }
                }
            }
            if let Flow::Stop = self.await_status()? {
                return Ok(());
            }
            if self.session.handle().exit_state().is_exited() {
                debug!(session = %self.session.label(), "worker exited, no more assignments");
                return Ok(());
            }
        }
    }

    /// Waits out a retry delay for at most one take timeout. An entry that is still
    /// held back afterwards goes back to the queue and `None` is returned.
    fn hold(&mut self, entry: QueuedItem) -> Result<Option<QueuedItem>, SmrError> {
        let Some(delay) = entry.remaining_delay() else {
            return Ok(Some(entry));
        };
        let aborted = self.ctx.abort.wait_timeout(delay.min(self.ctx.timing.take_timeout()));
        if aborted || entry.remaining_delay().is_some() {
            self.ctx.queue.put_back(entry)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Returns false, with the item back in the queue, when abort was raised first.
    fn assign(&mut self, entry: QueuedItem) -> Result<bool, SmrError> {
        if self.ctx.abort.is_aborted() {
            self.ctx.queue.put_back(entry)?;
            return Ok(false);
        }
        let item = entry.item;
        debug!(session = %self.session.label(), item = %item, "assigning");
        if let Err(e) = self.session.assign(item.clone()) {
            self.ctx.queue.put(item)?;
            return Err(e);
        }
        Ok(true)
    }

    /// Reads status lines until the in-flight item is answered or the worker hangs up.
    fn await_status(&mut self) -> Result<Flow, SmrError> {
        loop {
            let Some(record) = self.session.read_status()? else {
                debug!(session = %self.session.label(), "status endpoint closed");
                return Ok(Flow::Stop);
            };
            let expected = self.session.in_flight().cloned();
            match (record, expected) {
                (StatusRecord::Success(item), Some(expected)) if item == expected => {
                    self.session.settle();
                    self.ctx.queue.retire();
                    let processed = self.ctx.progress.acknowledge(&item);
                    self.acknowledged += 1;
                    debug!(session = %self.session.label(), item = %item, processed, "item processed");
                    return Ok(Flow::Continue);
                }
                (StatusRecord::Failure(item), Some(expected)) if item == expected => {
                    self.session.settle();
                    self.failures += 1;
                    self.retry_failed(item)?;
                    return Ok(Flow::Continue);
                }
                (record, _) => self.invalid_status(record),
            }
        }
    }

    /// After end of input nothing is outstanding; anything still printed is logged.
    fn drain_status(&mut self) -> Result<(), SmrError> {
        while let Some(record) = self.session.read_status()? {
            self.invalid_status(record);
        }
        Ok(())
    }

    fn invalid_status(&mut self, record: StatusRecord) {
        self.malformed += 1;
        let line = match record {
            StatusRecord::Success(item) => format!("+{}", item),
            StatusRecord::Failure(item) => format!("!{}", item),
            StatusRecord::Malformed(line) => line,
        };
        warn!(session = %self.session.label(), line = %line, "invalid message received from worker");
        self.ctx.progress.add_log(format!(
            "invalid message received from {}: {}",
            self.session.label(),
            line
        ));
    }

    fn retry_failed(&mut self, item: WorkItem) -> Result<(), SmrError> {
        match self.ctx.retry.record_failure(&item) {
            RetryDecision::Requeue { failures, delay } => {
                info!(session = %self.session.label(), item = %item, failures, "error processing item, requeuing");
                self.ctx.progress.record_failure(&item, failures);
                match delay {
                    Some(delay) => self.ctx.queue.put_after(item, delay),
                    None => self.ctx.queue.put(item),
                }
            }
            RetryDecision::Abandon { failures } => {
                warn!(session = %self.session.label(), item = %item, failures, "giving up on item");
                self.ctx.progress.record_abandoned(&item, failures);
                self.ctx.queue.abandon();
                Ok(())
            }
        }
    }

    fn requeue_unfinished(&self, item: WorkItem) {
        debug!(session = %self.session.label(), item = %item, "returning unfinished item to queue");
        self.ctx
            .progress
            .add_log(format!("{} lost by {}, requeuing...", item, self.session.label()));
        if let Err(e) = self.ctx.queue.put(item) {
            warn!(session = %self.session.label(), error = %e, "could not requeue unfinished item");
        }
    }
}
