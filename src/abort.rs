use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// An instance never became reachable or a bootstrap command failed.
    BootstrapFailed(String),
    /// A worker could not be reached or exited with a nonzero status.
    SessionFailed(String),
    /// The reducer terminated early, exited nonzero, or stopped accepting input.
    ReducerFailed(String),
    /// Explicit cancellation by the user.
    Interrupted,
}

impl AbortReason {
    /// The interrupt path tears down immediately and skips the final result flush.
    pub fn skips_final_flush(&self) -> bool {
        matches!(self, AbortReason::Interrupted)
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::BootstrapFailed(e) => write!(f, "bootstrap failed: {}", e),
            AbortReason::SessionFailed(e) => write!(f, "worker session failed: {}", e),
            AbortReason::ReducerFailed(e) => write!(f, "reducer failed: {}", e),
            AbortReason::Interrupted => write!(f, "interrupted by user"),
        }
    }
}

/// Job-wide, set-once cancellation signal.
///
/// The first `trigger` wins and records its reason; later triggers are no-ops. Waiters
/// blocked in `wait_timeout` are woken by dropping the only sender of an internal channel.
pub struct AbortCoordinator {
    aborted: AtomicBool,
    reason: OnceLock<AbortReason>,
    wake: Mutex<Option<Sender<()>>>,
    woken: Receiver<()>,
}

impl AbortCoordinator {
    pub fn new() -> Self {
        let (wake, woken) = crossbeam_channel::bounded(0);
        Self {
            aborted: AtomicBool::new(false),
            reason: OnceLock::new(),
            wake: Mutex::new(Some(wake)),
            woken,
        }
    }

    /// Moves the job to `Aborted`. Returns true only for the call that made the transition.
    pub fn trigger(&self, reason: AbortReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            warn!(%reason, "abort already in progress");
            return false;
        }
        self.aborted.store(true, Ordering::SeqCst);
        error!(%reason, "aborting job");
        self.wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<AbortReason> {
        if self.is_aborted() {
            self.reason.get().cloned()
        } else {
            None
        }
    }

    /// Sleeps up to `timeout`, returning early (with true) if the job is aborted.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_aborted() {
            return true;
        }
        match self.woken.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_aborted(),
        }
    }
}

impl Default for AbortCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
