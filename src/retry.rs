use crate::abort::AbortCoordinator;
use crate::task_queue::WorkItem;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Delay applied before a failed item becomes eligible for reassignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay after the `failures`-th failure of an item (1-based).
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        let delay = match *self {
            Backoff::None => None,
            Backoff::Fixed { delay_ms } => Some(Duration::from_millis(delay_ms)),
            Backoff::Exponential { initial_ms, max_ms } => {
                let shift = failures.saturating_sub(1).min(32);
                let ms = initial_ms.saturating_mul(1u64 << shift).min(max_ms);
                Some(Duration::from_millis(ms))
            }
        };
        delay.filter(|d| !d.is_zero())
    }
}

/// Per-item retry policy. The default retries forever without delay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts allowed per item; `None` means unbounded.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue { failures: u32, delay: Option<Duration> },
    Abandon { failures: u32 },
}

/// Counts failures per item and applies the retry policy.
pub struct RetryTracker {
    policy: RetryPolicy,
    failures: Mutex<FxHashMap<WorkItem, u32>>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn record_failure(&self, item: &WorkItem) -> RetryDecision {
        let failures = {
            let mut map = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            let count = map.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };
        match self.policy.max_attempts {
            Some(max) if failures >= max => RetryDecision::Abandon { failures },
            _ => RetryDecision::Requeue {
                failures,
                delay: self.policy.backoff.delay(failures),
            },
        }
    }

    pub fn failures(&self, item: &WorkItem) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item)
            .copied()
            .unwrap_or(0)
    }
}

/// Polling schedule for remote readiness checks.
///
/// Defaults to a fixed two second interval with no deadline; setting `max_interval_ms`
/// doubles the interval after every attempt up to that cap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_interval_ms: Option<u64>,
    pub deadline_secs: Option<u64>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            max_interval_ms: None,
            deadline_secs: None,
        }
    }
}

impl PollPolicy {
    pub fn poller(&self) -> Poller {
        Poller {
            next: Duration::from_millis(self.interval_ms),
            max: self.max_interval_ms.map(Duration::from_millis),
            deadline: self
                .deadline_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollWait {
    Continue,
    DeadlineExceeded,
    Aborted,
}

pub struct Poller {
    next: Duration,
    max: Option<Duration>,
    deadline: Option<Instant>,
}

impl Poller {
    /// Sleeps for the current interval, waking early on abort.
    pub fn wait(&mut self, abort: &AbortCoordinator) -> PollWait {
        let mut sleep = self.next;
        if let Some(deadline) = self.deadline {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return PollWait::DeadlineExceeded;
            }
            sleep = sleep.min(left);
        }
        if abort.wait_timeout(sleep) {
            return PollWait::Aborted;
        }
        if let Some(max) = self.max {
            self.next = (self.next * 2).min(max);
        }
        PollWait::Continue
    }
}
