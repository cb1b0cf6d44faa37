use crate::SmrError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Opaque identifier of one unit of input work, e.g. `s3://bucket/key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem(Arc<str>);

impl WorkItem {
    /// Item ids travel as single protocol lines, so they must be non-empty and newline free.
    pub fn new(id: impl AsRef<str>) -> Result<Self, SmrError> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(SmrError::Input("empty work item id".to_string()));
        }
        if id.contains('\n') || id.contains('\r') {
            return Err(SmrError::Input(format!("work item id contains a line break: {:?}", id)));
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pending item, optionally held back until a retry delay has passed.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub item: WorkItem,
    pub not_before: Option<Instant>,
}

impl QueuedItem {
    /// Time left before this item may be assigned, if any.
    pub fn remaining_delay(&self) -> Option<Duration> {
        self.not_before
            .and_then(|at| at.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

#[derive(Debug)]
pub enum Take {
    Item(QueuedItem),
    /// Nothing arrived within the timeout, but unsettled items remain elsewhere.
    Empty,
    /// Every item has been retired or abandoned.
    Exhausted,
}

/// Shared pending-work container seeded once with the whole job.
///
/// Capacity equals the item count: an item is either queued, assigned to exactly one
/// session, or settled, so the channel can never hold more than `total` entries.
pub struct TaskQueue {
    sender: Sender<QueuedItem>,
    receiver: Receiver<QueuedItem>,
    total: usize,
    retired: AtomicUsize,
    abandoned: AtomicUsize,
}

impl TaskQueue {
    pub fn seeded(items: Vec<WorkItem>) -> Result<Self, SmrError> {
        let total = items.len();
        // bounded(0) would be a rendezvous channel
        let (sender, receiver) = crossbeam_channel::bounded(total.max(1));
        let queue = Self {
            sender,
            receiver,
            total,
            retired: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
        };
        for item in items {
            queue.put(item)?;
        }
        Ok(queue)
    }

    pub fn put(&self, item: WorkItem) -> Result<(), SmrError> {
        self.push(QueuedItem { item, not_before: None })
    }

    /// Re-inserts an item that must not be assigned before `delay` has elapsed.
    pub fn put_after(&self, item: WorkItem, delay: Duration) -> Result<(), SmrError> {
        self.push(QueuedItem {
            item,
            not_before: Some(Instant::now() + delay),
        })
    }

    /// Returns an entry taken by `take` that could not be assigned.
    pub fn put_back(&self, entry: QueuedItem) -> Result<(), SmrError> {
        self.push(entry)
    }

    fn push(&self, entry: QueuedItem) -> Result<(), SmrError> {
        match self.sender.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(entry)) => Err(SmrError::Queue(format!(
                "capacity {} exceeded while inserting {}",
                self.total, entry.item
            ))),
            Err(TrySendError::Disconnected(entry)) => {
                Err(SmrError::Queue(format!("queue closed while inserting {}", entry.item)))
            }
        }
    }

    pub fn take(&self, timeout: Duration) -> Take {
        if self.is_exhausted() {
            return Take::Exhausted;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(entry) => Take::Item(self.prefer_ready(entry)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                if self.is_exhausted() {
                    Take::Exhausted
                } else {
                    Take::Empty
                }
            }
        }
    }

    /// Swaps a held-back entry for the earliest assignable one queued behind it.
    fn prefer_ready(&self, first: QueuedItem) -> QueuedItem {
        if first.remaining_delay().is_none() {
            return first;
        }
        let mut best = first;
        for _ in 0..self.receiver.len() {
            let Ok(candidate) = self.receiver.try_recv() else { break };
            let passed = if candidate.not_before < best.not_before {
                std::mem::replace(&mut best, candidate)
            } else {
                candidate
            };
            if let Err(e) = self.put_back(passed) {
                warn!(error = %e, "could not requeue a delayed entry");
            }
            if best.remaining_delay().is_none() {
                break;
            }
        }
        best
    }

    /// Marks one assigned item as successfully processed.
    pub fn retire(&self) {
        self.retired.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one assigned item as given up on by the retry policy.
    pub fn abandon(&self) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_exhausted(&self) -> bool {
        self.settled() >= self.total
    }

    pub fn settled(&self) -> usize {
        self.retired.load(Ordering::SeqCst) + self.abandoned.load(Ordering::SeqCst)
    }

    pub fn retired(&self) -> usize {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
