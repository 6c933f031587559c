//! Bounded FIFO of submissions waiting for a partition region to start.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use super::metrics;
use crate::error::EngineError;
use crate::types::PartitionId;

/// What happens to a submission that arrives when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// The arriving submission fails with `BufferOverflow`.
    #[default]
    Reject,
    /// The oldest queued submission fails with `BufferOverflow` and the
    /// arriving one is queued.
    DropOldest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Reject => "reject",
            OverflowPolicy::DropOldest => "drop_oldest",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop_oldest" | "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "unknown overflow policy '{other}', expected 'reject' or 'drop_oldest'"
            )),
        }
    }
}

/// Something queued in a [`PendingRequestBuffer`] that can be failed in place.
pub trait PendingRequest {
    fn fail(self, error: EngineError);
}

/// Bounded queue of requests for one starting partition.
///
/// Requests leave the buffer in arrival order, either drained into the
/// region once it is ready or failed together when startup fails or the
/// partition is revoked.
pub struct PendingRequestBuffer<R> {
    partition: PartitionId,
    capacity: usize,
    policy: OverflowPolicy,
    queue: VecDeque<R>,
}

impl<R> fmt::Debug for PendingRequestBuffer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequestBuffer")
            .field("partition", &self.partition)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.queue.len())
            .finish()
    }
}

impl<R: PendingRequest> PendingRequestBuffer<R> {
    pub fn new(partition: PartitionId, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            partition,
            capacity,
            policy,
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue `request`, applying the overflow policy when full.
    ///
    /// Whichever request loses under the policy is failed with
    /// [`EngineError::BufferOverflow`] before this returns.
    pub fn push(&mut self, request: R) {
        let overflow = EngineError::BufferOverflow {
            partition: self.partition,
            capacity: self.capacity,
        };

        if self.queue.len() < self.capacity {
            self.queue.push_back(request);
            metrics::PENDING_REQUESTS.inc();
            return;
        }

        metrics::record_pending_overflow();
        tracing::warn!(
            partition = %self.partition,
            capacity = self.capacity,
            policy = %self.policy,
            "Pending request buffer full"
        );

        match self.policy {
            OverflowPolicy::Reject => request.fail(overflow),
            OverflowPolicy::DropOldest => {
                if let Some(oldest) = self.queue.pop_front() {
                    oldest.fail(overflow);
                    self.queue.push_back(request);
                } else {
                    // Zero capacity: nothing to evict.
                    request.fail(overflow);
                }
            }
        }
    }

    /// Take every queued request, oldest first.
    pub fn drain(&mut self) -> Vec<R> {
        metrics::PENDING_REQUESTS.sub(self.queue.len() as i64);
        self.queue.drain(..).collect()
    }

    /// Fail every queued request with `error`.
    pub fn fail_all(&mut self, error: EngineError) {
        for request in self.drain() {
            request.fail(error.clone());
        }
    }
}
