//! Durable log collaborator interface.
//!
//! The engine does not implement a broker. It needs a partitioned,
//! per-partition-ordered, durable append log with consumer-group partition
//! assignment, and talks to it exclusively through [`DurableLog`].
//!
//! # Available Implementations
//!
//! - [`InMemoryLog`](super::InMemoryLog): in-process log for single-node
//!   deployments and tests.
//!
//! # Example: Custom Backend
//!
//! ```text
//! use shardhold::engine::{DurableLog, LogResult};
//! use async_trait::async_trait;
//!
//! struct KafkaLog { /* client handles */ }
//!
//! #[async_trait]
//! impl DurableLog for KafkaLog {
//!     fn partition_count(&self) -> u32 { 12 }
//!     // ... forward to the broker client
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use super::assignment::PartitionAssignment;
use crate::types::{Ack, CommittedRecord, EventEnvelope, NodeId, Offset, PartitionId, WriterFence};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors reported by the durable log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    /// Network or broker hiccup; the same request may succeed later.
    #[error("Transient log error: {0}")]
    Transient(String),

    /// The writer no longer owns the partition (stale node or epoch).
    #[error("Writer fenced out of partition {partition}")]
    Fenced { partition: PartitionId },

    /// The payload could not be serialized or was rejected as malformed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The writer is not allowed to write this topic.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The partition does not exist.
    #[error("Unknown partition {partition}")]
    UnknownPartition { partition: PartitionId },

    /// The log (or subscription) has been closed.
    #[error("Log closed")]
    Closed,
}

impl LogError {
    /// Check if this error is retriable (transient infrastructure issue).
    ///
    /// Fencing is deliberately not retriable: retrying a fenced write would
    /// keep failing and the caller must instead retry against the new owner.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        match self {
            LogError::Transient(_) => true,

            LogError::Fenced { .. }
            | LogError::Serialization(_)
            | LogError::Unauthorized(_)
            | LogError::UnknownPartition { .. }
            | LogError::Closed => false,
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            LogError::Transient(_) => "transient",
            LogError::Fenced { .. } => "fenced",
            LogError::Serialization(_) => "serialization",
            LogError::Unauthorized(_) => "unauthorized",
            LogError::UnknownPartition { .. } => "unknown_partition",
            LogError::Closed => "closed",
        }
    }
}

/// Consumer-group membership signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentEvent {
    /// A rebalance completed; the new assignment applies.
    Assigned(PartitionAssignment),
    /// This member dropped out of the group (session expiry, network partition).
    MembershipLost,
}

/// Handle returned by [`DurableLog::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    /// Assignment changes for the group, in epoch order.
    pub assignments: mpsc::UnboundedReceiver<AssignmentEvent>,
    /// Every record committed to the topic, across partitions.
    ///
    /// Ordered within a partition, unordered across partitions. Consumers
    /// filter on the partitions they are assigned.
    pub records: broadcast::Receiver<CommittedRecord>,
}

/// Partitioned, ordered, durable append log.
#[async_trait]
pub trait DurableLog: Send + Sync + 'static {
    /// Number of partitions in the topic.
    fn partition_count(&self) -> u32;

    /// Append one envelope to `partition`.
    ///
    /// Resolves only after the log durably accepted the write. Appends to one
    /// partition are assigned strictly increasing offsets in the order accepted.
    async fn append(
        &self,
        partition: PartitionId,
        fence: WriterFence,
        envelope: EventEnvelope,
    ) -> LogResult<Ack>;

    /// Read up to `max` records of `partition` starting at offset `from`.
    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> LogResult<Vec<CommittedRecord>>;

    /// Offset the next append to `partition` will receive.
    async fn high_watermark(&self, partition: PartitionId) -> LogResult<Offset>;

    /// Join consumer group `group_id` on `topic` as `node`.
    async fn subscribe(&self, topic: &str, group_id: &str, node: NodeId)
    -> LogResult<Subscription>;

    /// Leave consumer group `group_id`, triggering a rebalance for the others.
    async fn unsubscribe(&self, group_id: &str, node: NodeId) -> LogResult<()>;
}
