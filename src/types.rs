//! Type-safe wrappers for engine primitives.
//!
//! These newtypes keep partition indices, node identities, assignment epochs,
//! log offsets and aggregate sequence markers from being mixed up even though
//! they share an integer representation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifier of one aggregate instance.
///
/// Stable for the aggregate's lifetime and used as the log's partitioning key.
/// Backed by `Arc<str>` so clones on the routing hot path are O(1).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateKey(Arc<str>);

impl AggregateKey {
    /// Create a key from anything string-like.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        AggregateKey(key.into())
    }

    /// Borrow the key as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw key bytes, as fed to the partitioner.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<&str> for AggregateKey {
    fn from(value: &str) -> Self {
        AggregateKey(Arc::from(value))
    }
}

impl From<String> for AggregateKey {
    fn from(value: String) -> Self {
        AggregateKey(Arc::from(value))
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a log partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Create a new partition id from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        PartitionId(value)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a node (worker process) in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a new node id from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        NodeId(value)
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Generation number of a partition assignment.
///
/// Strictly increases with every rebalance of the consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    /// Epoch used before the first assignment arrives.
    pub const ZERO: Self = Epoch(0);

    /// Create a new epoch from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Epoch(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following epoch.
    #[inline]
    pub const fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record within one log partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(pub u64);

impl Offset {
    /// Create a new offset from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Offset(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-aggregate sequence marker.
///
/// The first committed write for a key carries sequence 1; `Sequence::ZERO`
/// denotes an aggregate with no history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Sequence of an aggregate that has never been written.
    pub const ZERO: Self = Sequence(0);

    /// Create a new sequence from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        Sequence(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following sequence marker.
    #[inline]
    pub const fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A command addressed to one aggregate, plus routing metadata.
///
/// Commands are ephemeral inputs; only the events they produce are persisted.
#[derive(Debug, Clone)]
pub struct CommandEnvelope<C> {
    pub key: AggregateKey,
    pub command: C,
    pub submitted_at: DateTime<Utc>,
    pub correlation_id: Uuid,
}

impl<C> CommandEnvelope<C> {
    /// Wrap a command with a fresh correlation id and the current time.
    pub fn new(key: AggregateKey, command: C) -> Self {
        Self {
            key,
            command,
            submitted_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// The unit of durable write.
///
/// Carries the encoded events produced by one command turn together with the
/// encoded state they lead to, so the state topic doubles as a compacted
/// key-to-state projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub key: AggregateKey,
    pub partition: PartitionId,
    pub sequence: Sequence,
    pub timestamp_ms: i64,
    pub events: Vec<Bytes>,
    pub state: Bytes,
}

/// An [`EventEnvelope`] after the log accepted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedRecord {
    pub offset: Offset,
    pub envelope: EventEnvelope,
}

impl CommittedRecord {
    #[inline]
    pub fn partition(&self) -> PartitionId {
        self.envelope.partition
    }

    #[inline]
    pub fn key(&self) -> &AggregateKey {
        &self.envelope.key
    }

    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.envelope.sequence
    }
}

/// Durable acknowledgement of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: PartitionId,
    pub offset: Offset,
}

/// Identity a writer presents with every append.
///
/// The log rejects writes from a node that no longer owns the partition, or
/// from an ownership epoch older than the partition's current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterFence {
    pub node: NodeId,
    pub epoch: Epoch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_key_from_str_and_display() {
        let key = AggregateKey::from("acct-1");
        assert_eq!(key.as_str(), "acct-1");
        assert_eq!(key.to_string(), "acct-1");
        assert_eq!(key.as_bytes(), b"acct-1");
    }

    #[test]
    fn test_aggregate_key_clone_shares_allocation() {
        let key = AggregateKey::from(String::from("acct-2"));
        let cloned = key.clone();
        assert_eq!(key, cloned);
        assert!(std::ptr::eq(key.as_str(), cloned.as_str()));
    }

    #[test]
    fn test_epoch_next() {
        assert_eq!(Epoch::ZERO.next(), Epoch::new(1));
        assert!(Epoch::new(2) > Epoch::new(1));
    }

    #[test]
    fn test_sequence_next() {
        assert_eq!(Sequence::ZERO.next().value(), 1);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::new(3).to_string(), "node-3");
        assert_eq!(PartitionId::new(7).to_string(), "7");
    }

    #[test]
    fn test_command_envelope_new() {
        let envelope = CommandEnvelope::new(AggregateKey::from("k"), 5u32);
        assert_eq!(envelope.command, 5);
        assert_eq!(envelope.key.as_str(), "k");
        assert!(!envelope.correlation_id.is_nil());
    }

    #[test]
    fn test_committed_record_accessors() {
        let record = CommittedRecord {
            offset: Offset::new(4),
            envelope: EventEnvelope {
                key: AggregateKey::from("k"),
                partition: PartitionId::new(2),
                sequence: Sequence::new(9),
                timestamp_ms: 0,
                events: vec![],
                state: Bytes::new(),
            },
        };
        assert_eq!(record.partition(), PartitionId::new(2));
        assert_eq!(record.sequence(), Sequence::new(9));
        assert_eq!(record.key().as_str(), "k");
    }
}
