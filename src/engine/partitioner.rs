//! Aggregate key to partition mapping.
//!
//! The same [`Partitioner`] instance must be used on the write path (actors
//! appending to the log) and on the read path (router and state store). A
//! mismatch would send a key's writes to one partition while its owner reads
//! another, which is exactly the split-brain the engine exists to prevent.
//!
//! # Default Algorithm
//!
//! [`Murmur2Partitioner`] reproduces Kafka's default key partitioner:
//! `positive(murmur2(key_bytes)) % partition_count`, so an engine sharing a
//! topic with plain Kafka producers agrees with them on key placement.

use crate::constants::MURMUR2_SEED;
use crate::types::{AggregateKey, PartitionId};

/// Pure, deterministic mapping from aggregate key to partition.
pub trait Partitioner: Send + Sync + std::fmt::Debug {
    /// Number of partitions in the topic.
    fn partition_count(&self) -> u32;

    /// Partition owning `key`. Must always return the same value for the same key.
    fn partition_of(&self, key: &AggregateKey) -> PartitionId;
}

/// Kafka-compatible murmur2 partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Murmur2Partitioner {
    partitions: u32,
}

impl Murmur2Partitioner {
    /// Create a partitioner over `partitions` partitions.
    ///
    /// A zero partition count is clamped to one so `partition_of` never divides by zero;
    /// [`EngineConfig::validate`](super::EngineConfig::validate) rejects it earlier.
    pub fn new(partitions: u32) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }
}

impl Partitioner for Murmur2Partitioner {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn partition_of(&self, key: &AggregateKey) -> PartitionId {
        let hash = to_positive(murmur2(key.as_bytes()));
        PartitionId::new(hash % self.partitions)
    }
}

/// Clear the sign bit, as Kafka's `Utils.toPositive` does.
#[inline]
fn to_positive(hash: i32) -> u32 {
    (hash as u32) & 0x7fff_ffff
}

/// 32-bit murmur2 hash with Kafka's seed.
pub fn murmur2(data: &[u8]) -> i32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = MURMUR2_SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() == 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}
