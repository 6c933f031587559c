//! Centralized configuration constants.
//!
//! Defaults for [`EngineConfig`](crate::engine::EngineConfig) and the few fixed
//! limits the engine relies on. Keeping them in one place makes the config
//! defaults and their validation bounds easy to audit together.

// =============================================================================
// Identity
// =============================================================================

/// Default engine name, used as the process-wide registration key.
pub const DEFAULT_ENGINE_NAME: &str = "shardhold";

/// Default topic carrying event envelopes and state snapshots.
pub const DEFAULT_STATE_TOPIC: &str = "aggregate-state";

/// Default consumer group id.
pub const DEFAULT_GROUP_ID: &str = "shardhold-engine";

// =============================================================================
// Actors
// =============================================================================

/// How long an actor may sit without traffic before it is evicted.
///
/// Five minutes keeps hot aggregates resident across bursts while bounding the
/// number of idle workers on a node.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Upper bound for spawning an actor, including state recovery.
pub const DEFAULT_SPAWN_TIMEOUT_MS: u64 = 5_000;

// =============================================================================
// Routing
// =============================================================================

/// Upper bound for a whole submit call.
pub const DEFAULT_ROUTE_TIMEOUT_MS: u64 = 30_000;

/// Upper bound for a region to become ready after first use.
pub const DEFAULT_REGION_START_TIMEOUT_MS: u64 = 10_000;

/// Requests buffered per starting partition before the overflow policy applies.
pub const DEFAULT_PENDING_BUFFER_CAPACITY: usize = 1_024;

// =============================================================================
// Producer
// =============================================================================

/// Upper bound for a durable append acknowledgement (including retries).
pub const DEFAULT_APPEND_TIMEOUT_MS: u64 = 10_000;

/// Retries of a transient append failure before it is surfaced.
pub const DEFAULT_APPEND_MAX_RETRIES: usize = 5;

/// Queue depth of a partition's producer coordinator.
pub const PRODUCER_QUEUE_CAPACITY: usize = 4_096;

// =============================================================================
// State store
// =============================================================================

/// Records fetched per catch-up read.
pub const DEFAULT_CATCH_UP_BATCH_SIZE: usize = 512;

/// Upper bound for rebuilding one partition slice from the log.
pub const DEFAULT_CATCH_UP_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Health & lifecycle
// =============================================================================

/// Upper bound for one health query.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 1_000;

/// Interval between pushed health reports.
pub const DEFAULT_HEALTH_REPORT_INTERVAL_SECS: u64 = 10;

/// Upper bound for draining regions and writers on stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 15_000;

// =============================================================================
// Partitioning
// =============================================================================

/// Virtual nodes per cluster node on the consistent hash ring used to assign
/// partitions to nodes.
pub const VIRTUAL_NODES_PER_NODE: usize = 150;

/// Seed of the murmur2 key hash (matches Kafka's default partitioner).
pub const MURMUR2_SEED: u32 = 0x9747_b28c;
