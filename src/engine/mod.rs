//! Partition-aware single-writer engine for event-sourced aggregates.
//!
//! Every aggregate key maps to one partition of a durable log. The node that
//! owns a partition in the consumer group runs exactly one actor per key of
//! that partition, writes through one fenced producer per partition, and keeps
//! a materialized key-to-state slice of the partition for fast recovery.
//!
//! # Architecture
//!
//! ```text
//!        submit(key, command)
//!                │
//!                ▼
//!   ┌────────────────────────┐      ┌──────────────────────────┐
//!   │    PartitionRouter     │◀─────│ PartitionAssignmentTracker│◀── group membership
//!   │ key → partition → slot │      └──────────────────────────┘
//!   └───────────┬────────────┘
//!               ▼
//!   ┌────────────────────────┐      ┌──────────────────────────┐
//!   │  AggregateActorRegion  │─────▶│  MaterializedStateStore  │◀── committed records
//!   │  one actor per key     │      └──────────────────────────┘
//!   └───────────┬────────────┘                    ▲
//!               ▼                                 │
//!   ┌────────────────────────┐      ┌─────────────┴────────────┐
//!   │  ProducerCoordinator   │─────▶│        DurableLog        │
//!   │  ordered, fenced       │      └──────────────────────────┘
//!   └────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardhold::engine::{Aggregate, Engine, InMemoryLog};
//!
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # struct Deposited(u64);
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("never")]
//! # struct Never;
//! struct Counter;
//!
//! impl Aggregate for Counter {
//!     type State = u64;
//!     type Command = u64;
//!     type Event = Deposited;
//!     type Error = Never;
//!
//!     fn initial_state(&self) -> u64 { 0 }
//!     fn process_command(&self, _: &u64, amount: u64) -> Result<Vec<Deposited>, Never> {
//!         Ok(vec![Deposited(amount)])
//!     }
//!     fn apply_event(&self, total: u64, event: &Deposited) -> u64 { total + event.0 }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let log = Arc::new(InMemoryLog::new(8));
//!     let engine = Engine::builder(Counter, log).build()?;
//!     engine.start().await?;
//!
//!     let reply = engine.submit("counter-1", 5).await?;
//!     assert_eq!(reply.state, 5);
//!
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

mod actor;
mod aggregate;
mod assignment;
pub mod background_tasks;
mod config;
pub mod health;
mod lifecycle;
mod log;
mod memory_log;
pub mod metrics;
mod partitioner;
mod pending;
mod producer;
mod region;
pub mod retry;
mod router;
mod slice_state;
pub mod stale_mode;
mod state_store;
mod tracker;

pub use actor::{ActorHandle, CommandReply, CommandResult};
pub use aggregate::{Aggregate, AggregateCodecs, Codec, JsonCodec};
pub use assignment::{
    AssignmentDelta, MemberInfo, PartitionAssignment, PartitionOwner,
    consistent_hash_assignment, rebalance,
};
pub use background_tasks::BackgroundTaskRegistry;
pub use config::EngineConfig;
pub use health::{
    ComponentHealth, HealthCheck, HealthReport, HealthSink, HealthState, TracingHealthSink,
};
pub use lifecycle::{Engine, EngineBuilder, EngineStatus};
pub use log::{AssignmentEvent, DurableLog, LogError, LogResult, Subscription};
pub use memory_log::InMemoryLog;
pub use partitioner::{Murmur2Partitioner, Partitioner, murmur2};
pub use pending::{OverflowPolicy, PendingRequest, PendingRequestBuffer};
pub use producer::ProducerCoordinator;
pub use region::{AggregateActorRegion, RegionConfig};
pub use router::{PartitionRouter, RouterConfig};
pub use slice_state::SliceState;
pub use stale_mode::StaleAssignmentState;
pub use state_store::{MaterializedStateStore, StateSnapshot, StoreConfig};
pub use tracker::{AssignmentWatch, PartitionAssignmentTracker};
