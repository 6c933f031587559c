//! # Shardhold
//! Partition-aware routing and single-writer coordination for event-sourced
//! aggregates.
//!
//! Every aggregate's events are written to a partitioned durable log, its
//! latest state is materialized into a per-partition store, and its in-memory
//! representation lives in exactly one actor on the node that owns the key's
//! partition. Ownership follows the log's consumer group: when partitions move,
//! actors are drained and the new owner recovers from the store.
//!
//! # Goals
//! - One writer per aggregate, even while partitions move between nodes
//! - Fast recovery: a cold actor loads one snapshot instead of replaying history
//! - Explicit, typed failures the caller can route on (`WrongNode`, `NotOwner`, ...)
//!
//! ## Getting started
//! Implement [`Aggregate`](engine::Aggregate) for your domain type, pick a
//! [`DurableLog`](engine::DurableLog) (the bundled
//! [`InMemoryLog`](engine::InMemoryLog) serves single-process deployments and
//! tests) and build an [`Engine`](engine::Engine):
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardhold::prelude::*;
//!
//! # #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! # enum Event { Opened }
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("already open")]
//! # struct AlreadyOpen;
//! struct Door;
//!
//! impl Aggregate for Door {
//!     type State = bool;
//!     type Command = ();
//!     type Event = Event;
//!     type Error = AlreadyOpen;
//!
//!     fn initial_state(&self) -> bool { false }
//!     fn process_command(&self, open: &bool, _: ()) -> Result<Vec<Event>, AlreadyOpen> {
//!         if *open { Err(AlreadyOpen) } else { Ok(vec![Event::Opened]) }
//!     }
//!     fn apply_event(&self, _: bool, _: &Event) -> bool { true }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let _ = telemetry::init_logging(telemetry::LogFormat::from_env());
//!
//!     let engine = Engine::builder(Door, Arc::new(InMemoryLog::new(16)))
//!         .config(EngineConfig::from_env()?)
//!         .build()?;
//!     engine.start().await?;
//!     engine.submit("front-door", ()).await?;
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod engine;
pub mod error;
pub mod server;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for embedding the engine.
    pub use crate::engine::{
        Aggregate, AggregateCodecs, Codec, CommandReply, DurableLog, Engine, EngineBuilder,
        EngineConfig, EngineStatus, HealthReport, HealthState, InMemoryLog, JsonCodec,
        OverflowPolicy,
    };
    pub use crate::error::{EngineError, EngineResult, SubmitError, TimeoutKind};
    pub use crate::telemetry;
    pub use crate::types::{AggregateKey, Epoch, NodeId, Offset, PartitionId, Sequence};

    pub use bytes;
}
