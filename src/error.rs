//! Crate level errors.
//!
//! # Error Hierarchy
//!
//! - [`LogError`]: failures reported by the durable log collaborator. Split
//!   into retriable (transient broker trouble) and permanent (fencing,
//!   serialization, authorization).
//! - [`EngineError`]: everything the routing and ownership layer can surface.
//!   Routing errors (`WrongNode`, `NotReady`, `BufferOverflow`, `NotOwner`,
//!   `AssignmentStale`) are recoverable by the caller. Persistence errors are
//!   scoped to one partition. Only `DuplicateEngine` and start failures are
//!   fatal to the engine.
//! - [`SubmitError`]: what a caller of `submit` sees. Either the aggregate's
//!   own business rejection or an [`EngineError`].
//!
//! All variants are `Clone` so that one failure can be fanned out to every
//! request queued behind it (pending buffers, actor mailboxes).
//!
//! [`LogError`]: crate::engine::LogError

use std::time::Duration;

use thiserror::Error;

use crate::engine::LogError;
use crate::types::{AggregateKey, NodeId, PartitionId};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// The asynchronous boundary a timeout fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Whole submit call, from routing to reply.
    Route,
    /// Actor spawn including state recovery.
    Spawn,
    /// Durable acknowledgement of an append.
    Append,
    /// Region startup (waiting for the state store slice).
    RegionStart,
    /// State store catch-up read.
    CatchUp,
    /// Component health check.
    HealthCheck,
    /// Engine shutdown.
    Shutdown,
}

impl TimeoutKind {
    /// Returns a string label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutKind::Route => "route",
            TimeoutKind::Spawn => "spawn",
            TimeoutKind::Append => "append",
            TimeoutKind::RegionStart => "region_start",
            TimeoutKind::CatchUp => "catch_up",
            TimeoutKind::HealthCheck => "health_check",
            TimeoutKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the routing, ownership and recovery layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The partition is owned by another node; retry against `owner`.
    #[error("Partition {partition} is owned by {owner:?}, not this node")]
    WrongNode {
        partition: PartitionId,
        owner: Option<NodeId>,
    },

    /// The partition is owned here but is not serving yet.
    #[error("Partition {partition} is not ready")]
    NotReady { partition: PartitionId },

    /// The pending request buffer for a starting partition is full.
    #[error("Pending request buffer for partition {partition} is full ({capacity} requests)")]
    BufferOverflow {
        partition: PartitionId,
        capacity: usize,
    },

    /// This node lost (or is losing) ownership of the partition.
    #[error("Not owner of partition {partition}")]
    NotOwner { partition: PartitionId },

    /// Group membership was lost; no write is safe until a fresh assignment arrives.
    #[error("Partition assignment is stale; writes are refused")]
    AssignmentStale,

    /// An asynchronous boundary did not complete in time.
    #[error("Timed out during {operation} after {after:?}")]
    Timeout {
        operation: TimeoutKind,
        after: Duration,
    },

    /// The durable log refused or failed the write.
    #[error("Append to partition {partition} failed: {source}")]
    Append {
        partition: PartitionId,
        #[source]
        source: LogError,
    },

    /// Loading prior state for a cold-started actor failed.
    #[error("State recovery for {key} failed: {reason}")]
    StateRecovery { key: AggregateKey, reason: String },

    /// Encoding or decoding a payload failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Another engine with the same name is already registered in this process.
    #[error("Engine '{name}' is already initialized in this process")]
    DuplicateEngine { name: String },

    /// The engine is not running.
    #[error("Engine is not running")]
    NotRunning,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The durable log failed outside of an append (subscribe, read).
    #[error("Log error: {0}")]
    Log(LogError),

    /// The worker serving this key exited before replying.
    #[error("Actor for {key} is gone")]
    ActorGone { key: AggregateKey },
}

impl EngineError {
    /// Check if this error is a routing failure the caller can recover from by retrying.
    ///
    /// These never indicate data loss: the command was not executed.
    #[inline]
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            EngineError::WrongNode { .. }
                | EngineError::NotReady { .. }
                | EngineError::BufferOverflow { .. }
                | EngineError::NotOwner { .. }
                | EngineError::AssignmentStale
        )
    }

    /// Check if this error indicates ownership moved away from this node.
    #[inline]
    pub fn is_not_owner(&self) -> bool {
        match self {
            EngineError::NotOwner { .. } | EngineError::WrongNode { .. } => true,
            EngineError::Append { source, .. } => matches!(source, LogError::Fenced { .. }),
            _ => false,
        }
    }

    /// Check if this is a timeout.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }

    /// Check if retrying the same request later may succeed.
    ///
    /// Business rejections and permanent persistence failures are not retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            EngineError::WrongNode { .. }
            | EngineError::NotReady { .. }
            | EngineError::BufferOverflow { .. }
            | EngineError::NotOwner { .. }
            | EngineError::AssignmentStale
            | EngineError::Timeout { .. }
            | EngineError::ActorGone { .. } => true,

            EngineError::Append { source, .. } => {
                source.is_retriable() || matches!(source, LogError::Fenced { .. })
            }
            EngineError::Log(source) => source.is_retriable(),

            EngineError::StateRecovery { .. } => true,

            EngineError::Codec(_)
            | EngineError::DuplicateEngine { .. }
            | EngineError::NotRunning
            | EngineError::Config(_) => false,
        }
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            EngineError::WrongNode { .. } => "wrong_node",
            EngineError::NotReady { .. } => "not_ready",
            EngineError::BufferOverflow { .. } => "buffer_overflow",
            EngineError::NotOwner { .. } => "not_owner",
            EngineError::AssignmentStale => "assignment_stale",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Append { .. } => "append",
            EngineError::StateRecovery { .. } => "state_recovery",
            EngineError::Codec(_) => "codec",
            EngineError::DuplicateEngine { .. } => "duplicate_engine",
            EngineError::NotRunning => "not_running",
            EngineError::Config(_) => "config",
            EngineError::Log(_) => "log",
            EngineError::ActorGone { .. } => "actor_gone",
        }
    }

    pub(crate) fn timeout(operation: TimeoutKind, after: Duration) -> Self {
        EngineError::Timeout { operation, after }
    }
}

/// Failure of a submitted command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError<E> {
    /// The aggregate's business logic rejected the command. State is unchanged.
    #[error("Command rejected: {0}")]
    Rejected(E),

    /// The engine could not route, execute or persist the command.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl<E> SubmitError<E> {
    /// The engine error, if this is not a business rejection.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            SubmitError::Engine(e) => Some(e),
            SubmitError::Rejected(_) => None,
        }
    }

    /// Check if this is a business rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, SubmitError::Rejected(_))
    }

    /// Returns a string label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            SubmitError::Rejected(_) => "rejected",
            SubmitError::Engine(e) => e.as_metric_label(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_node_display() {
        let err = EngineError::WrongNode {
            partition: PartitionId::new(3),
            owner: Some(NodeId::new(2)),
        };
        let msg = err.to_string();
        assert!(msg.contains("Partition 3"));
        assert!(msg.contains("NodeId(2)"));
    }

    #[test]
    fn test_routing_errors_are_retriable() {
        let errors = [
            EngineError::WrongNode {
                partition: PartitionId::new(0),
                owner: None,
            },
            EngineError::NotReady {
                partition: PartitionId::new(0),
            },
            EngineError::BufferOverflow {
                partition: PartitionId::new(0),
                capacity: 1,
            },
            EngineError::NotOwner {
                partition: PartitionId::new(0),
            },
            EngineError::AssignmentStale,
        ];
        for err in errors {
            assert!(err.is_routing_error(), "{err} should be a routing error");
            assert!(err.is_retriable(), "{err} should be retriable");
        }
    }

    #[test]
    fn test_permanent_errors_not_retriable() {
        assert!(!EngineError::Codec("bad".into()).is_retriable());
        assert!(
            !EngineError::DuplicateEngine {
                name: "e".into()
            }
            .is_retriable()
        );
        assert!(
            !EngineError::Append {
                partition: PartitionId::new(1),
                source: LogError::Serialization("bad".into()),
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_fenced_append_is_not_owner() {
        let err = EngineError::Append {
            partition: PartitionId::new(1),
            source: LogError::Fenced {
                partition: PartitionId::new(1),
            },
        };
        assert!(err.is_not_owner());
        assert!(err.is_retriable());
        assert!(!err.is_routing_error());
    }

    #[test]
    fn test_timeout_label() {
        let err = EngineError::timeout(TimeoutKind::Append, Duration::from_millis(5));
        assert!(err.is_timeout());
        assert_eq!(err.as_metric_label(), "timeout");
        assert!(err.to_string().contains("append"));
    }

    #[test]
    fn test_submit_error_from_engine_error() {
        let err: SubmitError<String> = EngineError::NotRunning.into();
        assert_eq!(err.engine_error(), Some(&EngineError::NotRunning));
        assert!(!err.is_rejected());
        assert_eq!(err.as_metric_label(), "not_running");

        let rejected: SubmitError<String> = SubmitError::Rejected("insufficient funds".into());
        assert!(rejected.is_rejected());
        assert_eq!(rejected.as_metric_label(), "rejected");
    }
}
