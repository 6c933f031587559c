//! Lifecycle of one partition slice of the materialized state store.
//!
//! # State Transitions
//!
//! ```text
//! (absent) -> CatchingUp -> Ready -> (revoked: absent)
//!                 |           |
//!                 v           v
//!              (failed)   CatchingUp   (live tail lagged, re-read)
//! ```
//!
//! An absent slice means the partition is not assigned to this node.

use std::fmt;
use std::time::Instant;

use crate::types::Offset;

/// State of a partition slice from this node's perspective.
pub enum SliceState {
    /// Reading the partition from the start up to `target`.
    CatchingUp {
        started_at: Instant,
        /// High watermark captured when catch-up began, once known.
        target: Option<Offset>,
    },

    /// Fully caught up and kept current by the live tail and local commits.
    Ready { since: Instant },
}

impl fmt::Debug for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceState::CatchingUp { started_at, target } => f
                .debug_struct("CatchingUp")
                .field("duration", &started_at.elapsed())
                .field("target", target)
                .finish(),
            SliceState::Ready { since } => f
                .debug_struct("Ready")
                .field("duration", &since.elapsed())
                .finish(),
        }
    }
}

impl SliceState {
    pub fn catching_up() -> Self {
        SliceState::CatchingUp {
            started_at: Instant::now(),
            target: None,
        }
    }

    pub fn ready() -> Self {
        SliceState::Ready {
            since: Instant::now(),
        }
    }

    /// Check if lookups can be served.
    pub fn is_ready(&self) -> bool {
        matches!(self, SliceState::Ready { .. })
    }

    pub fn is_catching_up(&self) -> bool {
        matches!(self, SliceState::CatchingUp { .. })
    }

    /// Record the catch-up target once the high watermark is known.
    pub fn set_target(&mut self, offset: Offset) {
        if let SliceState::CatchingUp { target, .. } = self {
            *target = Some(offset);
        }
    }

    /// Time spent in the current state.
    pub fn duration(&self) -> std::time::Duration {
        match self {
            SliceState::CatchingUp { started_at, .. } => started_at.elapsed(),
            SliceState::Ready { since } => since.elapsed(),
        }
    }

    /// Short name for logging and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            SliceState::CatchingUp { .. } => "catching_up",
            SliceState::Ready { .. } => "ready",
        }
    }
}
