//! Stale-assignment state.
//!
//! When the group-membership signal is lost the last known assignment can no
//! longer be trusted: another node may already have been handed our
//! partitions. Instead of silently freezing on that snapshot, the tracker
//! enters stale mode and every write is refused until a fresh assignment
//! arrives.
//!
//! # Safety Properties
//!
//! 1. **Atomic transitions**: all state changes use `SeqCst` ordering
//! 2. **Re-entry detection**: the entry timestamp lets an exit attempt notice
//!    that membership was lost again while it was verifying
//! 3. **Metrics integration**: transitions update the stale-mode gauge
//!
//! # Example
//!
//! ```rust
//! use shardhold::engine::StaleAssignmentState;
//!
//! let stale = StaleAssignmentState::new();
//! assert!(stale.enter());
//! let entered_at = stale.entered_at();
//! assert!(stale.try_exit(entered_at, "reassigned"));
//! assert!(!stale.is_active());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::metrics;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Type-safe wrapper for the stale flag and its entry timestamp.
#[derive(Debug)]
pub struct StaleAssignmentState {
    active: AtomicBool,
    entered_at_millis: AtomicU64,
}

impl Default for StaleAssignmentState {
    fn default() -> Self {
        Self::new()
    }
}

impl StaleAssignmentState {
    /// Create a new state (not stale).
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            entered_at_millis: AtomicU64::new(0),
        }
    }

    /// Check if the assignment is currently stale.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Timestamp (epoch millis) stale mode was entered, or 0.
    pub fn entered_at(&self) -> u64 {
        self.entered_at_millis.load(Ordering::SeqCst)
    }

    /// Enter stale mode.
    ///
    /// Returns `true` if this call made the transition, `false` if already stale.
    pub fn enter(&self) -> bool {
        if !self.active.swap(true, Ordering::SeqCst) {
            // Never 0, so a concurrent try_exit that captured 0 cannot match.
            self.entered_at_millis
                .store(now_millis().max(1), Ordering::SeqCst);
            metrics::set_assignment_stale(true);
            true
        } else {
            false
        }
    }

    /// Exit stale mode unless it was re-entered since `expected_entered_at` was read.
    ///
    /// Returns `true` if this call exited stale mode.
    pub fn try_exit(&self, expected_entered_at: u64, exit_reason: &str) -> bool {
        let current_entered_at = self.entered_at_millis.load(Ordering::SeqCst);
        if current_entered_at != expected_entered_at {
            return false;
        }

        match self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let duration_ms = now_millis().saturating_sub(current_entered_at);
                self.entered_at_millis.store(0, Ordering::SeqCst);
                metrics::set_assignment_stale(false);
                tracing::info!(exit_reason, duration_ms, "Exited stale assignment mode");
                true
            }
            Err(_) => false,
        }
    }

    /// Exit stale mode without re-entry detection (shutdown).
    pub fn force_exit(&self) -> bool {
        if self.active.swap(false, Ordering::SeqCst) {
            self.entered_at_millis.store(0, Ordering::SeqCst);
            metrics::set_assignment_stale(false);
            true
        } else {
            false
        }
    }
}
