//! Operational HTTP surface.
//!
//! The engine has no network protocol of its own: commands enter through
//! [`Engine::submit`](crate::engine::Engine::submit) in-process. This module
//! only exposes health, readiness and metrics to the outside world.

pub mod health;

pub use health::{HealthServer, HealthSource};
