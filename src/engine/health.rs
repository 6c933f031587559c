//! Component health checks and the engine-wide health roll-up.
//!
//! Every long-lived component (tracker, state store, router) implements
//! [`HealthCheck`]. A health query runs all checks concurrently, each bounded
//! by the query timeout; a check that does not answer in time counts as
//! [`HealthState::Down`]. The engine is:
//!
//! - `Up` when it is running and every component is up
//! - `Degraded` when it is running and at least one component is down
//! - `Down` when it is not running

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

use super::lifecycle::EngineStatus;

/// Health of one component, or of the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Degraded,
    Down,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Up => "up",
            HealthState::Degraded => "degraded",
            HealthState::Down => "down",
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, HealthState::Up)
    }
}

/// Result of one component check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub component: String,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    pub fn up(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Up,
            detail: None,
        }
    }

    pub fn down(component: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: HealthState::Down,
            detail: Some(detail.into()),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A component that can report its own health.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name used in reports.
    fn component(&self) -> &'static str;

    async fn check(&self) -> ComponentHealth;
}

/// Snapshot returned by a health query and pushed to sinks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub engine: String,
    pub status: EngineStatus,
    pub state: HealthState,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Render as JSON for the health endpoint.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"state":"{}","error":"{}"}}"#, self.state.as_str(), e)
        })
    }
}

/// Receiver of periodic health reports.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn report(&self, report: HealthReport);
}

/// Sink that writes every report to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHealthSink;

#[async_trait]
impl HealthSink for TracingHealthSink {
    async fn report(&self, report: HealthReport) {
        match report.state {
            HealthState::Up => tracing::debug!(
                engine = %report.engine,
                state = report.state.as_str(),
                "Health report"
            ),
            HealthState::Degraded | HealthState::Down => {
                let down: Vec<&str> = report
                    .components
                    .iter()
                    .filter(|c| !c.state.is_up())
                    .map(|c| c.component.as_str())
                    .collect();
                tracing::warn!(
                    engine = %report.engine,
                    state = report.state.as_str(),
                    down = ?down,
                    "Health report"
                );
            }
        }
    }
}

/// Run every check concurrently, each bounded by `timeout`.
pub async fn run_checks(checks: &[Arc<dyn HealthCheck>], timeout: Duration) -> Vec<ComponentHealth> {
    join_all(checks.iter().map(|check| async move {
        match tokio::time::timeout(timeout, check.check()).await {
            Ok(health) => health,
            Err(_) => ComponentHealth::down(
                check.component(),
                format!("health check timed out after {:?}", timeout),
            ),
        }
    }))
    .await
}

/// Combine component results into the engine's state.
pub fn roll_up(running: bool, components: &[ComponentHealth]) -> HealthState {
    if !running {
        return HealthState::Down;
    }
    if components.iter().all(|c| c.state.is_up()) {
        HealthState::Up
    } else {
        HealthState::Degraded
    }
}
