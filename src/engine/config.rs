//! Engine configuration.
//!
//! Every timeout the engine applies at an asynchronous boundary is set here,
//! together with the identity of this node in the consumer group and the
//! bounds of its buffers. Defaults live in [`crate::constants`].

use std::time::Duration;

use super::pending::OverflowPolicy;
use crate::constants::*;
use crate::types::NodeId;

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Process-wide unique name. A second engine with the same name fails to build.
    pub engine_name: String,

    /// Identity of this node in the consumer group.
    pub node_id: NodeId,

    /// Topic carrying event envelopes and state snapshots.
    pub topic: String,

    /// Consumer group id. All nodes serving the same aggregates share it.
    pub group_id: String,

    /// Idle time after which an actor is evicted.
    pub idle_timeout: Duration,

    /// Upper bound for spawning an actor, including state recovery.
    pub spawn_timeout: Duration,

    /// Upper bound for a whole submit call.
    pub route_timeout: Duration,

    /// Upper bound for a partition region to become ready.
    pub region_start_timeout: Duration,

    /// Upper bound for a durable append acknowledgement, including retries.
    pub append_timeout: Duration,

    /// Retries of a transient append failure.
    pub append_max_retries: usize,

    /// Requests buffered per starting partition.
    pub pending_buffer_capacity: usize,

    /// What to do with a request that finds the pending buffer full.
    pub overflow_policy: OverflowPolicy,

    /// Records fetched per catch-up read.
    pub catch_up_batch_size: usize,

    /// Upper bound for rebuilding one partition slice.
    pub catch_up_timeout: Duration,

    /// Upper bound for one health query.
    pub health_check_timeout: Duration,

    /// Interval between reports pushed to a health sink.
    pub health_report_interval: Duration,

    /// Upper bound for stop().
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_name: DEFAULT_ENGINE_NAME.to_string(),
            node_id: NodeId::new(0),
            topic: DEFAULT_STATE_TOPIC.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            spawn_timeout: Duration::from_millis(DEFAULT_SPAWN_TIMEOUT_MS),
            route_timeout: Duration::from_millis(DEFAULT_ROUTE_TIMEOUT_MS),
            region_start_timeout: Duration::from_millis(DEFAULT_REGION_START_TIMEOUT_MS),
            append_timeout: Duration::from_millis(DEFAULT_APPEND_TIMEOUT_MS),
            append_max_retries: DEFAULT_APPEND_MAX_RETRIES,
            pending_buffer_capacity: DEFAULT_PENDING_BUFFER_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            catch_up_batch_size: DEFAULT_CATCH_UP_BATCH_SIZE,
            catch_up_timeout: Duration::from_millis(DEFAULT_CATCH_UP_TIMEOUT_MS),
            health_check_timeout: Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
            health_report_interval: Duration::from_secs(DEFAULT_HEALTH_REPORT_INTERVAL_SECS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Validate the configuration and return any errors found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.engine_name.trim().is_empty() {
            errors.push("engine_name must not be empty".to_string());
        }
        if self.topic.trim().is_empty() {
            errors.push("topic must not be empty".to_string());
        }
        if self.group_id.trim().is_empty() {
            errors.push("group_id must not be empty".to_string());
        }

        let non_zero = [
            ("idle_timeout", self.idle_timeout),
            ("spawn_timeout", self.spawn_timeout),
            ("route_timeout", self.route_timeout),
            ("region_start_timeout", self.region_start_timeout),
            ("append_timeout", self.append_timeout),
            ("catch_up_timeout", self.catch_up_timeout),
            ("health_check_timeout", self.health_check_timeout),
            ("health_report_interval", self.health_report_interval),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                errors.push(format!("{} must be greater than zero", name));
            }
        }

        // A submit that waits for region startup must be able to outlive it.
        if self.route_timeout < self.region_start_timeout {
            errors.push(format!(
                "route_timeout ({:?}) must be at least region_start_timeout ({:?})",
                self.route_timeout, self.region_start_timeout
            ));
        }

        if self.pending_buffer_capacity == 0 {
            errors.push("pending_buffer_capacity must be greater than zero".to_string());
        }
        if self.catch_up_batch_size == 0 {
            errors.push("catch_up_batch_size must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables (all optional, defaults from [`crate::constants`]):
    /// - `SHARDHOLD_ENGINE_NAME`
    /// - `SHARDHOLD_NODE_ID`
    /// - `SHARDHOLD_TOPIC`
    /// - `SHARDHOLD_GROUP_ID`
    /// - `SHARDHOLD_IDLE_TIMEOUT_SECS`
    /// - `SHARDHOLD_SPAWN_TIMEOUT_MS`
    /// - `SHARDHOLD_ROUTE_TIMEOUT_MS`
    /// - `SHARDHOLD_REGION_START_TIMEOUT_MS`
    /// - `SHARDHOLD_APPEND_TIMEOUT_MS`
    /// - `SHARDHOLD_APPEND_MAX_RETRIES`
    /// - `SHARDHOLD_PENDING_BUFFER_CAPACITY`
    /// - `SHARDHOLD_OVERFLOW_POLICY`: "reject" or "drop_oldest"
    /// - `SHARDHOLD_CATCH_UP_BATCH_SIZE`
    /// - `SHARDHOLD_CATCH_UP_TIMEOUT_MS`
    /// - `SHARDHOLD_HEALTH_CHECK_TIMEOUT_MS`
    /// - `SHARDHOLD_HEALTH_REPORT_INTERVAL_SECS`
    /// - `SHARDHOLD_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let engine_name =
            std::env::var("SHARDHOLD_ENGINE_NAME").unwrap_or_else(|_| defaults.engine_name.clone());
        let node_id: u32 = env_or("SHARDHOLD_NODE_ID", defaults.node_id.value())?;
        let topic = std::env::var("SHARDHOLD_TOPIC").unwrap_or_else(|_| defaults.topic.clone());
        let group_id =
            std::env::var("SHARDHOLD_GROUP_ID").unwrap_or_else(|_| defaults.group_id.clone());

        let idle_timeout_secs: u64 =
            env_or("SHARDHOLD_IDLE_TIMEOUT_SECS", defaults.idle_timeout.as_secs())?;
        let spawn_timeout_ms: u64 = env_or(
            "SHARDHOLD_SPAWN_TIMEOUT_MS",
            defaults.spawn_timeout.as_millis() as u64,
        )?;
        let route_timeout_ms: u64 = env_or(
            "SHARDHOLD_ROUTE_TIMEOUT_MS",
            defaults.route_timeout.as_millis() as u64,
        )?;
        let region_start_timeout_ms: u64 = env_or(
            "SHARDHOLD_REGION_START_TIMEOUT_MS",
            defaults.region_start_timeout.as_millis() as u64,
        )?;
        let append_timeout_ms: u64 = env_or(
            "SHARDHOLD_APPEND_TIMEOUT_MS",
            defaults.append_timeout.as_millis() as u64,
        )?;
        let append_max_retries: usize =
            env_or("SHARDHOLD_APPEND_MAX_RETRIES", defaults.append_max_retries)?;
        let pending_buffer_capacity: usize = env_or(
            "SHARDHOLD_PENDING_BUFFER_CAPACITY",
            defaults.pending_buffer_capacity,
        )?;
        let overflow_policy: OverflowPolicy =
            env_or("SHARDHOLD_OVERFLOW_POLICY", defaults.overflow_policy)?;
        let catch_up_batch_size: usize =
            env_or("SHARDHOLD_CATCH_UP_BATCH_SIZE", defaults.catch_up_batch_size)?;
        let catch_up_timeout_ms: u64 = env_or(
            "SHARDHOLD_CATCH_UP_TIMEOUT_MS",
            defaults.catch_up_timeout.as_millis() as u64,
        )?;
        let health_check_timeout_ms: u64 = env_or(
            "SHARDHOLD_HEALTH_CHECK_TIMEOUT_MS",
            defaults.health_check_timeout.as_millis() as u64,
        )?;
        let health_report_interval_secs: u64 = env_or(
            "SHARDHOLD_HEALTH_REPORT_INTERVAL_SECS",
            defaults.health_report_interval.as_secs(),
        )?;
        let shutdown_timeout_ms: u64 = env_or(
            "SHARDHOLD_SHUTDOWN_TIMEOUT_MS",
            defaults.shutdown_timeout.as_millis() as u64,
        )?;

        let config = Self {
            engine_name,
            node_id: NodeId::new(node_id),
            topic,
            group_id,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            spawn_timeout: Duration::from_millis(spawn_timeout_ms),
            route_timeout: Duration::from_millis(route_timeout_ms),
            region_start_timeout: Duration::from_millis(region_start_timeout_ms),
            append_timeout: Duration::from_millis(append_timeout_ms),
            append_max_retries,
            pending_buffer_capacity,
            overflow_policy,
            catch_up_batch_size,
            catch_up_timeout: Duration::from_millis(catch_up_timeout_ms),
            health_check_timeout: Duration::from_millis(health_check_timeout_ms),
            health_report_interval: Duration::from_secs(health_report_interval_secs),
            shutdown_timeout: Duration::from_millis(shutdown_timeout_ms),
        };

        tracing::info!(
            engine = %config.engine_name,
            node_id = %config.node_id,
            topic = %config.topic,
            group_id = %config.group_id,
            idle_timeout_secs,
            pending_buffer_capacity,
            overflow_policy = %config.overflow_policy,
            "Loaded engine configuration"
        );

        if let Err(errors) = config.validate() {
            return Err(format!("Configuration validation failed: {}", errors.join("; ")).into());
        }

        Ok(config)
    }
}
