//! Prometheus metrics for the engine.
//!
//! Metrics cover:
//! - Command routing (count and latency per outcome)
//! - Actor population and evictions
//! - Partition ownership and rebalances
//! - Pending request buffers and overflows
//! - Producer appends and retries
//! - State store size and catch-up
//!
//! All metrics are registered to a custom registry with the "shardhold" prefix
//! to avoid name collisions with other libraries using the default registry.
//! A metric that fails to register is still returned (unregistered) rather than
//! panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for engine metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("shardhold".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Routing
// =============================================================================

define_counter_vec!(
    COMMANDS_TOTAL,
    "commands_total",
    "Commands submitted, by outcome",
    ["outcome"]
);
define_histogram_vec!(
    COMMAND_DURATION,
    "command_duration_seconds",
    "End-to-end submit latency, by outcome",
    ["outcome"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
);
define_gauge!(
    PENDING_REQUESTS,
    "pending_requests",
    "Requests queued for partitions whose region is starting"
);
define_counter!(
    PENDING_OVERFLOWS,
    "pending_overflows_total",
    "Requests failed because a pending buffer was full"
);

// =============================================================================
// Actors
// =============================================================================

define_gauge!(ACTIVE_ACTORS, "active_actors", "Live aggregate actors");
define_counter_vec!(
    ACTOR_STOPS,
    "actor_stops_total",
    "Aggregate actors stopped, by reason",
    ["reason"]
);

// =============================================================================
// Ownership
// =============================================================================

define_gauge!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Partitions this node serves"
);
define_gauge!(ASSIGNMENT_EPOCH, "assignment_epoch", "Latest assignment epoch");
define_counter_vec!(
    REBALANCES,
    "rebalance_partitions_total",
    "Partitions assigned or revoked by rebalances",
    ["direction"]
);
define_gauge!(
    ASSIGNMENT_STALE,
    "assignment_stale",
    "1 while group membership is lost"
);
define_counter_vec!(
    STALE_TRANSITIONS,
    "assignment_stale_transitions_total",
    "Stale mode transitions",
    ["direction"]
);

// =============================================================================
// Producer
// =============================================================================

define_counter_vec!(
    APPENDS_TOTAL,
    "appends_total",
    "Appends to the durable log, by status",
    ["status"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);
define_histogram_vec!(
    APPEND_DURATION,
    "append_duration_seconds",
    "Durable append latency including retries",
    ["status"],
    [0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
);

// =============================================================================
// State store
// =============================================================================

define_gauge_vec!(
    STORE_KEYS,
    "state_store_keys",
    "Keys materialized per partition",
    ["partition"]
);
define_counter_vec!(
    CATCH_UPS,
    "state_store_catch_ups_total",
    "Partition slice catch-ups, by status",
    ["status"]
);

// =============================================================================
// Safe Registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
pub fn init_metrics() {
    let _ = &*COMMANDS_TOTAL;
    let _ = &*COMMAND_DURATION;
    let _ = &*PENDING_REQUESTS;
    let _ = &*PENDING_OVERFLOWS;
    let _ = &*ACTIVE_ACTORS;
    let _ = &*ACTOR_STOPS;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*ASSIGNMENT_EPOCH;
    let _ = &*REBALANCES;
    let _ = &*ASSIGNMENT_STALE;
    let _ = &*STALE_TRANSITIONS;
    let _ = &*APPENDS_TOTAL;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*APPEND_DURATION;
    let _ = &*STORE_KEYS;
    let _ = &*CATCH_UPS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording Helpers
// =============================================================================

/// Record the outcome of one submit.
pub fn record_command(outcome: &str, duration_secs: f64) {
    COMMANDS_TOTAL.with_label_values(&[outcome]).inc();
    COMMAND_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn record_pending_overflow() {
    PENDING_OVERFLOWS.inc();
}

pub fn record_actor_started() {
    ACTIVE_ACTORS.inc();
}

/// Record an actor exit (`idle`, `handoff`, `recovery_failed`, `closed`).
pub fn record_actor_stopped(reason: &str) {
    ACTIVE_ACTORS.dec();
    ACTOR_STOPS.with_label_values(&[reason]).inc();
}

pub fn record_assignment(epoch: u64, owned: usize) {
    ASSIGNMENT_EPOCH.set(epoch as i64);
    OWNED_PARTITIONS.set(owned as i64);
}

pub fn record_rebalance(assigned: usize, revoked: usize) {
    REBALANCES
        .with_label_values(&["assigned"])
        .inc_by(assigned as u64);
    REBALANCES
        .with_label_values(&["revoked"])
        .inc_by(revoked as u64);
}

pub fn set_assignment_stale(stale: bool) {
    ASSIGNMENT_STALE.set(i64::from(stale));
    let direction = if stale { "enter" } else { "exit" };
    STALE_TRANSITIONS.with_label_values(&[direction]).inc();
}

pub fn record_append(status: &str, duration_secs: f64) {
    APPENDS_TOTAL.with_label_values(&[status]).inc();
    APPEND_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn set_store_keys(partition: u32, keys: usize) {
    STORE_KEYS
        .with_label_values(&[&partition.to_string()])
        .set(keys as i64);
}

pub fn clear_store_keys(partition: u32) {
    let _ = STORE_KEYS.remove_label_values(&[&partition.to_string()]);
}

pub fn record_catch_up(status: &str) {
    CATCH_UPS.with_label_values(&[status]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_contains_prefix() {
        init_metrics();
        record_command("ok", 0.001);
        let text = encode_metrics().unwrap();
        assert!(text.contains("shardhold_commands_total"));
    }

    #[test]
    fn test_store_keys_gauge_roundtrip() {
        set_store_keys(42, 7);
        assert_eq!(STORE_KEYS.with_label_values(&["42"]).get(), 7);
        clear_store_keys(42);
    }
}
