//! Integration tests for EngineConfig::from_env() and LogFormat::from_env().
//!
//! Environment variables are process-global, so every test here is
//! `#[serial]` and restores whatever it touched.

use std::env;
use std::time::Duration;

use serial_test::serial;
use shardhold::engine::{EngineConfig, OverflowPolicy};
use shardhold::telemetry::LogFormat;
use shardhold::types::NodeId;

/// All environment variables read by EngineConfig::from_env() and LogFormat::from_env().
const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "SHARDHOLD_ENGINE_NAME",
    "SHARDHOLD_NODE_ID",
    "SHARDHOLD_TOPIC",
    "SHARDHOLD_GROUP_ID",
    "SHARDHOLD_IDLE_TIMEOUT_SECS",
    "SHARDHOLD_SPAWN_TIMEOUT_MS",
    "SHARDHOLD_ROUTE_TIMEOUT_MS",
    "SHARDHOLD_REGION_START_TIMEOUT_MS",
    "SHARDHOLD_APPEND_TIMEOUT_MS",
    "SHARDHOLD_APPEND_MAX_RETRIES",
    "SHARDHOLD_PENDING_BUFFER_CAPACITY",
    "SHARDHOLD_OVERFLOW_POLICY",
    "SHARDHOLD_CATCH_UP_BATCH_SIZE",
    "SHARDHOLD_CATCH_UP_TIMEOUT_MS",
    "SHARDHOLD_HEALTH_CHECK_TIMEOUT_MS",
    "SHARDHOLD_HEALTH_REPORT_INTERVAL_SECS",
    "SHARDHOLD_SHUTDOWN_TIMEOUT_MS",
    "SHARDHOLD_LOG_FORMAT",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables, then restore them.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(value) => unsafe { env::set_var(key, value) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// EngineConfig
// ============================================================================

#[test]
#[serial]
fn test_from_env_defaults() {
    let config = with_env_vars(&[], || EngineConfig::from_env().unwrap());
    let defaults = EngineConfig::default();

    assert_eq!(config.engine_name, defaults.engine_name);
    assert_eq!(config.node_id, defaults.node_id);
    assert_eq!(config.topic, defaults.topic);
    assert_eq!(config.group_id, defaults.group_id);
    assert_eq!(config.idle_timeout, Duration::from_secs(300));
    assert_eq!(config.overflow_policy, OverflowPolicy::Reject);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    let config = with_env_vars(
        &[
            ("SHARDHOLD_ENGINE_NAME", "orders"),
            ("SHARDHOLD_NODE_ID", "7"),
            ("SHARDHOLD_TOPIC", "orders-state"),
            ("SHARDHOLD_GROUP_ID", "orders-engine"),
            ("SHARDHOLD_IDLE_TIMEOUT_SECS", "60"),
            ("SHARDHOLD_ROUTE_TIMEOUT_MS", "20000"),
            ("SHARDHOLD_APPEND_MAX_RETRIES", "2"),
            ("SHARDHOLD_PENDING_BUFFER_CAPACITY", "64"),
            ("SHARDHOLD_OVERFLOW_POLICY", "drop_oldest"),
            ("SHARDHOLD_CATCH_UP_BATCH_SIZE", "128"),
        ],
        || EngineConfig::from_env().unwrap(),
    );

    assert_eq!(config.engine_name, "orders");
    assert_eq!(config.node_id, NodeId::new(7));
    assert_eq!(config.topic, "orders-state");
    assert_eq!(config.group_id, "orders-engine");
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.route_timeout, Duration::from_millis(20_000));
    assert_eq!(config.append_max_retries, 2);
    assert_eq!(config.pending_buffer_capacity, 64);
    assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
    assert_eq!(config.catch_up_batch_size, 128);
}

#[test]
#[serial]
fn test_from_env_rejects_unparsable_numbers() {
    let result = with_env_vars(&[("SHARDHOLD_NODE_ID", "not-a-number")], EngineConfig::from_env);
    let message = result.unwrap_err().to_string();
    assert!(message.contains("SHARDHOLD_NODE_ID"), "{}", message);
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_overflow_policy() {
    let result = with_env_vars(&[("SHARDHOLD_OVERFLOW_POLICY", "block")], EngineConfig::from_env);
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_from_env_validates_result() {
    let result = with_env_vars(
        &[
            ("SHARDHOLD_ROUTE_TIMEOUT_MS", "100"),
            ("SHARDHOLD_REGION_START_TIMEOUT_MS", "5000"),
        ],
        EngineConfig::from_env,
    );
    let message = result.unwrap_err().to_string();
    assert!(message.contains("route_timeout"), "{}", message);
}

// ============================================================================
// LogFormat
// ============================================================================

#[test]
#[serial]
fn test_log_format_from_env() {
    assert_eq!(with_env_vars(&[], LogFormat::from_env), LogFormat::Pretty);
    assert_eq!(
        with_env_vars(&[("LOG_FORMAT", "json")], LogFormat::from_env),
        LogFormat::Json
    );
    assert_eq!(
        with_env_vars(
            &[("SHARDHOLD_LOG_FORMAT", "pretty"), ("LOG_FORMAT", "json")],
            LogFormat::from_env
        ),
        LogFormat::Pretty
    );
}
