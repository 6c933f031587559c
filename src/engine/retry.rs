//! Retry policies for the durable log boundary.
//!
//! All policies are `backon` exponential backoffs with jitter so that the
//! writers of many partitions recovering from the same broker hiccup do not
//! retry in lockstep.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `append_policy` | 10ms | 1s | configurable | ProducerCoordinator appends |
//! | `catch_up_policy` | 50ms | 2s | 5 | State store catch-up reads |
//! | `slice_restart_policy` | 100ms | 5s | unbounded | Restarting a failed catch-up |
//!
//! # Example
//!
//! ```rust,no_run
//! use shardhold::engine::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let value = (|| async { Ok::<_, std::io::Error>(7) })
//!         .retry(retry::catch_up_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     assert_eq!(value, 7);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use super::log::LogError;

/// Policy for appends through a ProducerCoordinator.
///
/// Only transient log errors are retried; `max_retries` comes from the
/// engine configuration.
pub fn append_policy(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Policy for catch-up reads of a partition slice.
pub fn catch_up_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Longest pause between two catch-up attempts of one slice.
pub const SLICE_RESTART_MAX_DELAY: Duration = Duration::from_secs(5);

/// Delays between whole catch-up attempts of a slice whose previous attempt
/// failed. The slice keeps retrying for as long as it stays assigned.
pub fn slice_restart_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(SLICE_RESTART_MAX_DELAY)
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Run a log operation under `policy`, retrying only retriable [`LogError`]s
/// and recording every attempt under `policy_name`.
pub async fn with_log_retry<F, Fut, T>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
) -> Result<T, LogError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LogError>>,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(policy)
        .when(|e: &LogError| {
            let retry = e.is_retriable();
            if retry {
                attempt += 1;
                record_retry_attempt(policy_name, attempt);
            }
            retry
        })
        .await;

    match &result {
        Ok(_) if attempt > 0 => record_retry_success(policy_name),
        Err(e) if e.is_retriable() => record_retry_exhausted(policy_name),
        _ => {}
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a success after at least one retry.
pub fn record_retry_success(policy_name: &str) {
    super::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // ========================================================================
    // Retry Behavior Tests
    // ========================================================================

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let attempts = AtomicU32::new(0);

        let result = with_log_retry("test", append_policy(3), || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(LogError::Transient("broker busy".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), LogError> = with_log_retry("test", append_policy(3), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LogError::Serialization("bad payload".into()))
        })
        .await;

        assert_eq!(result, Err(LogError::Serialization("bad payload".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_bounded() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), LogError> = with_log_retry("test", append_policy(2), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LogError::Transient("down".into()))
        })
        .await;

        assert!(result.is_err());
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_single_attempt() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), LogError> = with_log_retry("test", append_policy(0), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(LogError::Transient("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    // ========================================================================
    // Policy Shape Tests
    // ========================================================================

    #[test]
    fn test_slice_restart_policy_never_runs_out() {
        use backon::BackoffBuilder;

        let delays: Vec<Duration> = slice_restart_policy().build().take(64).collect();
        assert_eq!(delays.len(), 64);
        assert!(delays[0] >= Duration::from_millis(100));
        assert!(delays.iter().all(|d| *d <= SLICE_RESTART_MAX_DELAY * 2));
    }
}
