//! Named background task registry.
//!
//! Each long-lived component spawns its loops (assignment consumer, state
//! store tail, rebalance loop, health reporter) through a
//! `BackgroundTaskRegistry` so that they share one shutdown signal, can be
//! listed in health checks, and are awaited on stop.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardhold::engine::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = BackgroundTaskRegistry::new();
//!
//!     registry.spawn("ticker", |mut shutdown| async move {
//!         loop {
//!             tokio::select! {
//!                 _ = shutdown.recv() => break,
//!                 _ = tokio::time::sleep(Duration::from_secs(1)) => {}
//!             }
//!         }
//!     });
//!
//!     assert!(registry.all_healthy());
//!     registry.shutdown_all(Duration::from_secs(1)).await;
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Registry of named tasks sharing one shutdown signal.
pub struct BackgroundTaskRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackgroundTaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTaskRegistry")
            .field("tasks", &self.task_count())
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Spawn a named task.
    ///
    /// `task` receives the shutdown receiver and should exit promptly once it
    /// fires; tasks still running when the shutdown deadline passes are aborted.
    /// A task already registered under `name` is aborted first.
    ///
    /// Returns `false` (and spawns nothing) once shutdown has begun.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F) -> bool
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::warn!(task = %name, "Ignoring spawn during shutdown");
            return false;
        }

        let future = task(self.shutdown_tx.subscribe());
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            future.await;
            tracing::debug!(task = %task_name, "Task completed");
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = tasks.insert(name.clone(), handle) {
            old.abort();
            tracing::debug!(task = %name, "Aborted previous task instance");
        }
        tracing::debug!(task = %name, "Spawned background task");
        true
    }

    /// Check if every registered task is still running.
    pub fn all_healthy(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.values().all(|handle| !handle.is_finished())
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Signal shutdown and wait for every task, aborting those still running
    /// after `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().collect()
        };
        tracing::debug!(task_count = tasks.len(), "Stopping background tasks");

        let _ = self.shutdown_tx.send(());
        let deadline = tokio::time::Instant::now() + timeout;

        for (name, handle) in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = handle.abort_handle();
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => tracing::debug!(task = %name, "Task shutdown complete"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = %name, "Task did not respond to shutdown, aborting");
                    abort.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let registry = BackgroundTaskRegistry::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        registry.spawn("waiter", move |mut shutdown| async move {
            let _ = shutdown.recv().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(registry.task_count(), 1);
        assert!(registry.all_healthy());

        registry.shutdown_all(Duration::from_secs(1)).await;
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_rejected_after_shutdown() {
        let registry = BackgroundTaskRegistry::new();
        registry.shutdown_all(Duration::from_millis(10)).await;
        assert!(!registry.spawn("late", |_| async {}));
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_finished_task_reported() {
        let registry = BackgroundTaskRegistry::new();
        registry.spawn("oneshot", |_| async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.all_healthy());
    }

    #[tokio::test]
    async fn test_unresponsive_task_aborted() {
        let registry = BackgroundTaskRegistry::new();
        registry.spawn("stubborn", |_| futures::future::pending::<()>());
        let started = std::time::Instant::now();
        registry.shutdown_all(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
