//! Engine lifecycle: construction, start/stop/restart and health.
//!
//! An [`Engine`] wires one [`Aggregate`] to a [`DurableLog`]:
//!
//! 1. `start` joins the consumer group, starts the assignment tracker, the
//!    state store tail and the router's rebalance task.
//! 2. `stop` tears down in reverse: router (drains every region), state store,
//!    tracker, then leaves the group. The whole sequence is bounded by the
//!    shutdown timeout.
//!
//! Components are rebuilt on every start, so a stopped engine can be started
//! again. Start, stop and restart serialize on one lifecycle lock.
//!
//! Engine names are unique per process: building a second engine with the
//! same name fails with [`EngineError::DuplicateEngine`] until the first one
//! is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use super::actor::CommandReply;
use super::aggregate::{Aggregate, AggregateCodecs};
use super::background_tasks::BackgroundTaskRegistry;
use super::config::EngineConfig;
use super::health::{HealthCheck, HealthReport, HealthSink, roll_up, run_checks};
use super::log::DurableLog;
use super::metrics;
use super::partitioner::{Murmur2Partitioner, Partitioner};
use super::region::RegionConfig;
use super::router::{PartitionRouter, RouterConfig};
use super::state_store::{MaterializedStateStore, StoreConfig};
use super::tracker::PartitionAssignmentTracker;
use crate::constants::PRODUCER_QUEUE_CAPACITY;
use crate::error::{EngineError, EngineResult, SubmitError, TimeoutKind};
use crate::types::{AggregateKey, PartitionId};

/// Engine lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EngineStatus {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl EngineStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EngineStatus::Starting,
            2 => EngineStatus::Running,
            3 => EngineStatus::Stopping,
            _ => EngineStatus::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Stopped => "stopped",
            EngineStatus::Starting => "starting",
            EngineStatus::Running => "running",
            EngineStatus::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Process-wide name registry
// ============================================================================

static ENGINE_NAMES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Holds an engine name in the process registry until dropped.
#[derive(Debug)]
struct NameGuard(String);

impl NameGuard {
    fn acquire(name: &str) -> EngineResult<Self> {
        let mut names = ENGINE_NAMES.lock().unwrap_or_else(|e| e.into_inner());
        if !names.insert(name.to_string()) {
            return Err(EngineError::DuplicateEngine {
                name: name.to_string(),
            });
        }
        Ok(NameGuard(name.to_string()))
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        let mut names = ENGINE_NAMES.lock().unwrap_or_else(|e| e.into_inner());
        names.remove(&self.0);
    }
}

/// Adds +/- 15% jitter so reporters of several engines do not fire in lockstep.
fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and builds an [`Engine`].
pub struct EngineBuilder<A: Aggregate> {
    aggregate: A,
    log: Arc<dyn DurableLog>,
    codecs: AggregateCodecs<A>,
    config: EngineConfig,
    partitioner: Option<Arc<dyn Partitioner>>,
    health_sink: Option<Arc<dyn HealthSink>>,
}

impl<A: Aggregate> EngineBuilder<A> {
    /// Builder using JSON for state and events.
    pub fn new(aggregate: A, log: Arc<dyn DurableLog>) -> Self
    where
        A::State: Serialize + DeserializeOwned,
        A::Event: Serialize + DeserializeOwned,
    {
        Self::with_codecs(aggregate, log, AggregateCodecs::json())
    }

    pub fn with_codecs(aggregate: A, log: Arc<dyn DurableLog>, codecs: AggregateCodecs<A>) -> Self {
        Self {
            aggregate,
            log,
            codecs,
            config: EngineConfig::default(),
            partitioner: None,
            health_sink: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default murmur2 partitioner.
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    /// Push a health report to `sink` every `health_report_interval` while running.
    pub fn health_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.health_sink = Some(sink);
        self
    }

    pub fn build(self) -> EngineResult<Engine<A>> {
        self.config
            .validate()
            .map_err(|errors| EngineError::Config(errors.join("; ")))?;

        let partition_count = self.log.partition_count();
        if partition_count == 0 {
            return Err(EngineError::Config("log has no partitions".to_string()));
        }
        let partitioner = self
            .partitioner
            .unwrap_or_else(|| Arc::new(Murmur2Partitioner::new(partition_count)) as Arc<dyn Partitioner>);
        if partitioner.partition_count() != partition_count {
            return Err(EngineError::Config(format!(
                "partitioner covers {} partitions but the log has {}",
                partitioner.partition_count(),
                partition_count
            )));
        }

        let name = NameGuard::acquire(&self.config.engine_name)?;
        metrics::init_metrics();
        info!(
            engine = %self.config.engine_name,
            node_id = %self.config.node_id,
            partitions = partition_count,
            "Engine built"
        );

        Ok(Engine {
            aggregate: Arc::new(self.aggregate),
            codecs: self.codecs,
            log: self.log,
            partitioner,
            health_sink: self.health_sink,
            config: self.config,
            status: Arc::new(AtomicU8::new(EngineStatus::Stopped as u8)),
            lifecycle: tokio::sync::Mutex::new(()),
            components: RwLock::new(None),
            _name: name,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Everything that lives for one start..stop cycle.
struct Components<A: Aggregate> {
    tracker: Arc<PartitionAssignmentTracker>,
    store: Arc<MaterializedStateStore>,
    router: Arc<PartitionRouter<A>>,
    tasks: BackgroundTaskRegistry,
}

impl<A: Aggregate> Components<A> {
    fn checks(&self) -> Vec<Arc<dyn HealthCheck>> {
        vec![
            self.tracker.clone() as Arc<dyn HealthCheck>,
            self.store.clone() as Arc<dyn HealthCheck>,
            self.router.clone() as Arc<dyn HealthCheck>,
        ]
    }
}

/// Partition-aware single-writer engine for one aggregate type.
pub struct Engine<A: Aggregate> {
    config: EngineConfig,
    aggregate: Arc<A>,
    codecs: AggregateCodecs<A>,
    log: Arc<dyn DurableLog>,
    partitioner: Arc<dyn Partitioner>,
    health_sink: Option<Arc<dyn HealthSink>>,
    status: Arc<AtomicU8>,
    lifecycle: tokio::sync::Mutex<()>,
    components: RwLock<Option<Arc<Components<A>>>>,
    _name: NameGuard,
}

impl<A: Aggregate> std::fmt::Debug for Engine<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.config.engine_name)
            .field("node_id", &self.config.node_id)
            .field("status", &self.status())
            .finish()
    }
}

impl<A: Aggregate> Engine<A> {
    pub fn builder(aggregate: A, log: Arc<dyn DurableLog>) -> EngineBuilder<A>
    where
        A::State: Serialize + DeserializeOwned,
        A::Event: Serialize + DeserializeOwned,
    {
        EngineBuilder::new(aggregate, log)
    }

    pub fn name(&self) -> &str {
        &self.config.engine_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == EngineStatus::Running
    }

    fn transition(&self, from: EngineStatus, to: EngineStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn components(&self) -> Option<Arc<Components<A>>> {
        self.components
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn running_components(&self) -> EngineResult<Arc<Components<A>>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.components().ok_or(EngineError::NotRunning)
    }

    /// Join the group and start serving assigned partitions.
    ///
    /// Starting an engine that is already starting or running is a no-op and
    /// returns at once.
    pub async fn start(&self) -> EngineResult<()> {
        if matches!(self.status(), EngineStatus::Starting | EngineStatus::Running) {
            return Ok(());
        }
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> EngineResult<()> {
        if !self.transition(EngineStatus::Stopped, EngineStatus::Starting) {
            return Ok(());
        }

        match self.start_components().await {
            Ok(components) => {
                *self.components.write().unwrap_or_else(|e| e.into_inner()) = Some(components);
                self.status
                    .store(EngineStatus::Running as u8, Ordering::SeqCst);
                info!(engine = %self.config.engine_name, node_id = %self.config.node_id, "Engine started");
                Ok(())
            }
            Err(e) => {
                self.status
                    .store(EngineStatus::Stopped as u8, Ordering::SeqCst);
                error!(engine = %self.config.engine_name, error = %e, "Engine failed to start");
                Err(e)
            }
        }
    }

    async fn start_components(&self) -> EngineResult<Arc<Components<A>>> {
        let config = &self.config;
        let subscription = self
            .log
            .subscribe(&config.topic, &config.group_id, config.node_id)
            .await
            .map_err(EngineError::Log)?;

        let tracker = Arc::new(PartitionAssignmentTracker::new(config.node_id));
        let store = Arc::new(MaterializedStateStore::new(
            Arc::clone(&self.log),
            Arc::clone(&self.partitioner),
            StoreConfig {
                catch_up_batch_size: config.catch_up_batch_size,
                catch_up_timeout: config.catch_up_timeout,
            },
        ));
        let router = Arc::new(PartitionRouter::new(
            RouterConfig {
                node: config.node_id,
                route_timeout: config.route_timeout,
                region_start_timeout: config.region_start_timeout,
                pending_buffer_capacity: config.pending_buffer_capacity,
                overflow_policy: config.overflow_policy,
                shutdown_timeout: config.shutdown_timeout,
                region: RegionConfig {
                    idle_timeout: config.idle_timeout,
                    spawn_timeout: config.spawn_timeout,
                    append_timeout: config.append_timeout,
                    append_max_retries: config.append_max_retries,
                    producer_queue_capacity: PRODUCER_QUEUE_CAPACITY,
                },
            },
            Arc::clone(&self.partitioner),
            Arc::clone(&tracker),
            Arc::clone(&store),
            Arc::clone(&self.log),
            Arc::clone(&self.aggregate),
            self.codecs.clone(),
        ));

        // Store first so no committed record is missed once slices are assigned.
        store.start_tail(subscription.records);
        router.start();
        tracker.start(subscription.assignments);

        let components = Arc::new(Components {
            tracker,
            store,
            router,
            tasks: BackgroundTaskRegistry::new(),
        });
        if let Some(sink) = &self.health_sink {
            self.spawn_reporter(&components, Arc::clone(sink));
        }
        Ok(components)
    }

    fn spawn_reporter(&self, components: &Arc<Components<A>>, sink: Arc<dyn HealthSink>) {
        let checks = components.checks();
        let status = Arc::clone(&self.status);
        let engine = self.config.engine_name.clone();
        let interval = self.config.health_report_interval;
        let timeout = self.config.health_check_timeout;

        components.tasks.spawn("health-reporter", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(with_jitter(interval)) => {
                        let status = EngineStatus::from_u8(status.load(Ordering::SeqCst));
                        let report = build_report(&engine, status, &checks, timeout).await;
                        sink.report(report).await;
                    }
                }
            }
        });
    }

    /// Stop serving, drain every region and leave the group.
    pub async fn stop(&self) -> EngineResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> EngineResult<()> {
        if !self.transition(EngineStatus::Running, EngineStatus::Stopping) {
            return Ok(());
        }
        let started = Instant::now();
        let components = self
            .components
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let timeout = self.config.shutdown_timeout;
        let result = match components {
            Some(components) => {
                let teardown = async {
                    components.tasks.shutdown_all(timeout).await;
                    components.router.shutdown().await;
                    components.store.shutdown(timeout).await;
                    components.tracker.shutdown(timeout).await;
                };
                let result = match tokio::time::timeout(timeout, teardown).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        warn!(engine = %self.config.engine_name, "Engine shutdown timed out");
                        Err(EngineError::timeout(TimeoutKind::Shutdown, timeout))
                    }
                };
                if let Err(e) = self
                    .log
                    .unsubscribe(&self.config.group_id, self.config.node_id)
                    .await
                {
                    warn!(engine = %self.config.engine_name, error = %e, "Failed to leave consumer group");
                }
                result
            }
            None => Ok(()),
        };

        self.status
            .store(EngineStatus::Stopped as u8, Ordering::SeqCst);
        info!(
            engine = %self.config.engine_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Engine stopped"
        );
        result
    }

    /// Stop, then start again.
    pub async fn restart(&self) -> EngineResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Execute `command` against the aggregate identified by `key`.
    pub async fn submit(
        &self,
        key: impl Into<AggregateKey>,
        command: A::Command,
    ) -> Result<CommandReply<A>, SubmitError<A::Error>> {
        let components = self.running_components()?;
        components.router.submit(key.into(), command).await
    }

    /// Latest committed state of `key` from the state store.
    ///
    /// Only answers for partitions this node owns.
    pub fn get_state(&self, key: impl Into<AggregateKey>) -> EngineResult<Option<A::State>> {
        let components = self.running_components()?;
        let key = key.into();
        match components.store.get(&key)? {
            Some(snapshot) => self.codecs.state.decode(&snapshot.state).map(Some),
            None => Ok(None),
        }
    }

    /// Partition `key` maps to.
    pub fn partition_of(&self, key: &AggregateKey) -> PartitionId {
        self.partitioner.partition_of(key)
    }

    /// Partitions with a ready region on this node.
    pub fn ready_partitions(&self) -> Vec<PartitionId> {
        self.components()
            .map(|c| c.router.ready_partitions())
            .unwrap_or_default()
    }

    /// Live actors across every region on this node.
    pub fn active_actors(&self) -> usize {
        self.components()
            .map(|c| c.router.active_actors())
            .unwrap_or(0)
    }

    /// Check if writes are currently refused because membership was lost.
    pub fn is_stale(&self) -> bool {
        self.components().is_some_and(|c| c.tracker.is_stale())
    }

    /// Run every component check, each bounded by `timeout`.
    pub async fn health(&self, timeout: Duration) -> HealthReport {
        let checks = self
            .components()
            .map(|c| c.checks())
            .unwrap_or_default();
        build_report(&self.config.engine_name, self.status(), &checks, timeout).await
    }
}

async fn build_report(
    engine: &str,
    status: EngineStatus,
    checks: &[Arc<dyn HealthCheck>],
    timeout: Duration,
) -> HealthReport {
    let components = run_checks(checks, timeout).await;
    HealthReport {
        engine: engine.to_string(),
        status,
        state: roll_up(status == EngineStatus::Running, &components),
        components,
        checked_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_u8() {
        for status in [
            EngineStatus::Stopped,
            EngineStatus::Starting,
            EngineStatus::Running,
            EngineStatus::Stopping,
        ] {
            assert_eq!(EngineStatus::from_u8(status as u8), status);
        }
        assert_eq!(EngineStatus::from_u8(42), EngineStatus::Stopped);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EngineStatus::Running).unwrap(),
            r#""running""#
        );
    }

    #[test]
    fn test_name_guard_released_on_drop() {
        let guard = NameGuard::acquire("lifecycle-unit-guard").unwrap();
        assert!(matches!(
            NameGuard::acquire("lifecycle-unit-guard"),
            Err(EngineError::DuplicateEngine { .. })
        ));
        drop(guard);
        assert!(NameGuard::acquire("lifecycle-unit-guard").is_ok());
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_millis(8500));
            assert!(jittered <= Duration::from_millis(11500));
        }
    }
}
