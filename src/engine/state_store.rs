//! Materialized key-to-state projection of the durable log.
//!
//! The store keeps one slice per partition assigned to this node. Every
//! committed [`EventEnvelope`](crate::types::EventEnvelope) carries the state
//! it leads to, so a slice is simply "latest envelope per key", deduplicated
//! by sequence marker. Applying the same record twice is therefore a no-op.
//!
//! # Slice lifecycle
//!
//! - [`assign`](MaterializedStateStore::assign) creates the slice in
//!   `CatchingUp` and reads the partition from offset 0 up to the high
//!   watermark captured when the catch-up began, in bounded batches.
//! - Once caught up the slice is `Ready` and serves lookups. It is kept
//!   current by local commits ([`on_commit`](MaterializedStateStore::on_commit))
//!   and by the live tail of the log's record broadcast.
//! - A failed catch-up keeps the slice `CatchingUp` and retries with backoff
//!   until it succeeds or the slice is revoked.
//! - [`revoke`](MaterializedStateStore::revoke) drops the slice.
//!
//! Lookups for an unassigned partition fail with `NotOwner`; lookups for a
//! slice still catching up fail with `NotReady`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::background_tasks::BackgroundTaskRegistry;
use super::health::{ComponentHealth, HealthCheck};
use super::log::DurableLog;
use super::metrics;
use super::partitioner::Partitioner;
use super::retry::{
    SLICE_RESTART_MAX_DELAY, catch_up_policy, slice_restart_policy, with_log_retry,
};
use super::slice_state::SliceState;
use crate::error::{EngineError, EngineResult, TimeoutKind};
use crate::types::{AggregateKey, CommittedRecord, Offset, PartitionId, Sequence};

/// Latest committed state of one aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub sequence: Sequence,
    pub offset: Offset,
    pub state: Bytes,
}

/// Catch-up bounds.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub catch_up_batch_size: usize,
    pub catch_up_timeout: Duration,
}

struct PartitionSlice {
    state: SliceState,
    /// Incarnation of this slice; a catch-up only touches the incarnation it was started for.
    generation: u64,
    entries: HashMap<AggregateKey, StateSnapshot>,
    ready_tx: watch::Sender<bool>,
}

impl PartitionSlice {
    fn new(generation: u64) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            state: SliceState::catching_up(),
            generation,
            entries: HashMap::new(),
            ready_tx,
        }
    }

    /// Apply `record` unless an equal or newer sequence is already stored.
    fn apply(&mut self, record: &CommittedRecord) -> bool {
        if let Some(existing) = self.entries.get(record.key()) {
            if existing.sequence >= record.sequence() {
                return false;
            }
        }
        self.entries.insert(
            record.key().clone(),
            StateSnapshot {
                sequence: record.sequence(),
                offset: record.offset,
                state: record.envelope.state.clone(),
            },
        );
        true
    }
}

/// Per-partition key-to-state store fed by the durable log.
pub struct MaterializedStateStore {
    log: Arc<dyn DurableLog>,
    partitioner: Arc<dyn Partitioner>,
    config: StoreConfig,
    slices: DashMap<PartitionId, PartitionSlice>,
    catch_ups: DashMap<PartitionId, JoinHandle<()>>,
    next_generation: AtomicU64,
    tasks: BackgroundTaskRegistry,
    tail_running: AtomicBool,
}

impl std::fmt::Debug for MaterializedStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterializedStateStore")
            .field("slices", &self.slices.len())
            .field("config", &self.config)
            .finish()
    }
}

impl MaterializedStateStore {
    pub fn new(
        log: Arc<dyn DurableLog>,
        partitioner: Arc<dyn Partitioner>,
        config: StoreConfig,
    ) -> Self {
        Self {
            log,
            partitioner,
            config,
            slices: DashMap::new(),
            catch_ups: DashMap::new(),
            next_generation: AtomicU64::new(1),
            tasks: BackgroundTaskRegistry::new(),
            tail_running: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Latest committed state for `key`, or `None` if the key has no history.
    pub fn get(&self, key: &AggregateKey) -> EngineResult<Option<StateSnapshot>> {
        let partition = self.partitioner.partition_of(key);
        self.get_in(partition, key)
    }

    /// Like [`get`](Self::get) with the partition already resolved.
    pub fn get_in(
        &self,
        partition: PartitionId,
        key: &AggregateKey,
    ) -> EngineResult<Option<StateSnapshot>> {
        match self.slices.get(&partition) {
            None => Err(EngineError::NotOwner { partition }),
            Some(slice) if !slice.state.is_ready() => Err(EngineError::NotReady { partition }),
            Some(slice) => Ok(slice.entries.get(key).cloned()),
        }
    }

    /// Check if the slice for `partition` serves lookups.
    pub fn is_ready(&self, partition: PartitionId) -> bool {
        self.slices
            .get(&partition)
            .is_some_and(|slice| slice.state.is_ready())
    }

    /// Lifecycle state name of the slice for `partition`, if assigned.
    pub fn slice_state(&self, partition: PartitionId) -> Option<&'static str> {
        self.slices.get(&partition).map(|slice| slice.state.name())
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn key_count(&self) -> usize {
        self.slices.iter().map(|slice| slice.entries.len()).sum()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a committed record to its partition's slice.
    ///
    /// Returns `true` if the stored state changed. Records for unassigned
    /// partitions and records not newer than the stored sequence are ignored.
    pub fn on_commit(&self, record: &CommittedRecord) -> bool {
        let partition = record.partition();
        let Some(mut slice) = self.slices.get_mut(&partition) else {
            return false;
        };
        let applied = slice.apply(record);
        if applied {
            metrics::set_store_keys(partition.value(), slice.entries.len());
        }
        applied
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Start serving `partitions`. Each new slice catches up in the background.
    pub fn assign(self: &Arc<Self>, partitions: impl IntoIterator<Item = PartitionId>) {
        for partition in partitions {
            if self.slices.contains_key(&partition) {
                continue;
            }
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            self.slices
                .insert(partition, PartitionSlice::new(generation));
            info!(partition = %partition, "Assigned state store slice");
            self.spawn_catch_up(partition, generation);
        }
    }

    /// Stop serving `partitions` and discard their slices.
    pub fn revoke(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        for partition in partitions {
            if let Some((_, handle)) = self.catch_ups.remove(&partition) {
                handle.abort();
            }
            if let Some((_, slice)) = self.slices.remove(&partition) {
                info!(
                    partition = %partition,
                    keys = slice.entries.len(),
                    state = slice.state.name(),
                    "Revoked state store slice"
                );
                metrics::clear_store_keys(partition.value());
            }
        }
    }

    /// Wait until the slice for `partition` is ready.
    ///
    /// Fails with `NotOwner` if the partition is not assigned here, `NotReady`
    /// if the slice is revoked while waiting, and `Timeout` after `timeout`.
    pub async fn wait_ready(&self, partition: PartitionId, timeout: Duration) -> EngineResult<()> {
        let mut ready_rx = match self.slices.get(&partition) {
            Some(slice) => slice.ready_tx.subscribe(),
            None => return Err(EngineError::NotOwner { partition }),
        };

        let wait = async {
            loop {
                if *ready_rx.borrow_and_update() {
                    return Ok(());
                }
                if ready_rx.changed().await.is_err() {
                    // Slice dropped: the partition was revoked.
                    return Err(EngineError::NotReady { partition });
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| EngineError::timeout(TimeoutKind::RegionStart, timeout))?
    }

    fn spawn_catch_up(self: &Arc<Self>, partition: PartitionId, generation: u64) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            store.run_catch_up(partition, generation).await;
        });
        if let Some(previous) = self.catch_ups.insert(partition, handle) {
            previous.abort();
        }
    }

    /// Run `f` on the slice if it is still the `generation` incarnation.
    fn with_slice<R>(
        &self,
        partition: PartitionId,
        generation: u64,
        f: impl FnOnce(&mut PartitionSlice) -> R,
    ) -> Option<R> {
        let mut slice = self.slices.get_mut(&partition)?;
        if slice.generation != generation {
            return None;
        }
        Some(f(&mut slice))
    }

    /// Catch the slice up, retrying until it succeeds or the slice is replaced.
    ///
    /// A failed attempt leaves the slice `CatchingUp`, so the router's region
    /// for the partition keeps answering `NotReady` instead of losing the slice.
    async fn run_catch_up(&self, partition: PartitionId, generation: u64) {
        let timeout = self.config.catch_up_timeout;
        let mut delays = slice_restart_policy().build();
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result =
                match tokio::time::timeout(timeout, self.catch_up(partition, generation)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::timeout(TimeoutKind::CatchUp, timeout)),
                };
            attempt += 1;

            match result {
                Ok(applied) => {
                    let keys = self.with_slice(partition, generation, |slice| {
                        slice.state = SliceState::ready();
                        slice.ready_tx.send_replace(true);
                        slice.entries.len()
                    });
                    if let Some(keys) = keys {
                        metrics::record_catch_up("ok");
                        metrics::set_store_keys(partition.value(), keys);
                        info!(
                            partition = %partition,
                            applied,
                            keys,
                            attempt,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "State store slice caught up"
                        );
                    }
                    return;
                }
                Err(e) => {
                    if self.with_slice(partition, generation, |_| ()).is_none() {
                        return;
                    }
                    metrics::record_catch_up("failed");
                    let delay = delays.next().unwrap_or(SLICE_RESTART_MAX_DELAY);
                    error!(
                        partition = %partition,
                        error = %e,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "State store catch-up failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Read the partition from the start up to the high watermark seen now.
    async fn catch_up(&self, partition: PartitionId, generation: u64) -> EngineResult<usize> {
        let log = &self.log;
        let batch_size = self.config.catch_up_batch_size;

        let target = with_log_retry("catch_up", catch_up_policy(), || {
            log.high_watermark(partition)
        })
        .await
        .map_err(EngineError::Log)?;

        if self
            .with_slice(partition, generation, |slice| slice.state.set_target(target))
            .is_none()
        {
            return Ok(0);
        }
        debug!(partition = %partition, target = %target, "Catching up state store slice");

        let mut next = Offset::new(0);
        let mut applied = 0usize;
        while next < target {
            let from = next;
            let batch = with_log_retry("catch_up", catch_up_policy(), || {
                log.read(partition, from, batch_size)
            })
            .await
            .map_err(EngineError::Log)?;

            let Some(last) = batch.last() else {
                break;
            };
            next = Offset::new(last.offset.value() + 1);

            let batch_applied = self.with_slice(partition, generation, |slice| {
                batch.iter().filter(|record| slice.apply(record)).count()
            });
            match batch_applied {
                Some(count) => applied += count,
                None => return Ok(applied),
            }
        }

        Ok(applied)
    }

    /// Re-read every slice after records were missed.
    fn recatch_all(self: &Arc<Self>) {
        let partitions: Vec<PartitionId> = self.slices.iter().map(|slice| *slice.key()).collect();
        for partition in partitions {
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
            let restarted = self.slices.get_mut(&partition).map(|mut slice| {
                slice.generation = generation;
                slice.state = SliceState::catching_up();
                slice.ready_tx.send_replace(false);
            });
            if restarted.is_some() {
                self.spawn_catch_up(partition, generation);
            }
        }
    }

    // =========================================================================
    // Live tail
    // =========================================================================

    /// Follow the log's committed-record broadcast until shutdown.
    ///
    /// A lagging receiver has missed records, so every slice is re-read.
    pub fn start_tail(self: &Arc<Self>, mut records: broadcast::Receiver<CommittedRecord>) {
        let store = Arc::clone(self);
        self.tail_running.store(true, Ordering::SeqCst);
        let spawned = self.tasks.spawn("state-store-tail", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = records.recv() => {
                        match received {
                            Ok(record) => {
                                store.on_commit(&record);
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "State store tail lagged, re-reading assigned slices");
                                store.recatch_all();
                            }
                            Err(RecvError::Closed) => {
                                warn!("Committed record stream closed");
                                break;
                            }
                        }
                    }
                }
            }
            store.tail_running.store(false, Ordering::SeqCst);
        });
        if !spawned {
            self.tail_running.store(false, Ordering::SeqCst);
        }
    }

    /// Stop the tail, abort catch-ups and drop every slice.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown_all(timeout).await;
        self.tail_running.store(false, Ordering::SeqCst);

        let partitions: Vec<PartitionId> = self.slices.iter().map(|slice| *slice.key()).collect();
        self.revoke(partitions);
        for entry in self.catch_ups.iter() {
            entry.value().abort();
        }
        self.catch_ups.clear();
        info!("State store stopped");
    }
}

#[async_trait]
impl HealthCheck for MaterializedStateStore {
    fn component(&self) -> &'static str {
        "state_store"
    }

    async fn check(&self) -> ComponentHealth {
        let catching_up = self
            .slices
            .iter()
            .filter(|slice| slice.state.is_catching_up())
            .count();
        let detail = format!(
            "{} slices ({} catching up), {} keys",
            self.slices.len(),
            catching_up,
            self.key_count()
        );
        if self.tail_running.load(Ordering::SeqCst) {
            ComponentHealth::up(self.component()).with_detail(detail)
        } else {
            ComponentHealth::down(self.component(), format!("live tail stopped; {detail}"))
        }
    }
}
