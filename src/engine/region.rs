//! Per-partition registry of aggregate actors.
//!
//! A region exists on a node exactly while the node serves one partition. It
//! owns the partition's [`ProducerCoordinator`] and a map from key to the live
//! [`ActorHandle`] for that key. Commands for a key are enqueued on its actor
//! while the map entry is locked, so there is never more than one actor per
//! key in a region.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::actor::{ActorHandle, ActorMessage, CommandResult, spawn_actor};
use super::aggregate::{Aggregate, AggregateCodecs};
use super::log::DurableLog;
use super::producer::ProducerCoordinator;
use super::state_store::MaterializedStateStore;
use crate::error::{EngineError, SubmitError};
use crate::types::{AggregateKey, CommandEnvelope, Epoch, PartitionId, WriterFence};

/// Timeouts and sizes a region hands to its actors and writer.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    pub idle_timeout: Duration,
    pub spawn_timeout: Duration,
    pub append_timeout: Duration,
    pub append_max_retries: usize,
    pub producer_queue_capacity: usize,
}

/// State shared between a region and its actors.
pub(crate) struct RegionShared<A: Aggregate> {
    pub partition: PartitionId,
    pub epoch: Epoch,
    pub aggregate: Arc<A>,
    pub codecs: AggregateCodecs<A>,
    pub store: Arc<MaterializedStateStore>,
    pub producer: ProducerCoordinator,
    pub actors: DashMap<AggregateKey, ActorHandle<A>>,
    pub draining: AtomicBool,
    pub next_generation: AtomicU64,
    pub config: RegionConfig,
}

/// Serves one partition on this node.
pub struct AggregateActorRegion<A: Aggregate> {
    shared: Arc<RegionShared<A>>,
}

impl<A: Aggregate> std::fmt::Debug for AggregateActorRegion<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateActorRegion")
            .field("partition", &self.shared.partition)
            .field("epoch", &self.shared.epoch)
            .field("actors", &self.shared.actors.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}

impl<A: Aggregate> AggregateActorRegion<A> {
    /// Start serving `partition` under `fence`.
    ///
    /// The caller is responsible for waiting until the partition's state store
    /// slice is ready before routing commands here.
    pub fn start(
        partition: PartitionId,
        fence: WriterFence,
        aggregate: Arc<A>,
        codecs: AggregateCodecs<A>,
        store: Arc<MaterializedStateStore>,
        log: Arc<dyn DurableLog>,
        config: RegionConfig,
    ) -> Self {
        let producer = ProducerCoordinator::start(
            log,
            partition,
            fence,
            config.producer_queue_capacity,
            config.append_max_retries,
        );
        info!(
            partition = %partition,
            epoch = %fence.epoch,
            "Actor region started"
        );
        Self {
            shared: Arc::new(RegionShared {
                partition,
                epoch: fence.epoch,
                aggregate,
                codecs,
                store,
                producer,
                actors: DashMap::new(),
                draining: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.shared.partition
    }

    /// Ownership epoch this region was started for.
    pub fn epoch(&self) -> Epoch {
        self.shared.epoch
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }

    /// Number of live actors.
    pub fn active_actors(&self) -> usize {
        self.shared.actors.len()
    }

    /// Generation of the actor currently registered for `key`, if any.
    pub fn actor_generation(&self, key: &AggregateKey) -> Option<u64> {
        self.shared.actors.get(key).map(|handle| handle.generation())
    }

    /// Hand `envelope` to the actor for its key, spawning it if needed.
    ///
    /// Never blocks; the outcome arrives on `reply`. Fails with `NotOwner`
    /// once the region is draining.
    pub(crate) fn dispatch(
        &self,
        envelope: CommandEnvelope<A::Command>,
        reply: oneshot::Sender<CommandResult<A>>,
    ) {
        let not_owner = || {
            SubmitError::Engine(EngineError::NotOwner {
                partition: self.shared.partition,
            })
        };
        let key = envelope.key.clone();
        let message = ActorMessage { envelope, reply };

        let entry = self.shared.actors.entry(key.clone());
        // Checked under the entry lock so shutdown cannot miss a new actor.
        if self.is_draining() {
            drop(entry);
            let _ = message.reply.send(Err(not_owner()));
            return;
        }
        match entry {
            Entry::Occupied(mut entry) => {
                if let Err(returned) = entry.get().sender.send(message) {
                    // The actor died without unregistering; replace it.
                    warn!(
                        partition = %self.shared.partition,
                        key = %key,
                        generation = entry.get().generation(),
                        "Replacing dead actor"
                    );
                    let handle = spawn_actor(&self.shared, key);
                    if let Err(returned) = handle.sender.send(returned.0) {
                        let _ = returned.0.reply.send(Err(not_owner()));
                    }
                    entry.insert(handle);
                }
            }
            Entry::Vacant(entry) => {
                let handle = spawn_actor(&self.shared, key);
                if let Err(returned) = handle.sender.send(message) {
                    let _ = returned.0.reply.send(Err(not_owner()));
                }
                entry.insert(handle);
            }
        }
    }

    /// Run `command` on the actor for `key` and wait for its outcome.
    pub async fn route(&self, key: AggregateKey, command: A::Command) -> CommandResult<A> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(CommandEnvelope::new(key.clone(), command), reply);
        rx.await
            .unwrap_or_else(|_| Err(SubmitError::Engine(EngineError::ActorGone { key })))
    }

    /// Stop serving the partition.
    ///
    /// Refuses new commands, lets every actor finish its current command and
    /// fail the rest of its mailbox with `NotOwner`, then drains the writer.
    pub async fn shutdown(&self) {
        if self.shared.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        let started = Instant::now();

        let mut tasks = Vec::new();
        loop {
            let keys: Vec<AggregateKey> = self
                .shared
                .actors
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                if let Some((_, handle)) = self.shared.actors.remove(&key) {
                    tasks.push(handle.task);
                }
            }
        }

        let stopped = tasks.len();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(partition = %self.shared.partition, error = %e, "Actor task panicked");
                }
            }
        }

        self.shared.producer.drain().await;

        debug!(
            partition = %self.shared.partition,
            actors = stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Actor region stopped"
        );
    }
}
