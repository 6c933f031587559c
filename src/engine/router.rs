//! Entry point for commands: maps keys to partitions and partitions to regions.
//!
//! Each partition this node serves has a slot:
//!
//! ```text
//!   (absent) ──submit──▶ Starting{pending} ──store ready──▶ Ready(region)
//!       ▲                     │                               │
//!       │              startup failed                    revoked
//!       │                     ▼                               ▼
//!       └──────────────── (removed) ◀──── shut down ──── Draining
//! ```
//!
//! Commands arriving while a slot is `Starting` wait in a bounded
//! [`PendingRequestBuffer`] and are dispatched in arrival order once the
//! region is ready. Slot transitions and dispatch both happen under the slot's
//! map entry lock, so queued commands always reach the region before any
//! command submitted after startup completed.
//!
//! Assignment changes are applied by a rebalance task in two phases: first
//! every revoked partition is torn down (slot drained, region shut down, store
//! slice dropped), then store slices for newly owned partitions start catching
//! up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::actor::{CommandReply, CommandResult};
use super::aggregate::{Aggregate, AggregateCodecs};
use super::assignment::{AssignmentDelta, PartitionAssignment};
use super::background_tasks::BackgroundTaskRegistry;
use super::health::{ComponentHealth, HealthCheck};
use super::log::DurableLog;
use super::metrics;
use super::partitioner::Partitioner;
use super::pending::{OverflowPolicy, PendingRequest, PendingRequestBuffer};
use super::region::{AggregateActorRegion, RegionConfig};
use super::state_store::MaterializedStateStore;
use super::tracker::PartitionAssignmentTracker;
use crate::error::{EngineError, SubmitError, TimeoutKind};
use crate::types::{AggregateKey, CommandEnvelope, Epoch, NodeId, PartitionId, WriterFence};

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub node: NodeId,
    pub route_timeout: Duration,
    pub region_start_timeout: Duration,
    pub pending_buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub shutdown_timeout: Duration,
    pub region: RegionConfig,
}

/// A submission waiting for its partition to start.
struct QueuedSubmit<A: Aggregate> {
    envelope: CommandEnvelope<A::Command>,
    reply: oneshot::Sender<CommandResult<A>>,
}

impl<A: Aggregate> PendingRequest for QueuedSubmit<A> {
    fn fail(self, error: EngineError) {
        let _ = self.reply.send(Err(SubmitError::Engine(error)));
    }
}

enum Slot<A: Aggregate> {
    Starting {
        epoch: Epoch,
        pending: PendingRequestBuffer<QueuedSubmit<A>>,
    },
    Ready(Arc<AggregateActorRegion<A>>),
    Draining,
}

impl<A: Aggregate> Slot<A> {
    fn name(&self) -> &'static str {
        match self {
            Slot::Starting { .. } => "starting",
            Slot::Ready(_) => "ready",
            Slot::Draining => "draining",
        }
    }
}

struct RouterInner<A: Aggregate> {
    config: RouterConfig,
    partitioner: Arc<dyn Partitioner>,
    tracker: Arc<PartitionAssignmentTracker>,
    store: Arc<MaterializedStateStore>,
    log: Arc<dyn DurableLog>,
    aggregate: Arc<A>,
    codecs: AggregateCodecs<A>,
    slots: DashMap<PartitionId, Slot<A>>,
    tasks: BackgroundTaskRegistry,
    shutting_down: AtomicBool,
}

/// Routes commands to the region serving the key's partition.
pub struct PartitionRouter<A: Aggregate> {
    inner: Arc<RouterInner<A>>,
}

impl<A: Aggregate> std::fmt::Debug for PartitionRouter<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionRouter")
            .field("node", &self.inner.config.node)
            .field("slots", &self.inner.slots.len())
            .finish()
    }
}

impl<A: Aggregate> PartitionRouter<A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RouterConfig,
        partitioner: Arc<dyn Partitioner>,
        tracker: Arc<PartitionAssignmentTracker>,
        store: Arc<MaterializedStateStore>,
        log: Arc<dyn DurableLog>,
        aggregate: Arc<A>,
        codecs: AggregateCodecs<A>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                partitioner,
                tracker,
                store,
                log,
                aggregate,
                codecs,
                slots: DashMap::new(),
                tasks: BackgroundTaskRegistry::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start following assignment changes.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let mut watch = self.inner.tracker.subscribe();
        self.inner.tasks.spawn("rebalance", move |mut shutdown| async move {
            let mut previous: Option<Arc<PartitionAssignment>> = None;
            loop {
                let next = watch.borrow_and_update().clone();
                if let Some(next) = next {
                    let changed = previous
                        .as_ref()
                        .is_none_or(|previous| previous.epoch != next.epoch);
                    if changed {
                        inner.rebalance(previous.as_deref(), &next).await;
                        previous = Some(next);
                    }
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    changed = watch.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Execute `command` against the aggregate identified by `key`.
    ///
    /// The whole call, from routing to the durable acknowledgement, is bounded
    /// by the route timeout.
    pub async fn submit(
        &self,
        key: AggregateKey,
        command: A::Command,
    ) -> Result<CommandReply<A>, SubmitError<A::Error>> {
        let started = Instant::now();
        let route_timeout = self.inner.config.route_timeout;

        let result = match tokio::time::timeout(route_timeout, self.inner.submit(key, command)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Engine(EngineError::timeout(
                TimeoutKind::Route,
                route_timeout,
            ))),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(SubmitError::Rejected(_)) => "rejected",
            Err(SubmitError::Engine(e)) => e.as_metric_label(),
        };
        metrics::record_command(outcome, started.elapsed().as_secs_f64());
        result
    }

    /// Partition `key` maps to.
    pub fn partition_of(&self, key: &AggregateKey) -> PartitionId {
        self.inner.partitioner.partition_of(key)
    }

    /// Region serving `partition`, if it is ready.
    pub fn region(&self, partition: PartitionId) -> Option<Arc<AggregateActorRegion<A>>> {
        self.inner.slots.get(&partition).and_then(|slot| match &*slot {
            Slot::Ready(region) => Some(Arc::clone(region)),
            _ => None,
        })
    }

    /// Lifecycle state name of the slot for `partition`.
    pub fn slot_state(&self, partition: PartitionId) -> Option<&'static str> {
        self.inner.slots.get(&partition).map(|slot| slot.name())
    }

    /// Partitions with a ready region, ascending.
    pub fn ready_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready(_)))
            .map(|slot| *slot.key())
            .collect();
        partitions.sort();
        partitions
    }

    /// Live actors across every ready region.
    pub fn active_actors(&self) -> usize {
        self.inner
            .slots
            .iter()
            .map(|slot| match slot.value() {
                Slot::Ready(region) => region.active_actors(),
                _ => 0,
            })
            .sum()
    }

    /// Stop routing and shut every region down.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let timeout = self.inner.config.shutdown_timeout;
        self.inner.tasks.shutdown_all(timeout).await;

        let partitions: Vec<PartitionId> = self.inner.slots.iter().map(|slot| *slot.key()).collect();
        let count = partitions.len();
        futures::future::join_all(partitions.into_iter().map(|p| self.inner.release(p))).await;
        info!(node_id = %self.inner.config.node, partitions = count, "Router stopped");
    }
}

impl<A: Aggregate> RouterInner<A> {
    async fn submit(self: &Arc<Self>, key: AggregateKey, command: A::Command) -> CommandResult<A> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning.into());
        }
        if self.tracker.is_stale() {
            return Err(EngineError::AssignmentStale.into());
        }

        let partition = self.partitioner.partition_of(&key);
        let epoch = match self.tracker.owner_of(partition) {
            Some(owner) if owner.node == self.config.node => owner.since,
            other => {
                return Err(EngineError::WrongNode {
                    partition,
                    owner: other.map(|owner| owner.node),
                }
                .into());
            }
        };

        let envelope = CommandEnvelope::new(key.clone(), command);
        debug!(
            partition = %partition,
            key = %key,
            correlation_id = %envelope.correlation_id,
            "Routing command"
        );
        let (reply, rx) = oneshot::channel();
        self.enqueue(partition, epoch, envelope, reply);
        rx.await
            .unwrap_or_else(|_| Err(SubmitError::Engine(EngineError::ActorGone { key })))
    }

    fn enqueue(
        self: &Arc<Self>,
        partition: PartitionId,
        epoch: Epoch,
        envelope: CommandEnvelope<A::Command>,
        reply: oneshot::Sender<CommandResult<A>>,
    ) {
        let queued = QueuedSubmit { envelope, reply };
        let not_owner = EngineError::NotOwner { partition };

        match self.slots.entry(partition) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Slot::Ready(region) if region.epoch() == epoch => {
                    region.dispatch(queued.envelope, queued.reply);
                }
                Slot::Starting {
                    epoch: starting,
                    pending,
                } if *starting == epoch => pending.push(queued),
                // Draining, or an incarnation the rebalance task has not replaced yet.
                _ => queued.fail(not_owner),
            },
            Entry::Vacant(entry) => {
                let mut pending = PendingRequestBuffer::new(
                    partition,
                    self.config.pending_buffer_capacity,
                    self.config.overflow_policy,
                );
                pending.push(queued);
                entry.insert(Slot::Starting { epoch, pending });
                debug!(partition = %partition, epoch = %epoch, "Starting actor region");
                tokio::spawn(Arc::clone(self).start_region(partition, epoch));
            }
        }
    }

    async fn start_region(self: Arc<Self>, partition: PartitionId, epoch: Epoch) {
        let started = Instant::now();
        let timeout = self.config.region_start_timeout;

        if self.tracker.owns(partition) {
            self.store.assign([partition]);
        }
        let ready = match self.store.wait_ready(partition, timeout).await {
            Err(EngineError::NotOwner { .. }) => Err(EngineError::NotReady { partition }),
            other => other,
        };

        if let Err(error) = ready {
            warn!(partition = %partition, epoch = %epoch, error = %error, "Actor region failed to start");
            let removed = self.slots.remove_if(&partition, |_, slot| {
                matches!(slot, Slot::Starting { epoch: starting, .. } if *starting == epoch)
            });
            if let Some((_, Slot::Starting { mut pending, .. })) = removed {
                pending.fail_all(error);
            }
            return;
        }

        let region = Arc::new(AggregateActorRegion::start(
            partition,
            WriterFence {
                node: self.config.node,
                epoch,
            },
            Arc::clone(&self.aggregate),
            self.codecs.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.log),
            self.config.region.clone(),
        ));

        let installed = match self.slots.get_mut(&partition) {
            Some(mut slot) => {
                let queued = match &mut *slot {
                    Slot::Starting {
                        epoch: starting,
                        pending,
                    } if *starting == epoch => Some(pending.drain()),
                    _ => None,
                };
                match queued {
                    Some(queued) => {
                        *slot = Slot::Ready(Arc::clone(&region));
                        let count = queued.len();
                        for request in queued {
                            region.dispatch(request.envelope, request.reply);
                        }
                        Some(count)
                    }
                    None => None,
                }
            }
            None => None,
        };

        match installed {
            Some(drained) => info!(
                partition = %partition,
                epoch = %epoch,
                drained,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Actor region ready"
            ),
            None => {
                debug!(partition = %partition, epoch = %epoch, "Partition moved during startup");
                region.shutdown().await;
                if !self.tracker.owns(partition) {
                    self.store.revoke([partition]);
                }
            }
        }
    }

    async fn rebalance(&self, previous: Option<&PartitionAssignment>, next: &PartitionAssignment) {
        let delta = AssignmentDelta::between(previous, next, self.config.node);
        if delta.is_empty() {
            return;
        }
        info!(
            node_id = %self.config.node,
            epoch = %next.epoch,
            revoked = ?delta.revoked,
            assigned = ?delta.assigned,
            "Applying partition assignment"
        );

        futures::future::join_all(delta.revoked.iter().map(|p| self.release(*p))).await;
        self.store.revoke(delta.revoked.iter().copied());

        // Away and back: the new incarnation re-reads its slice from scratch.
        let assigned: Vec<PartitionId> = delta
            .assigned
            .iter()
            .copied()
            .filter(|p| self.tracker.owns(*p))
            .collect();
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.store.assign(assigned);
        }
        metrics::record_rebalance(delta.assigned.len(), delta.revoked.len());
    }

    /// Tear down whatever serves `partition` and remove its slot.
    async fn release(&self, partition: PartitionId) {
        let previous = self
            .slots
            .get_mut(&partition)
            .map(|mut slot| std::mem::replace(&mut *slot, Slot::Draining));

        match previous {
            Some(Slot::Ready(region)) => {
                let timeout = self.config.shutdown_timeout;
                if tokio::time::timeout(timeout, region.shutdown()).await.is_err() {
                    warn!(
                        partition = %partition,
                        epoch = %region.epoch(),
                        "Actor region did not stop in time"
                    );
                }
            }
            Some(Slot::Starting { mut pending, .. }) => {
                pending.fail_all(EngineError::NotOwner { partition });
            }
            Some(Slot::Draining) | None => {}
        }

        self.slots
            .remove_if(&partition, |_, slot| matches!(slot, Slot::Draining));
        debug!(partition = %partition, "Released partition");
    }
}

#[async_trait]
impl<A: Aggregate> HealthCheck for PartitionRouter<A> {
    fn component(&self) -> &'static str {
        "router"
    }

    async fn check(&self) -> ComponentHealth {
        let (mut ready, mut starting, mut draining) = (0, 0, 0);
        for slot in self.inner.slots.iter() {
            match slot.value() {
                Slot::Ready(_) => ready += 1,
                Slot::Starting { .. } => starting += 1,
                Slot::Draining => draining += 1,
            }
        }
        let detail = format!(
            "{ready} ready, {starting} starting, {draining} draining regions; {} actors",
            self.active_actors()
        );
        if self.inner.tasks.all_healthy() && self.inner.tasks.task_count() > 0 {
            ComponentHealth::up(self.component()).with_detail(detail)
        } else {
            ComponentHealth::down(self.component(), format!("rebalance task stopped; {detail}"))
        }
    }
}
