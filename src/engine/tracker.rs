//! Local view of the consumer group's partition assignment.
//!
//! The tracker consumes the durable log's [`AssignmentEvent`] stream and
//! republishes it on a `watch` channel. Watchers always see the newest
//! assignment; an assignment whose epoch is not newer than the current one is
//! dropped, so the published epoch never goes backwards.
//!
//! Losing group membership (or the stream closing underneath us) puts the
//! tracker in stale mode: the last assignment is kept for diagnostics but the
//! router refuses writes until a fresh assignment arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::assignment::{PartitionAssignment, PartitionOwner};
use super::background_tasks::BackgroundTaskRegistry;
use super::health::{ComponentHealth, HealthCheck};
use super::log::AssignmentEvent;
use super::metrics;
use super::stale_mode::StaleAssignmentState;
use crate::types::{NodeId, PartitionId};

/// Latest assignment as seen by this node.
pub type AssignmentWatch = watch::Receiver<Option<Arc<PartitionAssignment>>>;

pub struct PartitionAssignmentTracker {
    node: NodeId,
    tx: watch::Sender<Option<Arc<PartitionAssignment>>>,
    stale: StaleAssignmentState,
    tasks: BackgroundTaskRegistry,
    consuming: AtomicBool,
}

impl std::fmt::Debug for PartitionAssignmentTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionAssignmentTracker")
            .field("node", &self.node)
            .field("epoch", &self.current().map(|a| a.epoch))
            .field("stale", &self.is_stale())
            .finish()
    }
}

impl PartitionAssignmentTracker {
    pub fn new(node: NodeId) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            node,
            tx,
            stale: StaleAssignmentState::new(),
            tasks: BackgroundTaskRegistry::new(),
            consuming: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Consume `events` in the background until shutdown or stream close.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<AssignmentEvent>) {
        let tracker = Arc::clone(self);
        self.consuming.store(true, Ordering::SeqCst);
        let spawned = self.tasks.spawn("assignment-tracker", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            tracker.apply(event);
                        }
                        None => {
                            warn!(node_id = %tracker.node, "Assignment stream closed");
                            tracker.enter_stale();
                            break;
                        }
                    },
                }
            }
            tracker.consuming.store(false, Ordering::SeqCst);
        });
        if !spawned {
            self.consuming.store(false, Ordering::SeqCst);
        }
    }

    /// Apply one membership event.
    ///
    /// Returns `true` if the published assignment changed.
    pub fn apply(&self, event: AssignmentEvent) -> bool {
        match event {
            AssignmentEvent::Assigned(assignment) => self.install(assignment),
            AssignmentEvent::MembershipLost => {
                warn!(node_id = %self.node, "Group membership lost");
                self.enter_stale();
                false
            }
        }
    }

    fn install(&self, assignment: PartitionAssignment) -> bool {
        let epoch = assignment.epoch;
        let owned = assignment.partitions_of(self.node).len();
        let installed = self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.epoch >= epoch => false,
            _ => {
                *current = Some(Arc::new(assignment));
                true
            }
        });

        if !installed {
            debug!(node_id = %self.node, epoch = %epoch, "Ignoring outdated assignment");
            return false;
        }

        metrics::record_assignment(epoch.value(), owned);
        info!(node_id = %self.node, epoch = %epoch, owned, "Partition assignment updated");

        if self.stale.is_active() {
            let entered_at = self.stale.entered_at();
            if self.stale.try_exit(entered_at, "reassigned") {
                info!(node_id = %self.node, epoch = %epoch, "Left stale assignment mode");
            }
        }
        true
    }

    fn enter_stale(&self) {
        if self.stale.enter() {
            warn!(node_id = %self.node, "Assignment is stale, refusing writes");
        }
    }

    /// Latest assignment, if any arrived yet.
    pub fn current(&self) -> Option<Arc<PartitionAssignment>> {
        self.tx.borrow().clone()
    }

    /// Watch assignment changes.
    pub fn subscribe(&self) -> AssignmentWatch {
        self.tx.subscribe()
    }

    /// Owner of `partition` in the latest assignment.
    pub fn owner_of(&self, partition: PartitionId) -> Option<PartitionOwner> {
        self.tx
            .borrow()
            .as_ref()
            .and_then(|assignment| assignment.owner_of(partition))
    }

    /// Check if this node owns `partition` in the latest assignment.
    pub fn owns(&self, partition: PartitionId) -> bool {
        self.owner_of(partition)
            .is_some_and(|owner| owner.node == self.node)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.is_active()
    }

    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.shutdown_all(timeout).await;
        self.consuming.store(false, Ordering::SeqCst);
        self.stale.force_exit();
    }
}

#[async_trait]
impl HealthCheck for PartitionAssignmentTracker {
    fn component(&self) -> &'static str {
        "assignment_tracker"
    }

    async fn check(&self) -> ComponentHealth {
        if self.is_stale() {
            return ComponentHealth::down(self.component(), "assignment stale");
        }
        if !self.consuming.load(Ordering::SeqCst) {
            return ComponentHealth::down(self.component(), "not consuming assignments");
        }
        match self.current() {
            Some(assignment) => ComponentHealth::up(self.component()).with_detail(format!(
                "epoch {}, {} partitions owned",
                assignment.epoch,
                assignment.partitions_of(self.node).len()
            )),
            None => ComponentHealth::up(self.component()).with_detail("awaiting first assignment"),
        }
    }
}
