//! In-memory durable log.
//!
//! A complete in-process implementation of [`DurableLog`]: per-partition
//! ordered record vectors, consumer groups whose partitions are spread over
//! members with the consistent hash ring, epoch fencing of writers, and a
//! broadcast of every committed record.
//!
//! Used for single-node deployments (one member owns every partition) and as
//! the backend of the test suite, which is why it also exposes fault
//! injection hooks:
//!
//! - [`fail_next_appends`](InMemoryLog::fail_next_appends): queue errors for upcoming appends
//! - [`set_append_delay`](InMemoryLog::set_append_delay): slow every append down
//! - [`move_partition`](InMemoryLog::move_partition): hand a partition to another member
//! - [`revoke_membership`](InMemoryLog::revoke_membership): drop a member out of its group

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info};

use super::assignment::{MemberInfo, PartitionAssignment, PartitionOwner, rebalance};
use super::log::{AssignmentEvent, DurableLog, LogError, LogResult, Subscription};
use crate::types::{
    Ack, CommittedRecord, EventEnvelope, NodeId, Offset, PartitionId, WriterFence,
};

/// Default capacity of the committed-record broadcast.
const DEFAULT_BROADCAST_CAPACITY: usize = 4_096;

/// Consumer group state.
#[derive(Debug, Default)]
struct GroupState {
    topic: String,
    members: BTreeMap<NodeId, mpsc::UnboundedSender<AssignmentEvent>>,
    assignment: Option<PartitionAssignment>,
}

impl GroupState {
    fn member_infos(&self) -> Vec<MemberInfo> {
        self.members
            .keys()
            .map(|node| MemberInfo { node: *node })
            .collect()
    }

    /// Deliver the current assignment to every member, dropping members whose receiver is gone.
    fn broadcast_assignment(&mut self) {
        let Some(assignment) = self.assignment.clone() else {
            return;
        };
        self.members.retain(|node, tx| {
            let delivered = tx.send(AssignmentEvent::Assigned(assignment.clone())).is_ok();
            if !delivered {
                debug!(node_id = %node, "Dropping member with closed assignment channel");
            }
            delivered
        });
    }
}

/// Record storage plus the ownership map writers are fenced against.
#[derive(Debug)]
struct LogState {
    partitions: Vec<Vec<CommittedRecord>>,
    ownership: Option<PartitionAssignment>,
}

/// In-process partitioned log. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryLog {
    partition_count: u32,
    state: Arc<RwLock<LogState>>,
    groups: Arc<Mutex<HashMap<String, GroupState>>>,
    records_tx: broadcast::Sender<CommittedRecord>,
    injected_failures: Arc<Mutex<VecDeque<LogError>>>,
    append_delay_ms: Arc<AtomicU64>,
    append_attempts: Arc<AtomicU64>,
}

impl InMemoryLog {
    /// Create a log with `partition_count` partitions.
    pub fn new(partition_count: u32) -> Self {
        Self::with_broadcast_capacity(partition_count, DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a log whose committed-record broadcast buffers `capacity` records.
    ///
    /// Subscribers that fall further behind observe a lag and must re-read.
    pub fn with_broadcast_capacity(partition_count: u32, capacity: usize) -> Self {
        let (records_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            partition_count,
            state: Arc::new(RwLock::new(LogState {
                partitions: vec![Vec::new(); partition_count as usize],
                ownership: None,
            })),
            groups: Arc::new(Mutex::new(HashMap::new())),
            records_tx,
            injected_failures: Arc::new(Mutex::new(VecDeque::new())),
            append_delay_ms: Arc::new(AtomicU64::new(0)),
            append_attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fail the next `count` appends with `error`, before they reach the partition.
    pub async fn fail_next_appends(&self, count: usize, error: LogError) {
        let mut failures = self.injected_failures.lock().await;
        failures.extend(std::iter::repeat_n(error, count));
    }

    /// Delay every append by `delay` before it is applied.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of append calls received, including failed ones.
    pub fn append_attempts(&self) -> u64 {
        self.append_attempts.load(Ordering::SeqCst)
    }

    /// Every record committed to `partition`, in offset order.
    pub async fn records(&self, partition: PartitionId) -> Vec<CommittedRecord> {
        let state = self.state.read().await;
        state
            .partitions
            .get(partition.value() as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Latest assignment of `group_id`.
    pub async fn current_assignment(&self, group_id: &str) -> Option<PartitionAssignment> {
        let groups = self.groups.lock().await;
        groups.get(group_id).and_then(|g| g.assignment.clone())
    }

    /// Hand `partition` to member `to`, bumping the group epoch.
    ///
    /// Writers of the previous owner are fenced from this point on.
    pub async fn move_partition(
        &self,
        group_id: &str,
        partition: PartitionId,
        to: NodeId,
    ) -> LogResult<PartitionAssignment> {
        let mut groups = self.groups.lock().await;
        let group = groups.get_mut(group_id).ok_or(LogError::Closed)?;
        if partition.value() >= self.partition_count {
            return Err(LogError::UnknownPartition { partition });
        }

        let mut next = group.assignment.clone().unwrap_or_default();
        next.epoch = next.epoch.next();
        next.owners.insert(
            partition,
            PartitionOwner {
                node: to,
                since: next.epoch,
            },
        );

        info!(
            group_id,
            partition = %partition,
            to = %to,
            epoch = %next.epoch,
            "Moving partition"
        );

        self.install(group, next.clone()).await;
        Ok(next)
    }

    /// Drop `node` out of `group_id` as if its session expired.
    ///
    /// The member receives [`AssignmentEvent::MembershipLost`] and the remaining
    /// members are rebalanced.
    pub async fn revoke_membership(&self, group_id: &str, node: NodeId) -> LogResult<()> {
        let mut groups = self.groups.lock().await;
        let group = groups.get_mut(group_id).ok_or(LogError::Closed)?;
        if let Some(tx) = group.members.remove(&node) {
            let _ = tx.send(AssignmentEvent::MembershipLost);
        }
        let next = rebalance(
            &group.topic,
            self.partition_count,
            &group.member_infos(),
            group.assignment.as_ref(),
        );
        self.install(group, next).await;
        Ok(())
    }

    /// Record `next` as the group's assignment, fence writers against it and notify members.
    async fn install(&self, group: &mut GroupState, next: PartitionAssignment) {
        {
            let mut state = self.state.write().await;
            state.ownership = Some(next.clone());
        }
        group.assignment = Some(next);
        group.broadcast_assignment();
    }

    fn check_partition(&self, partition: PartitionId) -> LogResult<usize> {
        if partition.value() < self.partition_count {
            Ok(partition.value() as usize)
        } else {
            Err(LogError::UnknownPartition { partition })
        }
    }
}

#[async_trait]
impl DurableLog for InMemoryLog {
    fn partition_count(&self) -> u32 {
        self.partition_count
    }

    async fn append(
        &self,
        partition: PartitionId,
        fence: WriterFence,
        envelope: EventEnvelope,
    ) -> LogResult<Ack> {
        self.append_attempts.fetch_add(1, Ordering::SeqCst);
        let index = self.check_partition(partition)?;

        let delay = self.append_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = self.injected_failures.lock().await.pop_front() {
            return Err(error);
        }

        if envelope.partition != partition {
            return Err(LogError::Serialization(format!(
                "envelope for partition {} appended to partition {}",
                envelope.partition, partition
            )));
        }

        let mut state = self.state.write().await;

        if let Some(ownership) = &state.ownership {
            let allowed = ownership
                .owner_of(partition)
                .is_some_and(|owner| owner.node == fence.node && fence.epoch >= owner.since);
            if !allowed {
                debug!(
                    partition = %partition,
                    node_id = %fence.node,
                    epoch = %fence.epoch,
                    "Rejecting append from fenced writer"
                );
                return Err(LogError::Fenced { partition });
            }
        }

        let log = &mut state.partitions[index];
        let offset = Offset::new(log.len() as u64);
        let record = CommittedRecord { offset, envelope };
        log.push(record.clone());

        // Sent under the write lock so the broadcast preserves per-partition order.
        let _ = self.records_tx.send(record);

        Ok(Ack { partition, offset })
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max: usize,
    ) -> LogResult<Vec<CommittedRecord>> {
        let index = self.check_partition(partition)?;
        let state = self.state.read().await;
        let log = &state.partitions[index];
        let start = (from.value() as usize).min(log.len());
        let end = start.saturating_add(max).min(log.len());
        Ok(log[start..end].to_vec())
    }

    async fn high_watermark(&self, partition: PartitionId) -> LogResult<Offset> {
        let index = self.check_partition(partition)?;
        let state = self.state.read().await;
        Ok(Offset::new(state.partitions[index].len() as u64))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        node: NodeId,
    ) -> LogResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let records = self.records_tx.subscribe();

        let mut groups = self.groups.lock().await;
        let group = groups.entry(group_id.to_string()).or_default();
        group.topic = topic.to_string();
        group.members.insert(node, tx);

        let next = rebalance(
            topic,
            self.partition_count,
            &group.member_infos(),
            group.assignment.as_ref(),
        );
        info!(
            group_id,
            node_id = %node,
            members = group.members.len(),
            epoch = %next.epoch,
            "Member joined group"
        );
        self.install(group, next).await;

        Ok(Subscription {
            assignments: rx,
            records,
        })
    }

    async fn unsubscribe(&self, group_id: &str, node: NodeId) -> LogResult<()> {
        let mut groups = self.groups.lock().await;
        let Some(group) = groups.get_mut(group_id) else {
            return Ok(());
        };
        if group.members.remove(&node).is_none() {
            return Ok(());
        }

        let next = rebalance(
            &group.topic,
            self.partition_count,
            &group.member_infos(),
            group.assignment.as_ref(),
        );
        info!(
            group_id,
            node_id = %node,
            members = group.members.len(),
            epoch = %next.epoch,
            "Member left group"
        );
        self.install(group, next).await;
        Ok(())
    }
}
