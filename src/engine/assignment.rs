//! Partition-to-node assignment snapshots.
//!
//! A [`PartitionAssignment`] is the single piece of cluster-wide shared state
//! the engine relies on. It is produced by the log's consumer-group rebalance
//! protocol, mirrored locally by the
//! [`PartitionAssignmentTracker`](super::PartitionAssignmentTracker), and read
//! (never written) by everything else.

use std::collections::{BTreeMap, BTreeSet};

use conhash::{ConsistentHash, Node};

use crate::constants::VIRTUAL_NODES_PER_NODE;
use crate::types::{Epoch, NodeId, PartitionId};

/// Current owner of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOwner {
    /// Node holding the partition.
    pub node: NodeId,
    /// Epoch at which `node` took the partition over.
    ///
    /// Unchanged across rebalances that leave the partition where it was, so
    /// writers started under an earlier epoch stay valid.
    pub since: Epoch,
}

/// Snapshot of which node owns which partition, at one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionAssignment {
    pub epoch: Epoch,
    pub owners: BTreeMap<PartitionId, PartitionOwner>,
}

impl PartitionAssignment {
    /// Create an assignment at `epoch`.
    pub fn new(epoch: Epoch, owners: BTreeMap<PartitionId, PartitionOwner>) -> Self {
        Self { epoch, owners }
    }

    /// Assignment giving every partition to `node` (single-node deployment).
    pub fn single_node(epoch: Epoch, node: NodeId, partition_count: u32) -> Self {
        let owners = (0..partition_count)
            .map(|p| (PartitionId::new(p), PartitionOwner { node, since: epoch }))
            .collect();
        Self { epoch, owners }
    }

    /// Owner of `partition`, if assigned.
    pub fn owner_of(&self, partition: PartitionId) -> Option<PartitionOwner> {
        self.owners.get(&partition).copied()
    }

    /// Check if `node` owns `partition` in this snapshot.
    pub fn owns(&self, node: NodeId, partition: PartitionId) -> bool {
        self.owners
            .get(&partition)
            .is_some_and(|owner| owner.node == node)
    }

    /// Partitions owned by `node`.
    pub fn partitions_of(&self, node: NodeId) -> BTreeSet<PartitionId> {
        self.owners
            .iter()
            .filter(|(_, owner)| owner.node == node)
            .map(|(partition, _)| *partition)
            .collect()
    }
}

/// Partitions `node` gains and loses when moving from `previous` to `next`.
///
/// A partition that stays on `node` but whose `since` epoch changed was handed
/// away and back between the two snapshots; it is reported in both sets so the
/// old incarnation is torn down before the new one starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentDelta {
    pub revoked: BTreeSet<PartitionId>,
    pub assigned: BTreeSet<PartitionId>,
}

impl AssignmentDelta {
    pub fn between(
        previous: Option<&PartitionAssignment>,
        next: &PartitionAssignment,
        node: NodeId,
    ) -> Self {
        let mut delta = AssignmentDelta::default();

        let before: BTreeMap<PartitionId, PartitionOwner> = previous
            .map(|p| {
                p.owners
                    .iter()
                    .filter(|(_, o)| o.node == node)
                    .map(|(k, v)| (*k, *v))
                    .collect()
            })
            .unwrap_or_default();

        for (partition, owner) in &before {
            match next.owner_of(*partition) {
                Some(now) if now.node == node && now.since == owner.since => {}
                Some(now) if now.node == node => {
                    delta.revoked.insert(*partition);
                    delta.assigned.insert(*partition);
                }
                _ => {
                    delta.revoked.insert(*partition);
                }
            }
        }

        for partition in next.partitions_of(node) {
            if !before.contains_key(&partition) {
                delta.assigned.insert(partition);
            }
        }

        delta
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty() && self.assigned.is_empty()
    }
}

/// Group member as placed on the consistent hash ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub node: NodeId,
}

impl Node for MemberInfo {
    fn name(&self) -> String {
        format!("node-{}", self.node.value())
    }
}

/// Compute which member should own a partition using consistent hashing.
///
/// Builds a ring with [`VIRTUAL_NODES_PER_NODE`] replicas per member and hashes
/// `"{topic}:{partition}"` onto it. Only ~1/n partitions move when a member
/// joins or leaves.
///
/// Returns `None` when there are no members.
pub fn consistent_hash_assignment(
    topic: &str,
    partition: PartitionId,
    members: &[MemberInfo],
) -> Option<NodeId> {
    match members {
        [] => None,
        [only] => Some(only.node),
        _ => {
            let mut ring: ConsistentHash<MemberInfo> = ConsistentHash::new();
            for member in members {
                ring.add(member, VIRTUAL_NODES_PER_NODE);
            }

            let partition_key = format!("{}:{}", topic, partition.value());
            ring.get_str(&partition_key)
                .map(|member| member.node)
                .or(Some(members[0].node))
        }
    }
}

/// Build the next assignment for `members`, preserving `since` for partitions
/// that did not move.
pub fn rebalance(
    topic: &str,
    partition_count: u32,
    members: &[MemberInfo],
    previous: Option<&PartitionAssignment>,
) -> PartitionAssignment {
    let epoch = previous.map(|p| p.epoch).unwrap_or(Epoch::ZERO).next();
    let mut owners = BTreeMap::new();

    for p in 0..partition_count {
        let partition = PartitionId::new(p);
        let Some(node) = consistent_hash_assignment(topic, partition, members) else {
            continue;
        };
        let since = match previous.and_then(|prev| prev.owner_of(partition)) {
            Some(prev) if prev.node == node => prev.since,
            _ => epoch,
        };
        owners.insert(partition, PartitionOwner { node, since });
    }

    PartitionAssignment { epoch, owners }
}
