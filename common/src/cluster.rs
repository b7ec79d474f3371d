//! Cluster membership and the partition-ownership directory.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

/// Identifies a node of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Identifies a disjoint shard of the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Where partitions live.
///
/// Each partition has at most one owner at any instant. `None` means the
/// partition is migrating and cannot be addressed yet.
pub trait PartitionDirectory: Send + Sync + 'static {
    /// Number of partitions the key space is split into.
    fn partition_count(&self) -> u32;

    /// The current owner of a partition.
    fn owner_of(&self, partition: PartitionId) -> Option<NodeId>;

    /// Current members, in ascending order.
    fn members(&self) -> Vec<NodeId>;

    fn is_member(&self, node: NodeId) -> bool {
        self.members().contains(&node)
    }

    /// A receiver whose value (the membership epoch) changes every time a
    /// node joins or leaves.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

#[derive(Debug)]
struct TableState {
    members: BTreeSet<NodeId>,
    owners: Vec<Option<NodeId>>,
}

/// In-process membership and ownership table.
#[derive(Debug)]
pub struct MembershipTable {
    state: RwLock<TableState>,
    epoch: watch::Sender<u64>,
}

impl MembershipTable {
    /// Creates a table and spreads partitions over `members` round-robin.
    pub fn new(partition_count: u32, members: impl IntoIterator<Item = NodeId>) -> Self {
        let members: BTreeSet<NodeId> = members.into_iter().collect();
        let ordered: Vec<NodeId> = members.iter().copied().collect();
        let owners = (0..partition_count as usize)
            .map(|index| {
                if ordered.is_empty() {
                    None
                } else {
                    Some(ordered[index % ordered.len()])
                }
            })
            .collect();
        let (epoch, _) = watch::channel(0);

        Self {
            state: RwLock::new(TableState { members, owners }),
            epoch,
        }
    }

    /// The current membership epoch.
    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Adds a node. Existing ownership is kept; orphaned partitions are
    /// handed to the new node.
    pub fn join(&self, node: NodeId) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.members.insert(node) {
                return;
            }
            for owner in state.owners.iter_mut().filter(|owner| owner.is_none()) {
                *owner = Some(node);
            }
        }
        info!("{} joined the cluster", node);
        self.bump();
    }

    /// Removes a node and reassigns its partitions to the remaining members.
    ///
    /// Returns the partitions that moved.
    pub fn depart(&self, node: NodeId) -> Vec<PartitionId> {
        let moved = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if !state.members.remove(&node) {
                return Vec::new();
            }
            let remaining: Vec<NodeId> = state.members.iter().copied().collect();
            let mut moved = Vec::new();
            for (index, owner) in state.owners.iter_mut().enumerate() {
                if *owner == Some(node) {
                    *owner = if remaining.is_empty() {
                        None
                    } else {
                        Some(remaining[index % remaining.len()])
                    };
                    moved.push(PartitionId(index as u32));
                }
            }
            moved
        };
        warn!("{} left the cluster, {} partitions reassigned", node, moved.len());
        self.bump();
        moved
    }

    /// Marks a partition as in flux: it has no addressable owner until
    /// [`MembershipTable::complete_migration`] is called.
    pub fn begin_migration(&self, partition: PartitionId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(owner) = state.owners.get_mut(partition.0 as usize) {
            *owner = None;
        }
    }

    pub fn complete_migration(&self, partition: PartitionId, node: NodeId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(owner) = state.owners.get_mut(partition.0 as usize) {
            *owner = Some(node);
        }
    }

    /// Partitions currently owned by `node`.
    pub fn partitions_of(&self, node: NodeId) -> Vec<PartitionId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(node))
            .map(|(index, _)| PartitionId(index as u32))
            .collect()
    }

    fn bump(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

impl PartitionDirectory for MembershipTable {
    fn partition_count(&self) -> u32 {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.owners.len() as u32
    }

    fn owner_of(&self, partition: PartitionId) -> Option<NodeId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.owners.get(partition.0 as usize).copied().flatten()
    }

    fn members(&self) -> Vec<NodeId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.members.iter().copied().collect()
    }

    fn is_member(&self, node: NodeId) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.members.contains(&node)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}
