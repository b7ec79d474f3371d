use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use common::{partition_for, KeyFilter, NodeId, PartitionDirectory, PartitionId};

/// Partitions a job must visit and where they live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    pub assigned: BTreeMap<PartitionId, NodeId>,
    /// Partitions without a resolvable owner at planning time.
    pub pending: BTreeSet<PartitionId>,
}

impl PartitionPlan {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assigned.len() + self.pending.len()
    }

    /// Moves `partition` from pending to assigned.
    pub fn assign(&mut self, partition: PartitionId, node: NodeId) {
        self.pending.remove(&partition);
        self.assigned.insert(partition, node);
    }
}

pub struct PartitionPlanner {
    directory: Arc<dyn PartitionDirectory>,
}

impl PartitionPlanner {
    pub fn new(directory: Arc<dyn PartitionDirectory>) -> Self {
        Self { directory }
    }

    /// Plans the partitions covered by `filter`.
    ///
    /// Explicit keys plan only the partitions holding them. A predicate can
    /// only be evaluated where the keys live, so it plans every partition.
    pub fn plan(&self, filter: &KeyFilter) -> PartitionPlan {
        let partition_count = self.directory.partition_count();
        let partitions: BTreeSet<PartitionId> = match &filter.keys {
            Some(keys) => keys
                .iter()
                .map(|key| partition_for(key, partition_count))
                .collect(),
            None => (0..partition_count).map(PartitionId).collect(),
        };

        let mut plan = PartitionPlan::default();
        for partition in partitions {
            match self.directory.owner_of(partition) {
                Some(node) => {
                    plan.assigned.insert(partition, node);
                }
                None => {
                    plan.pending.insert(partition);
                }
            }
        }
        debug!(
            "planned {} partitions, {} pending",
            plan.assigned.len(),
            plan.pending.len()
        );
        plan
    }

    /// Re-resolves the owner of a single partition.
    pub fn resolve(&self, partition: PartitionId) -> Option<NodeId> {
        self.directory.owner_of(partition)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.directory.members()
    }
}
