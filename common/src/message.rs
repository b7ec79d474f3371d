//! Messages exchanged between the coordinator and the nodes.
//!
//! These are plain in-process values. A transport that crosses process
//! boundaries is responsible for its own encoding.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::cluster::{NodeId, PartitionId};
use crate::job::{Attempt, JobId, JobSpec};
use crate::{KeyValue, ReduceFn};

/// Map one partition and shuffle its output to the reduce nodes.
#[derive(Debug, Clone)]
pub struct MapRequest {
    pub job: JobId,
    pub spec: Arc<JobSpec>,
    pub partition: PartitionId,
    pub attempt: Attempt,
    pub partition_count: u32,
    /// Member snapshot taken when the job was planned. Reduce owners are
    /// derived from it.
    pub reduce_nodes: Arc<[NodeId]>,
}

/// A chunk of intermediate records from one partition attempt.
#[derive(Debug, Clone)]
pub struct ShuffleBatch {
    pub job: JobId,
    pub source: PartitionId,
    pub attempt: Attempt,
    pub seq: u32,
    pub records: Vec<KeyValue>,
}

/// What a reduce node must have received from one source partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleReceipt {
    pub partition: PartitionId,
    pub attempt: Attempt,
    pub batches: u32,
}

#[derive(Clone)]
pub struct ReduceRequest {
    pub job: JobId,
    pub reducer: Option<ReduceFn>,
    pub aux: Bytes,
    pub expected: Vec<ShuffleReceipt>,
}

impl fmt::Debug for ReduceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReduceRequest")
            .field("job", &self.job)
            .field("reducer", &self.reducer.is_some())
            .field("expected", &self.expected)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NodeMessage {
    MapPartition(MapRequest),
    Accumulate(ShuffleBatch),
    Reduce(ReduceRequest),
    /// Cancels the job on the node and drops its accumulators.
    Release { job: JobId },
}

impl NodeMessage {
    pub fn job(&self) -> JobId {
        match self {
            NodeMessage::MapPartition(request) => request.job,
            NodeMessage::Accumulate(batch) => batch.job,
            NodeMessage::Reduce(request) => request.job,
            NodeMessage::Release { job } => *job,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeMessage::MapPartition(_) => "map",
            NodeMessage::Accumulate(_) => "accumulate",
            NodeMessage::Reduce(_) => "reduce",
            NodeMessage::Release { .. } => "release",
        }
    }
}

/// A partition attempt that mapped and shuffled all of its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: PartitionId,
    pub attempt: Attempt,
    pub node: NodeId,
    pub mapped_keys: u64,
    pub emitted: u64,
    /// Batches delivered per reduce node.
    pub batches: BTreeMap<NodeId, u32>,
}

#[derive(Debug, Clone)]
pub enum NodeReply {
    Mapped(PartitionReport),
    Accepted,
    Reduced(JobResult),
    Released,
}

/// Output of the reduce stage, either for one node or for the whole job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// No reducer was configured: every output key maps to its values.
    Grouped(BTreeMap<Bytes, Vec<Bytes>>),
    Reduced(BTreeMap<Bytes, Bytes>),
}

impl JobResult {
    pub fn empty(reduced: bool) -> Self {
        if reduced {
            JobResult::Reduced(BTreeMap::new())
        } else {
            JobResult::Grouped(BTreeMap::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            JobResult::Grouped(map) => map.len(),
            JobResult::Reduced(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds another node's partial result into this one. Reduce owners are
    /// disjoint, so keys never collide for results of the same job.
    pub fn merge(&mut self, other: JobResult) -> Result<(), JobResult> {
        match (self, other) {
            (JobResult::Grouped(into), JobResult::Grouped(from)) => {
                for (key, mut values) in from {
                    into.entry(key).or_default().append(&mut values);
                }
                Ok(())
            }
            (JobResult::Reduced(into), JobResult::Reduced(from)) => {
                into.extend(from);
                Ok(())
            }
            (_, other) => Err(other),
        }
    }

    pub fn into_grouped(self) -> Option<BTreeMap<Bytes, Vec<Bytes>>> {
        match self {
            JobResult::Grouped(map) => Some(map),
            JobResult::Reduced(_) => None,
        }
    }

    pub fn into_reduced(self) -> Option<BTreeMap<Bytes, Bytes>> {
        match self {
            JobResult::Reduced(map) => Some(map),
            JobResult::Grouped(_) => None,
        }
    }
}
