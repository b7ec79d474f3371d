//! A partitioned map-reduce grid.
//!
//! Users specify map, combine and reduce functions and run them against a keyed
//! data source that is split into partitions spread across the nodes of a
//! cluster. This crate holds the types shared by the coordinator and the nodes.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use bytes::Bytes;

pub mod cluster;
pub mod config;
pub mod error;
pub mod job;
pub mod message;
pub mod source;
pub mod transport;
pub mod utils;

pub use cluster::{MembershipTable, NodeId, PartitionDirectory, PartitionId};
pub use config::EngineConfig;
pub use job::{Attempt, JobId, JobSpec, JobSpecBuilder, JobState, KeyFilter, Stage};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes a key-value pair and auxiliary arguments.
///
/// It returns an iterator that yields new key-value pairs.
pub type MapFn = fn(kv: KeyValue, aux: Bytes) -> MapOutput;

/// A reduce function takes in a key, an iterator over values for that key,
/// and an auxiliary argument. It returns an [`anyhow::Result`]
/// containing a single output value.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes>;

/// A combine function folds the values one node emitted for a key into a
/// single intermediate value. It has the same shape as a [`ReduceFn`], and its
/// output is fed to the reducer alongside the other nodes' combined values.
pub type CombineFn = ReduceFn;

/// Decides on the owning node whether a key takes part in a job.
pub type KeyPredicateFn = fn(key: &Bytes, aux: Bytes) -> bool;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub combine_fn: Option<CombineFn>,
    pub reduce_fn: Option<ReduceFn>,
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes a key. Every placement decision in the grid (input partition,
/// reduce owner) is derived from this value.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fffffff) as u32
}

/// The input partition a key belongs to.
pub fn partition_for(key: &[u8], partition_count: u32) -> PartitionId {
    PartitionId(ihash(key) % partition_count.max(1))
}

/// The node responsible for reducing an output key.
///
/// `reduce_nodes` is the member snapshot taken when the job was planned, so
/// the assignment is stable for the whole job and independent of how the
/// input was partitioned.
pub fn reduce_owner(key: &[u8], reduce_nodes: &[NodeId]) -> Option<NodeId> {
    if reduce_nodes.is_empty() {
        return None;
    }
    let index = ihash(key) as usize % reduce_nodes.len();
    Some(reduce_nodes[index])
}
