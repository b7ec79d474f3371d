//! The keyed data source the map stage reads from.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use crate::cluster::{NodeId, PartitionDirectory, PartitionId};
use crate::error::SourceError;
use crate::partition_for;

/// Node-local view of a keyed data source.
///
/// Both calls are synchronous: they may touch local storage but never the
/// network.
pub trait KeyedSource: Send + Sync + 'static {
    /// Keys of `source` that live in `partition`, in ascending order.
    fn owned_keys(&self, source: &str, partition: PartitionId) -> Result<Vec<Bytes>, SourceError>;

    /// The value stored under `key`, or `None` if it disappeared.
    fn value_for(&self, source: &str, key: &Bytes) -> Result<Option<Bytes>, SourceError>;
}

/// A partitioned in-memory store shared by every node of a local cluster.
#[derive(Debug)]
pub struct MemoryStore {
    partition_count: u32,
    sources: DashSet<String>,
    data: DashMap<(String, PartitionId), BTreeMap<Bytes, Bytes>>,
}

impl MemoryStore {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
            sources: DashSet::new(),
            data: DashMap::new(),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Registers an empty source. Sources are also created on first write.
    pub fn create_source(&self, source: &str) {
        self.sources.insert(source.to_string());
    }

    pub fn has_source(&self, source: &str) -> bool {
        self.sources.contains(source)
    }

    pub fn put(&self, source: &str, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let key = key.into();
        let partition = partition_for(&key, self.partition_count);
        self.create_source(source);
        self.data
            .entry((source.to_string(), partition))
            .or_default()
            .insert(key, value.into());
    }

    pub fn put_all<K, V>(&self, source: &str, entries: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let mut count = 0;
        for (key, value) in entries {
            self.put(source, key, value);
            count += 1;
        }
        debug!("loaded {} entries into source `{}`", count, source);
    }

    pub fn remove(&self, source: &str, key: &Bytes) -> Option<Bytes> {
        let partition = partition_for(key, self.partition_count);
        self.data
            .get_mut(&(source.to_string(), partition))
            .and_then(|mut entries| entries.remove(key))
    }

    /// Number of entries in `source`.
    pub fn len(&self, source: &str) -> usize {
        self.data
            .iter()
            .filter(|entry| entry.key().0 == source)
            .map(|entry| entry.value().len())
            .sum()
    }

    fn keys_in(&self, source: &str, partition: PartitionId) -> Result<Vec<Bytes>, SourceError> {
        if !self.has_source(source) {
            return Err(SourceError::UnknownSource(source.to_string()));
        }
        Ok(self
            .data
            .get(&(source.to_string(), partition))
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn lookup(&self, source: &str, key: &Bytes) -> Result<Option<Bytes>, SourceError> {
        if !self.has_source(source) {
            return Err(SourceError::UnknownSource(source.to_string()));
        }
        let partition = partition_for(key, self.partition_count);
        Ok(self
            .data
            .get(&(source.to_string(), partition))
            .and_then(|entries| entries.get(key).cloned()))
    }
}

/// A store without an ownership check, for single-node use.
impl KeyedSource for MemoryStore {
    fn owned_keys(&self, source: &str, partition: PartitionId) -> Result<Vec<Bytes>, SourceError> {
        self.keys_in(source, partition)
    }

    fn value_for(&self, source: &str, key: &Bytes) -> Result<Option<Bytes>, SourceError> {
        self.lookup(source, key)
    }
}

/// One node's view of a shared [`MemoryStore`].
///
/// Serves only the partitions the directory currently assigns to this node.
pub struct NodeStore {
    node: NodeId,
    store: Arc<MemoryStore>,
    directory: Arc<dyn PartitionDirectory>,
}

impl NodeStore {
    pub fn new(node: NodeId, store: Arc<MemoryStore>, directory: Arc<dyn PartitionDirectory>) -> Self {
        Self {
            node,
            store,
            directory,
        }
    }

    fn check_owner(&self, partition: PartitionId) -> Result<(), SourceError> {
        if self.directory.owner_of(partition) == Some(self.node) {
            Ok(())
        } else {
            Err(SourceError::NotOwner {
                node: self.node,
                partition,
            })
        }
    }
}

impl KeyedSource for NodeStore {
    fn owned_keys(&self, source: &str, partition: PartitionId) -> Result<Vec<Bytes>, SourceError> {
        self.check_owner(partition)?;
        self.store.keys_in(source, partition)
    }

    fn value_for(&self, source: &str, key: &Bytes) -> Result<Option<Bytes>, SourceError> {
        self.check_owner(partition_for(key, self.store.partition_count))?;
        self.store.lookup(source, key)
    }
}
