use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::error::ConfigurationError;
use common::message::JobResult;
use common::source::{MemoryStore, NodeStore};
use common::transport::{LocalTransport, Transport};
use common::{EngineConfig, JobId, JobSpec, MembershipTable, NodeId, PartitionDirectory};
use mrg_worker::NodeWorker;

use crate::builder::Job;
use crate::coordinator::{Collation, JobCoordinator};
use crate::handle::{JobHandle, ResultCell};
use crate::jobs::{JobInfo, JobRegistry};

struct EngineInner {
    config: Arc<EngineConfig>,
    directory: Arc<dyn PartitionDirectory>,
    transport: Arc<dyn Transport>,
    registry: JobRegistry,
}

/// Entry point for submitting jobs to a grid.
///
/// Cheap to clone; clones share the job registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("jobs", &self.inner.registry.len())
            .finish()
    }
}

impl Engine {
    pub fn new(
        config: Arc<EngineConfig>,
        directory: Arc<dyn PartitionDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                directory,
                transport,
                registry: JobRegistry::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts configuring a job against `source`.
    pub fn job(&self, source: impl Into<String>) -> Job {
        Job::new(self.clone(), source)
    }

    /// Submits a built [`JobSpec`]. The handle resolves with the raw result.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, spec: JobSpec) -> JobHandle<JobResult> {
        self.launch(spec, Collation::identity())
    }

    /// Submits a built [`JobSpec`] whose result is passed through `collator`.
    pub fn submit_with<T, F>(&self, spec: JobSpec, collator: F) -> JobHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(JobResult) -> anyhow::Result<T> + Send + 'static,
    {
        self.launch(spec, Collation::collator(collator))
    }

    pub(crate) fn launch<T>(&self, spec: JobSpec, collation: Collation<T>) -> JobHandle<T>
    where
        T: Send + Sync + 'static,
    {
        let inner = &self.inner;
        let status = inner.registry.register(&spec.source);
        let cell = Arc::new(ResultCell::new(status.clone()));
        let cancel = CancellationToken::new();

        let coordinator = JobCoordinator::new(
            Arc::new(spec),
            inner.config.clone(),
            inner.directory.clone(),
            inner.transport.clone(),
            status.clone(),
            cancel.clone(),
        );
        tokio::spawn(coordinator.run(collation, cell.clone()));

        JobHandle::new(status, cell, cancel)
    }

    /// Every job submitted so far, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.inner.registry.get_all_jobs()
    }

    pub fn tracked_job(&self, id: JobId) -> Option<JobInfo> {
        self.inner.registry.get(id)
    }

    /// Forgets finished jobs.
    pub fn flush_jobs(&self) {
        self.inner.registry.flush();
    }
}

/// A grid whose nodes all live in this process.
///
/// Nodes share one [`MemoryStore`], each seeing only the partitions it owns,
/// and talk to each other over a [`LocalTransport`].
pub struct LocalCluster {
    config: Arc<EngineConfig>,
    store: Arc<MemoryStore>,
    membership: Arc<MembershipTable>,
    transport: Arc<LocalTransport>,
    workers: DashMap<NodeId, Arc<NodeWorker>>,
    next_node: AtomicU32,
    engine: Engine,
}

impl LocalCluster {
    /// Starts `node_count` nodes, numbered from 1.
    pub fn start(node_count: u32, config: EngineConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        if node_count == 0 {
            return Err(ConfigurationError::Invalid(
                "a cluster needs at least one node".to_string(),
            ));
        }

        let config = Arc::new(config);
        let store = Arc::new(MemoryStore::new(config.partition_count));
        let membership = Arc::new(MembershipTable::new(
            config.partition_count,
            (1..=node_count).map(NodeId),
        ));
        let transport = Arc::new(LocalTransport::new());
        let engine = Engine::new(config.clone(), membership.clone(), transport.clone());

        let cluster = Self {
            config,
            store,
            membership,
            transport,
            workers: DashMap::new(),
            next_node: AtomicU32::new(node_count + 1),
            engine,
        };
        for node in 1..=node_count {
            cluster.spawn_worker(NodeId(node));
        }
        info!(
            "local cluster started with {} nodes and {} partitions",
            node_count, cluster.config.partition_count
        );
        Ok(cluster)
    }

    fn spawn_worker(&self, node: NodeId) -> Arc<NodeWorker> {
        let source = Arc::new(NodeStore::new(
            node,
            self.store.clone(),
            self.membership.clone(),
        ));
        let worker = Arc::new(NodeWorker::new(
            node,
            source,
            self.transport.clone(),
            self.config.clone(),
        ));
        self.transport.register(node, worker.clone());
        self.workers.insert(node, worker.clone());
        worker
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn membership(&self) -> &Arc<MembershipTable> {
        &self.membership
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    pub fn worker(&self, node: NodeId) -> Option<Arc<NodeWorker>> {
        self.workers.get(&node).map(|worker| worker.value().clone())
    }

    /// Current members.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.membership.members()
    }

    /// Takes a node out of the grid: it stops answering, and its partitions
    /// move to the remaining members.
    pub fn depart(&self, node: NodeId) {
        self.transport.set_unreachable(node, true);
        self.membership.depart(node);
    }

    /// Starts a new node and adds it to the membership.
    pub fn add_node(&self) -> NodeId {
        let node = NodeId(self.next_node.fetch_add(1, Ordering::SeqCst));
        self.spawn_worker(node);
        self.membership.join(node);
        node
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        // Workers hold the transport, and the transport holds the workers.
        self.transport.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rejects_empty_clusters() {
        assert!(matches!(
            LocalCluster::start(0, EngineConfig::default()),
            Err(ConfigurationError::Invalid(_))
        ));

        let config = EngineConfig {
            partition_count: 0,
            ..EngineConfig::default()
        };
        assert!(LocalCluster::start(2, config).is_err());
    }

    #[test]
    fn nodes_join_and_leave() {
        let cluster = LocalCluster::start(2, EngineConfig::default()).unwrap();
        assert_eq!(cluster.nodes(), vec![NodeId(1), NodeId(2)]);

        let added = cluster.add_node();
        assert_eq!(added, NodeId(3));
        assert!(cluster.worker(added).is_some());

        cluster.depart(NodeId(1));
        assert_eq!(cluster.nodes(), vec![NodeId(2), NodeId(3)]);
        assert!(cluster.membership().partitions_of(NodeId(1)).is_empty());
    }
}
