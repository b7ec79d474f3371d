use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::NodeError;
use common::message::{
    MapRequest, NodeMessage, NodeReply, PartitionReport, ReduceRequest, ShuffleBatch,
};
use common::source::KeyedSource;
use common::transport::{MessageHandler, Transport};
use common::{EngineConfig, JobId, NodeId};

use crate::map::{combine, map_partition};
use crate::reduce::perform_reduce;
use crate::shuffle::{self, AccumulatorStore, Appended};

/// Released jobs whose tombstones a node keeps. Older ones are forgotten.
const RELEASED_JOBS_KEPT: usize = 1024;

/// The runtime of one grid node.
///
/// Maps the partitions it owns, shuffles their output, holds the reduce
/// accumulators for the keys it owns and reduces them on request.
pub struct NodeWorker {
    id: NodeId,
    source: Arc<dyn KeyedSource>,
    transport: Arc<dyn Transport>,
    config: Arc<EngineConfig>,
    accumulators: Arc<AccumulatorStore>,
    /// A released job keeps its (cancelled) token so that late messages are
    /// refused.
    jobs: DashMap<JobId, CancellationToken>,
    /// Released jobs, oldest first.
    released: Mutex<VecDeque<JobId>>,
}

impl NodeWorker {
    pub fn new(
        id: NodeId,
        source: Arc<dyn KeyedSource>,
        transport: Arc<dyn Transport>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            id,
            source,
            transport,
            config,
            accumulators: Arc::new(AccumulatorStore::new()),
            jobs: DashMap::new(),
            released: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn accumulators(&self) -> &AccumulatorStore {
        &self.accumulators
    }

    /// Whether `job` has been released on this node.
    pub fn is_released(&self, job: JobId) -> bool {
        self.jobs
            .get(&job)
            .map_or(false, |token| token.is_cancelled())
    }

    fn job_token(&self, job: JobId) -> Result<CancellationToken, NodeError> {
        let token = self.jobs.entry(job).or_default().value().clone();
        if token.is_cancelled() {
            return Err(NodeError::Cancelled(job));
        }
        Ok(token)
    }

    /// Undoes a store or reduce that raced with the job's release and may
    /// have recreated its accumulators.
    fn refuse_if_released(
        &self,
        job: JobId,
        token: &CancellationToken,
    ) -> Result<(), NodeError> {
        if token.is_cancelled() {
            self.accumulators.release(job);
            return Err(NodeError::Cancelled(job));
        }
        Ok(())
    }

    async fn map(&self, request: MapRequest) -> Result<PartitionReport, NodeError> {
        let token = self.job_token(request.job)?;
        let MapRequest {
            job,
            spec,
            partition,
            attempt,
            partition_count,
            reduce_nodes,
        } = request;
        debug!("{} mapping {} of {} (attempt {})", self.id, partition, job, attempt);

        let source = self.source.clone();
        let map_token = token.clone();
        let map_spec = spec.clone();
        let records = tokio::task::spawn_blocking(move || {
            let mapped = map_partition(
                source.as_ref(),
                job,
                &map_spec,
                partition,
                partition_count,
                &map_token,
            )?;
            let records = combine(map_spec.combiner, mapped.records, &map_spec.aux, partition)?;
            Ok::<_, NodeError>((mapped.mapped_keys, records))
        })
        .await
        .map_err(|err| NodeError::Protocol(format!("map task for {} aborted: {}", partition, err)))?;
        let (mapped_keys, records) = records?;

        let emitted = records.len() as u64;
        let routed = shuffle::route(records, &reduce_nodes, self.config.shuffle_batch_size)?;
        let mut batches = BTreeMap::new();
        for (node, chunks) in routed {
            for (seq, records) in chunks.into_iter().enumerate() {
                if token.is_cancelled() {
                    return Err(NodeError::Cancelled(job));
                }
                let batch = ShuffleBatch {
                    job,
                    source: partition,
                    attempt,
                    seq: seq as u32,
                    records,
                };
                if node == self.id {
                    self.accumulate(batch)?;
                } else {
                    shuffle::send_batch(self.transport.as_ref(), &self.config, node, batch, &token)
                        .await?;
                }
                *batches.entry(node).or_insert(0) += 1;
            }
        }

        debug!(
            "{} shuffled {} of {} to {} nodes",
            self.id,
            partition,
            job,
            batches.len()
        );
        Ok(PartitionReport {
            partition,
            attempt,
            node: self.id,
            mapped_keys,
            emitted,
            batches,
        })
    }

    fn accumulate(&self, batch: ShuffleBatch) -> Result<(), NodeError> {
        let token = self.job_token(batch.job)?;
        self.accumulate_with(batch, &token)
    }

    fn accumulate_with(
        &self,
        batch: ShuffleBatch,
        token: &CancellationToken,
    ) -> Result<(), NodeError> {
        let (job, source, seq) = (batch.job, batch.source, batch.seq);
        let appended = self.accumulators.append(batch);
        self.refuse_if_released(job, token)?;
        match appended {
            Appended::Stored => {}
            Appended::Duplicate => debug!("{} ignored duplicate batch {} of {}", self.id, seq, source),
            Appended::Stale => debug!("{} ignored stale batch {} of {}", self.id, seq, source),
            Appended::AlreadyReduced => {
                return Err(NodeError::Protocol(format!(
                    "batch {} of {} arrived after {} was reduced",
                    seq, source, job
                )))
            }
        }
        Ok(())
    }

    async fn reduce(&self, request: ReduceRequest) -> Result<NodeReply, NodeError> {
        let job = request.job;
        let token = self.job_token(job)?;
        let node = self.id;
        let accumulators = self.accumulators.clone();
        let reduce_token = token.clone();
        let result = tokio::task::spawn_blocking(move || {
            perform_reduce(node, &accumulators, &request, &reduce_token)
        })
        .await
        .map_err(|err| NodeError::Protocol(format!("reduce task aborted: {}", err)));
        self.refuse_if_released(job, &token)?;
        Ok(NodeReply::Reduced(result??))
    }

    fn release(&self, job: JobId) {
        let token = self.jobs.entry(job).or_default().value().clone();
        if !token.is_cancelled() {
            token.cancel();
            self.forget_oldest_released(job);
        }
        if self.accumulators.release(job) {
            info!("{} released {}", self.id, job);
        }
    }

    fn forget_oldest_released(&self, job: JobId) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        released.push_back(job);
        while released.len() > RELEASED_JOBS_KEPT {
            if let Some(oldest) = released.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl MessageHandler for NodeWorker {
    async fn handle(&self, message: NodeMessage) -> Result<NodeReply, NodeError> {
        let job = message.job();
        let kind = message.kind();
        let reply = match message {
            NodeMessage::MapPartition(request) => self.map(request).await.map(NodeReply::Mapped),
            NodeMessage::Accumulate(batch) => self.accumulate(batch).map(|_| NodeReply::Accepted),
            NodeMessage::Reduce(request) => self.reduce(request).await,
            NodeMessage::Release { job } => {
                self.release(job);
                Ok(NodeReply::Released)
            }
        };
        if let Err(err) = &reply {
            warn!("{} failed {} request of {}: {}", self.id, kind, job, err);
        }
        reply
    }
}
