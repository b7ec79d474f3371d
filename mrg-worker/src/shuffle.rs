//! Shuffle: routing intermediate records to their reduce owners and
//! collecting them on arrival.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::error::{DeliveryError, NodeError};
use common::message::{JobResult, NodeMessage, NodeReply, ShuffleBatch, ShuffleReceipt};
use common::transport::Transport;
use common::{reduce_owner, Attempt, EngineConfig, JobId, KeyValue, NodeId, PartitionId};

/// Splits a partition's records by reduce owner, then into batches of at
/// most `batch_size` records. Emission order is kept within each node.
pub fn route(
    records: Vec<KeyValue>,
    reduce_nodes: &[NodeId],
    batch_size: usize,
) -> Result<BTreeMap<NodeId, Vec<Vec<KeyValue>>>, NodeError> {
    let mut per_node: BTreeMap<NodeId, Vec<KeyValue>> = BTreeMap::new();
    for record in records {
        let owner = reduce_owner(&record.key, reduce_nodes)
            .ok_or_else(|| NodeError::Protocol("job has no reduce nodes".to_string()))?;
        per_node.entry(owner).or_default().push(record);
    }

    let batch_size = batch_size.max(1);
    Ok(per_node
        .into_iter()
        .map(|(node, records)| {
            let batches = records.chunks(batch_size).map(<[KeyValue]>::to_vec).collect();
            (node, batches)
        })
        .collect())
}

/// Sends one batch, retrying transport failures with jittered exponential
/// backoff. Errors returned by the destination itself are not retried.
pub async fn send_batch(
    transport: &dyn Transport,
    config: &EngineConfig,
    node: NodeId,
    batch: ShuffleBatch,
    token: &CancellationToken,
) -> Result<(), NodeError> {
    let job = batch.job;
    let mut retry = 0;
    loop {
        match transport.send(node, NodeMessage::Accumulate(batch.clone())).await {
            Ok(NodeReply::Accepted) => return Ok(()),
            Ok(other) => {
                return Err(NodeError::Protocol(format!(
                    "{} answered a shuffle batch with {:?}",
                    node, other
                )))
            }
            Err(DeliveryError::Remote(err)) => return Err(err),
            Err(DeliveryError::Transport(err)) => {
                if retry >= config.shuffle_max_retries {
                    warn!(
                        "giving up on batch {} of {} for {} after {} retries: {}",
                        batch.seq, batch.source, node, retry, err
                    );
                    return Err(NodeError::Shuffle(err));
                }
                let delay = with_jitter(config.shuffle_backoff(retry));
                debug!(
                    "retrying batch {} of {} for {} in {:?}: {}",
                    batch.seq, batch.source, node, delay, err
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(NodeError::Cancelled(job)),
                    _ = tokio::time::sleep(delay) => {}
                }
                retry += 1;
            }
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 2;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Batches one source partition delivered in one attempt.
#[derive(Debug, Default)]
struct Contribution {
    attempt: Attempt,
    batches: BTreeMap<u32, Vec<KeyValue>>,
}

#[derive(Debug, Default)]
struct JobAccumulators {
    contributions: BTreeMap<PartitionId, Contribution>,
    /// Set once the reduce has consumed the contributions.
    reduced: Option<JobResult>,
}

/// Outcome of appending a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    Stored,
    Duplicate,
    Stale,
    AlreadyReduced,
}

/// Per-job reduce accumulators of one node.
///
/// Contributions are kept per source partition and tagged with the attempt
/// that produced them, so a redelivered batch is stored once and a newer
/// attempt replaces everything an older one delivered.
#[derive(Debug, Default)]
pub struct AccumulatorStore {
    jobs: DashMap<JobId, Arc<Mutex<JobAccumulators>>>,
}

impl AccumulatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn job(&self, job: JobId) -> Arc<Mutex<JobAccumulators>> {
        self.jobs.entry(job).or_default().value().clone()
    }

    pub fn append(&self, batch: ShuffleBatch) -> Appended {
        let job = self.job(batch.job);
        let mut state = job.lock().unwrap_or_else(PoisonError::into_inner);
        if state.reduced.is_some() {
            return Appended::AlreadyReduced;
        }

        let contribution = state.contributions.entry(batch.source).or_default();
        if batch.attempt < contribution.attempt {
            return Appended::Stale;
        }
        if batch.attempt > contribution.attempt {
            *contribution = Contribution {
                attempt: batch.attempt,
                batches: BTreeMap::new(),
            };
        }
        if contribution.batches.contains_key(&batch.seq) {
            return Appended::Duplicate;
        }
        contribution.batches.insert(batch.seq, batch.records);
        Appended::Stored
    }

    /// The attempt currently held for `partition` and how many of its
    /// batches have landed.
    pub fn received(&self, job: JobId, partition: PartitionId) -> Option<(Attempt, u32)> {
        let job = self.jobs.get(&job)?.value().clone();
        let state = job.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .contributions
            .get(&partition)
            .map(|c| (c.attempt, c.batches.len() as u32))
    }

    /// Runs `reduce` over the confirmed contributions of `job`.
    ///
    /// Fails with [`NodeError::IncompleteShuffle`] unless every expected
    /// batch has landed. The contributions are consumed only if `reduce`
    /// succeeds; its result is kept so that a repeated request gets the same
    /// answer.
    pub fn consume<F>(
        &self,
        node: NodeId,
        job: JobId,
        expected: &[ShuffleReceipt],
        reduce: F,
    ) -> Result<JobResult, NodeError>
    where
        F: FnOnce(BTreeMap<Bytes, Vec<Bytes>>) -> Result<JobResult, NodeError>,
    {
        let accumulators = self.job(job);
        let mut state = accumulators.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = &state.reduced {
            return Ok(result.clone());
        }

        let mut receipts = expected.to_vec();
        receipts.sort_by_key(|receipt| receipt.partition);

        for receipt in receipts.iter().filter(|r| r.batches > 0) {
            let received = state
                .contributions
                .get(&receipt.partition)
                .filter(|c| c.attempt == receipt.attempt)
                .map_or(0, |c| c.batches.range(..receipt.batches).count() as u32);
            if received < receipt.batches {
                return Err(NodeError::IncompleteShuffle {
                    node,
                    partition: receipt.partition,
                    expected: receipt.batches,
                    received,
                });
            }
        }

        let mut grouped: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
        for receipt in receipts.iter().filter(|r| r.batches > 0) {
            let Some(contribution) = state.contributions.get(&receipt.partition) else {
                continue;
            };
            for records in contribution.batches.range(..receipt.batches).map(|(_, r)| r) {
                for record in records {
                    grouped
                        .entry(record.key.clone())
                        .or_default()
                        .push(record.value.clone());
                }
            }
        }

        let result = reduce(grouped)?;
        state.contributions.clear();
        state.reduced = Some(result.clone());
        Ok(result)
    }

    /// Drops everything held for `job`.
    pub fn release(&self, job: JobId) -> bool {
        self.jobs.remove(&job).is_some()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}
