//! Drives one job from planning to its outcome.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{JobFailure, StageError, TransportError};
use common::message::{
    JobResult, MapRequest, NodeMessage, NodeReply, PartitionReport, ReduceRequest, ShuffleReceipt,
};
use common::transport::Transport;
use common::{
    Attempt, EngineConfig, JobId, JobSpec, JobState, NodeId, PartitionDirectory, PartitionId,
    Stage,
};

use crate::handle::{JobOutcome, ResultCell};
use crate::jobs::JobStatus;
use crate::planner::PartitionPlanner;

/// Turns the assembled result into the value the job's handle resolves with.
pub struct Collation<T> {
    finish: Box<dyn FnOnce(JobResult) -> anyhow::Result<T> + Send>,
    /// Whether a user-supplied collator runs, as opposed to a plain
    /// conversion of the result.
    user_supplied: bool,
}

impl<T> Collation<T> {
    pub fn collator<F>(collator: F) -> Self
    where
        F: FnOnce(JobResult) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            finish: Box::new(collator),
            user_supplied: true,
        }
    }

    pub fn conversion<F>(convert: F) -> Self
    where
        F: FnOnce(JobResult) -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            finish: Box::new(convert),
            user_supplied: false,
        }
    }
}

impl Collation<JobResult> {
    pub fn identity() -> Self {
        Self::conversion(Ok)
    }
}

type DispatchResult = (PartitionId, Attempt, Result<PartitionReport, JobFailure>);
type ReduceResult = (NodeId, u32, Vec<ShuffleReceipt>, Result<JobResult, JobFailure>);

enum MapPhase {
    Done(Vec<PartitionReport>),
    /// A reduce node left; the map phase must run again against the new
    /// membership, with attempts numbered from `next_attempt`.
    ReduceNodeLost { node: NodeId, next_attempt: Attempt },
}

struct InFlight {
    /// Owner the attempt was sent to, if it was resolved at dispatch time.
    node: Option<NodeId>,
    attempt: Attempt,
    failures: u32,
    abort: AbortHandle,
}

/// Supervises one job.
pub struct JobCoordinator {
    id: JobId,
    spec: Arc<JobSpec>,
    config: Arc<EngineConfig>,
    directory: Arc<dyn PartitionDirectory>,
    transport: Arc<dyn Transport>,
    status: Arc<JobStatus>,
    cancel: CancellationToken,
}

impl JobCoordinator {
    pub fn new(
        spec: Arc<JobSpec>,
        config: Arc<EngineConfig>,
        directory: Arc<dyn PartitionDirectory>,
        transport: Arc<dyn Transport>,
        status: Arc<JobStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: status.id(),
            spec,
            config,
            directory,
            transport,
            status,
            cancel,
        }
    }

    /// Runs the job to its end and resolves `cell`.
    pub(crate) async fn run<T>(self, collation: Collation<T>, cell: Arc<ResultCell<T>>)
    where
        T: Send + Sync + 'static,
    {
        info!("{} submitted against `{}`", self.id, self.spec.source);
        let timeout = self.config.job_timeout();
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => JobOutcome::Cancelled,
            _ = deadline => {
                let timeout = timeout.unwrap_or_default();
                warn!("{} timed out after {:?}", self.id, timeout);
                JobOutcome::Failed(JobFailure::Timeout(timeout))
            }
            outcome = self.execute_and_collate(collation) => outcome,
        };

        match &outcome {
            JobOutcome::Completed(_) => info!("{} completed", self.id),
            JobOutcome::Failed(failure) => warn!("{} failed: {}", self.id, failure),
            JobOutcome::Cancelled => info!("{} cancelled", self.id),
        }

        self.cancel.cancel();
        self.release().await;
        cell.resolve(outcome);
    }

    /// Everything from planning through collation, raced as one against
    /// cancellation and the deadline.
    async fn execute_and_collate<T>(&self, collation: Collation<T>) -> JobOutcome<T>
    where
        T: Send + 'static,
    {
        match self.execute().await {
            Ok(result) => self.collate(collation, result).await,
            Err(failure) => JobOutcome::Failed(failure),
        }
    }

    async fn execute(&self) -> Result<JobResult, JobFailure> {
        self.status.transition(JobState::Planning);
        let planner = PartitionPlanner::new(self.directory.clone());
        let mut assigned = self.plan(&planner).await?;
        let empty = JobResult::empty(self.spec.reducer.is_some());
        if assigned.is_empty() {
            info!("{} has nothing to map", self.id);
            return Ok(empty);
        }
        self.status.set_total_partitions(assigned.len());

        let mut first_attempt = 1;
        let mut round = 1;
        let (reports, reduce_nodes) = loop {
            let reduce_nodes: Arc<[NodeId]> = planner.members().into();
            self.status.transition(JobState::Mapping);
            match self
                .map_all(&planner, assigned, reduce_nodes.clone(), first_attempt)
                .await?
            {
                MapPhase::Done(reports) => break (reports, reduce_nodes),
                MapPhase::ReduceNodeLost { node, next_attempt } => {
                    if round >= self.config.max_partition_attempts {
                        return Err(TransportError::Unreachable(node).into());
                    }
                    warn!(
                        "{}: reduce node {} left during mapping, mapping again",
                        self.id, node
                    );
                    round += 1;
                    first_attempt = next_attempt;
                    self.status.record_retry();
                    self.status.reset_progress();
                    self.status.transition(JobState::Planning);
                    assigned = self.plan(&planner).await?;
                }
            }
        };

        self.status.transition(JobState::Shuffling);
        let receipts = expected_receipts(&reports, &reduce_nodes);
        debug!(
            "{} shuffled {} partitions to {} reduce nodes",
            self.id,
            reports.len(),
            receipts.len()
        );

        self.status.transition(JobState::Reducing);
        self.reduce_all(receipts, empty).await
    }

    /// Plans the job, waiting out partitions whose ownership is in flux.
    async fn plan(&self, planner: &PartitionPlanner) -> Result<BTreeMap<PartitionId, NodeId>, JobFailure> {
        let mut plan = planner.plan(&self.spec.filter);
        let mut round = 1;
        while let Some(partition) = plan.pending.first().copied() {
            if round >= self.config.max_planning_attempts {
                return Err(JobFailure::PartitionUnavailable {
                    partition,
                    attempts: round,
                });
            }
            let backoff = self.config.planning_backoff(round);
            warn!(
                "{}: {} partitions have no owner, planning again in {:?}",
                self.id,
                plan.pending.len(),
                backoff
            );
            tokio::time::sleep(backoff).await;
            round += 1;

            let pending: Vec<PartitionId> = plan.pending.iter().copied().collect();
            for partition in pending {
                if let Some(node) = planner.resolve(partition) {
                    plan.assign(partition, node);
                }
            }
        }
        Ok(plan.assigned)
    }

    async fn map_all(
        &self,
        planner: &PartitionPlanner,
        assigned: BTreeMap<PartitionId, NodeId>,
        reduce_nodes: Arc<[NodeId]>,
        first_attempt: Attempt,
    ) -> Result<MapPhase, JobFailure> {
        let mut tasks: JoinSet<DispatchResult> = JoinSet::new();
        let mut in_flight: HashMap<PartitionId, InFlight> = HashMap::new();
        let mut reports = BTreeMap::new();
        let mut membership = self.directory.subscribe();
        membership.borrow_and_update();
        let mut watching = true;
        let mut last_attempt = first_attempt;
        if let Some(node) = reduce_nodes.iter().find(|node| !self.directory.is_member(**node)) {
            return Ok(MapPhase::ReduceNodeLost {
                node: *node,
                next_attempt: first_attempt,
            });
        }

        for (partition, node) in assigned {
            let abort = self.dispatch(
                &mut tasks,
                partition,
                first_attempt,
                Some(node),
                Duration::ZERO,
                &reduce_nodes,
            );
            in_flight.insert(
                partition,
                InFlight {
                    node: Some(node),
                    attempt: first_attempt,
                    failures: 0,
                    abort,
                },
            );
        }

        while !in_flight.is_empty() {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        return Err(JobFailure::Protocol("dispatch tasks vanished".to_string()));
                    };
                    let (partition, attempt, result) = match joined {
                        Ok(finished) => finished,
                        Err(err) if err.is_cancelled() => continue,
                        Err(err) => {
                            return Err(JobFailure::Protocol(format!("dispatch task failed: {}", err)))
                        }
                    };
                    let failures = match in_flight.get(&partition) {
                        Some(flight) if flight.attempt == attempt => flight.failures,
                        // Superseded by a newer attempt.
                        _ => continue,
                    };

                    match result {
                        Ok(report) => {
                            in_flight.remove(&partition);
                            self.status.partition_processed();
                            debug!("{}: {} done on {}", self.id, partition, report.node);
                            reports.insert(partition, report);
                        }
                        Err(failure) => {
                            let failures = failures + 1;
                            if failures >= self.config.max_partition_attempts {
                                warn!("{}: {} failed {} times", self.id, partition, failures);
                                return Err(failure);
                            }
                            let backoff = self.config.retry_backoff(failures);
                            warn!(
                                "{}: {} attempt {} failed, retrying in {:?}: {}",
                                self.id, partition, attempt, backoff, failure
                            );
                            self.status.record_retry();
                            let node = planner.resolve(partition);
                            last_attempt = last_attempt.max(attempt + 1);
                            let abort = self.dispatch(&mut tasks, partition, attempt + 1, node, backoff, &reduce_nodes);
                            in_flight.insert(
                                partition,
                                InFlight {
                                    node,
                                    attempt: attempt + 1,
                                    failures,
                                    abort,
                                },
                            );
                        }
                    }
                }
                changed = membership.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let members = planner.members();
                    if let Some(node) = reduce_nodes.iter().find(|node| !members.contains(node)) {
                        return Ok(MapPhase::ReduceNodeLost {
                            node: *node,
                            next_attempt: last_attempt + 1,
                        });
                    }
                    let lost: Vec<PartitionId> = in_flight
                        .iter()
                        .filter(|(_, flight)| flight.node.map_or(false, |node| !members.contains(&node)))
                        .map(|(partition, _)| *partition)
                        .collect();
                    for partition in lost {
                        let Some(flight) = in_flight.remove(&partition) else {
                            continue;
                        };
                        flight.abort.abort();
                        let node = planner.resolve(partition);
                        warn!(
                            "{}: owner of {} left, moving it to {:?}",
                            self.id, partition, node
                        );
                        self.status.record_retry();
                        let attempt = flight.attempt + 1;
                        last_attempt = last_attempt.max(attempt);
                        let abort = self.dispatch(&mut tasks, partition, attempt, node, Duration::ZERO, &reduce_nodes);
                        in_flight.insert(
                            partition,
                            InFlight {
                                node,
                                attempt,
                                failures: flight.failures,
                                abort,
                            },
                        );
                    }
                }
            }
        }

        Ok(MapPhase::Done(reports.into_values().collect()))
    }

    /// Sends one partition attempt to its owner on a new task.
    ///
    /// Without a known owner the task resolves one itself, waiting for
    /// ownership to settle.
    fn dispatch(
        &self,
        tasks: &mut JoinSet<DispatchResult>,
        partition: PartitionId,
        attempt: Attempt,
        node: Option<NodeId>,
        backoff: Duration,
        reduce_nodes: &Arc<[NodeId]>,
    ) -> AbortHandle {
        let request = MapRequest {
            job: self.id,
            spec: self.spec.clone(),
            partition,
            attempt,
            partition_count: self.directory.partition_count(),
            reduce_nodes: reduce_nodes.clone(),
        };
        let transport = self.transport.clone();
        let directory = self.directory.clone();
        let config = self.config.clone();

        tasks.spawn(async move {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            let result: Result<PartitionReport, JobFailure> = async {
                let node = match node.or_else(|| directory.owner_of(partition)) {
                    Some(node) => node,
                    None => wait_for_owner(directory.as_ref(), &config, partition).await?,
                };
                match transport.send(node, NodeMessage::MapPartition(request)).await? {
                    NodeReply::Mapped(report) => Ok(report),
                    other => Err(JobFailure::Protocol(format!(
                        "{} answered a map request with {:?}",
                        node, other
                    ))),
                }
            }
            .await;
            (partition, attempt, result)
        })
    }

    async fn reduce_all(
        &self,
        receipts: BTreeMap<NodeId, Vec<ShuffleReceipt>>,
        mut merged: JobResult,
    ) -> Result<JobResult, JobFailure> {
        let mut tasks: JoinSet<ReduceResult> = JoinSet::new();
        for (node, expected) in receipts {
            self.dispatch_reduce(&mut tasks, node, expected, 0, Duration::ZERO);
        }

        while let Some(joined) = tasks.join_next().await {
            let (node, failures, expected, result) = joined
                .map_err(|err| JobFailure::Protocol(format!("reduce task failed: {}", err)))?;
            match result {
                Ok(partial) => {
                    debug!("{}: {} reduced {} keys", self.id, node, partial.len());
                    merged.merge(partial).map_err(|_| {
                        JobFailure::Protocol(format!("{} returned a result of the wrong shape", node))
                    })?;
                }
                Err(failure) => {
                    let failures = failures + 1;
                    if failures >= self.config.max_partition_attempts {
                        warn!("{}: reduce on {} failed {} times", self.id, node, failures);
                        return Err(failure);
                    }
                    let backoff = self.config.retry_backoff(failures);
                    warn!(
                        "{}: reduce on {} failed, retrying in {:?}: {}",
                        self.id, node, backoff, failure
                    );
                    self.status.record_retry();
                    self.dispatch_reduce(&mut tasks, node, expected, failures, backoff);
                }
            }
        }
        Ok(merged)
    }

    fn dispatch_reduce(
        &self,
        tasks: &mut JoinSet<ReduceResult>,
        node: NodeId,
        expected: Vec<ShuffleReceipt>,
        failures: u32,
        backoff: Duration,
    ) {
        let request = ReduceRequest {
            job: self.id,
            reducer: self.spec.reducer,
            aux: self.spec.aux.clone(),
            expected,
        };
        let transport = self.transport.clone();
        tasks.spawn(async move {
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            let expected = request.expected.clone();
            let result = match transport.send(node, NodeMessage::Reduce(request)).await {
                Ok(NodeReply::Reduced(partial)) => Ok(partial),
                Ok(other) => Err(JobFailure::Protocol(format!(
                    "{} answered a reduce request with {:?}",
                    node, other
                ))),
                Err(err) => Err(err.into()),
            };
            (node, failures, expected, result)
        });
    }

    async fn collate<T>(&self, collation: Collation<T>, result: JobResult) -> JobOutcome<T>
    where
        T: Send + 'static,
    {
        if collation.user_supplied {
            self.status.transition(JobState::Collating);
        }
        let finish = collation.finish;
        let collated = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(move || finish(result)))
        })
        .await;
        match collated {
            Ok(Ok(Ok(value))) => JobOutcome::Completed(value),
            Ok(Ok(Err(err))) => JobOutcome::Failed(StageError::new(Stage::Collate, err).into()),
            Ok(Err(payload)) => {
                JobOutcome::Failed(StageError::panicked(Stage::Collate, payload).into())
            }
            Err(err) => JobOutcome::Failed(
                StageError::new(Stage::Collate, anyhow!("collator task aborted: {}", err)).into(),
            ),
        }
    }

    /// Tells every member to drop what it holds for this job.
    async fn release(&self) {
        for node in self.directory.members() {
            match self.transport.send(node, NodeMessage::Release { job: self.id }).await {
                Ok(_) => {}
                Err(err) => debug!("{}: could not release {}: {}", self.id, node, err),
            }
        }
    }
}

async fn wait_for_owner(
    directory: &dyn PartitionDirectory,
    config: &EngineConfig,
    partition: PartitionId,
) -> Result<NodeId, JobFailure> {
    for round in 1..config.max_planning_attempts {
        tokio::time::sleep(config.planning_backoff(round)).await;
        if let Some(node) = directory.owner_of(partition) {
            return Ok(node);
        }
    }
    Err(JobFailure::PartitionUnavailable {
        partition,
        attempts: config.max_planning_attempts,
    })
}

/// What each reduce node must have received before it may reduce.
///
/// Every node that was sent at least one batch gets a receipt for every
/// partition, including partitions that sent it nothing.
fn expected_receipts(
    reports: &[PartitionReport],
    reduce_nodes: &[NodeId],
) -> BTreeMap<NodeId, Vec<ShuffleReceipt>> {
    reduce_nodes
        .iter()
        .filter(|node| {
            reports
                .iter()
                .any(|report| report.batches.get(*node).map_or(false, |n| *n > 0))
        })
        .map(|node| {
            let receipts = reports
                .iter()
                .map(|report| ShuffleReceipt {
                    partition: report.partition,
                    attempt: report.attempt,
                    batches: report.batches.get(node).copied().unwrap_or(0),
                })
                .collect();
            (*node, receipts)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(partition: u32, attempt: Attempt, batches: &[(u32, u32)]) -> PartitionReport {
        PartitionReport {
            partition: PartitionId(partition),
            attempt,
            node: NodeId(1),
            mapped_keys: 1,
            emitted: 1,
            batches: batches.iter().map(|(n, b)| (NodeId(*n), *b)).collect(),
        }
    }

    #[test]
    fn receipts_cover_every_partition_for_busy_nodes() {
        let reports = vec![report(0, 1, &[(1, 2)]), report(1, 3, &[(1, 1), (2, 1)])];

        let receipts = expected_receipts(&reports, &[NodeId(1), NodeId(2), NodeId(3)]);

        assert_eq!(receipts.len(), 2);
        assert_eq!(
            receipts[&NodeId(2)],
            vec![
                ShuffleReceipt {
                    partition: PartitionId(0),
                    attempt: 1,
                    batches: 0
                },
                ShuffleReceipt {
                    partition: PartitionId(1),
                    attempt: 3,
                    batches: 1
                },
            ]
        );
        assert!(!receipts.contains_key(&NodeId(3)));
    }

    #[test]
    fn collation_failures_are_stage_errors() {
        let collation: Collation<usize> = Collation::collator(|_| Err(anyhow::anyhow!("no")));
        let finish = collation.finish;
        let err = finish(JobResult::empty(true)).unwrap_err();
        assert_eq!(err.to_string(), "no");
    }
}
