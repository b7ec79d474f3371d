mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use bytes::Bytes;

use common::error::{JobError, JobFailure, StageError, TransportError};
use common::{partition_for, EngineConfig, JobId, JobState, KeyValue, MapOutput, NodeId, Stage};
use mrg_coordinator::LocalCluster;

use support::{cluster, fast_config, grouped_text, wait_for};

fn slow_identity(kv: KeyValue, aux: Bytes) -> MapOutput {
    std::thread::sleep(Duration::from_millis(50));
    workload::identity::map(kv, aux)
}

fn numbered(cluster: &LocalCluster, count: u32) {
    let entries: Vec<(String, String)> = (1..=count)
        .map(|i| (i.to_string(), format!("v{}", i)))
        .collect();
    cluster.store().put_all("input", entries);
}

#[tokio::test]
async fn unreachable_node_fails_the_job_after_retries() {
    let cluster = cluster(3, 12);
    numbered(&cluster, 30);
    cluster.transport().set_unreachable(NodeId(2), true);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit()
        .unwrap();
    let err = handle.get().await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Failed(JobFailure::Transport(TransportError::Unreachable(NodeId(2))))
    ));
    assert_eq!(handle.state(), JobState::Failed);
    assert!(cluster.engine().tracked_job(handle.id()).unwrap().retries > 0);
    assert!(cluster.worker(NodeId(1)).unwrap().is_released(handle.id()));
}

static FLAKY_CALLS: AtomicU32 = AtomicU32::new(0);

fn flaky_map(kv: KeyValue, aux: Bytes) -> MapOutput {
    if kv.key == Bytes::from("7") && FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
        return Err(anyhow!("transient failure"));
    }
    workload::identity::map(kv, aux)
}

#[tokio::test]
async fn failed_partition_is_retried_without_duplicates() {
    let cluster = cluster(3, 8);
    numbered(&cluster, 20);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(flaky_map)
        .submit()
        .unwrap();
    let grouped = grouped_text(&handle.get().await.unwrap());

    assert_eq!(grouped.len(), 20);
    assert!(grouped.values().all(|values| values.len() == 1));
    assert_eq!(cluster.engine().tracked_job(handle.id()).unwrap().retries, 1);
}

fn broken_map(kv: KeyValue, aux: Bytes) -> MapOutput {
    if kv.key == Bytes::from("3") {
        return Err(anyhow!("cannot map key 3"));
    }
    workload::identity::map(kv, aux)
}

#[tokio::test]
async fn mapper_errors_fail_the_job_with_their_cause() {
    let cluster = cluster(2, 8);
    numbered(&cluster, 10);

    let err = cluster
        .engine()
        .job("input")
        .mapper(broken_map)
        .submit()
        .unwrap()
        .get()
        .await
        .unwrap_err();

    match err.failure() {
        Some(JobFailure::StageExecution(StageError { stage, key, .. })) => {
            assert_eq!(*stage, Stage::Map);
            assert_eq!(key.as_ref(), Some(&Bytes::from("3")));
        }
        other => panic!("unexpected failure {:?}", other),
    }
}

static REDUCE_CALLS: AtomicU32 = AtomicU32::new(0);

fn reduce_fails_once(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes> {
    if REDUCE_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
        return Err(anyhow!("reducer hiccup"));
    }
    workload::sum::reduce(key, values, aux)
}

#[tokio::test]
async fn reducer_failure_keeps_accumulators_for_the_retry() {
    let cluster = cluster(3, 8);
    cluster
        .store()
        .put_all("input", [("1", "10"), ("2", "20"), ("3", "30")]);

    let reduced = cluster
        .engine()
        .job("input")
        .mapper(workload::sum::map)
        .reducer(reduce_fails_once)
        .submit()
        .unwrap()
        .get()
        .await
        .unwrap();

    assert_eq!(reduced[&Bytes::from("all")], Bytes::from("60"));
    assert_eq!(REDUCE_CALLS.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transient_send_failures_are_retried() {
    let cluster = cluster(3, 8);
    numbered(&cluster, 40);
    cluster.transport().fail_next(NodeId(2), 2);
    cluster.transport().fail_next(NodeId(3), 1);

    let grouped = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit()
        .unwrap()
        .get()
        .await
        .unwrap();

    let grouped = grouped_text(&grouped);
    assert_eq!(grouped.len(), 40);
    assert!(grouped.values().all(|values| values.len() == 1));
}

#[tokio::test]
async fn unknown_source_fails_the_job() {
    let cluster = cluster(2, 4);

    let err = cluster
        .engine()
        .job("missing")
        .mapper(workload::identity::map)
        .submit()
        .unwrap()
        .get()
        .await
        .unwrap_err();

    assert!(matches!(
        err.failure(),
        Some(JobFailure::UnknownSource(name)) if name == "missing"
    ));
}

#[tokio::test]
async fn cancel_resolves_and_releases_every_node() {
    let cluster = cluster(3, 8);
    numbered(&cluster, 40);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(slow_identity)
        .submit()
        .unwrap();
    wait_for("mapping to start", || handle.state() == JobState::Mapping).await;

    assert!(handle.cancel());
    assert!(handle.get().await.unwrap_err().is_cancelled());
    assert_eq!(handle.state(), JobState::Cancelled);
    assert!(!handle.cancel());

    let id = handle.id();
    wait_for("every node to release the job", || {
        cluster
            .nodes()
            .into_iter()
            .all(|node| cluster.worker(node).map_or(false, |worker| worker.is_released(id)))
    })
    .await;
    // Cancellation is final even after the coordinator winds down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.state(), JobState::Cancelled);
}

#[tokio::test]
async fn timeout_fails_the_job() {
    let config = EngineConfig {
        job_timeout_ms: 100,
        ..fast_config(4)
    };
    let cluster = LocalCluster::start(2, config).unwrap();
    numbered(&cluster, 40);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(slow_identity)
        .submit()
        .unwrap();
    let err = handle.get().await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Failed(JobFailure::Timeout(timeout)) if timeout == Duration::from_millis(100)
    ));
    assert_eq!(handle.state(), JobState::Failed);
}

#[tokio::test]
async fn timeout_covers_a_slow_collator() {
    let config = EngineConfig {
        job_timeout_ms: 100,
        ..fast_config(4)
    };
    let cluster = LocalCluster::start(2, config).unwrap();
    numbered(&cluster, 2);

    let started = Instant::now();
    let handle = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit_with(|grouped| {
            std::thread::sleep(Duration::from_millis(400));
            Ok(grouped.len())
        })
        .unwrap();
    let err = handle.get().await.unwrap_err();

    assert!(matches!(
        err,
        JobError::Failed(JobFailure::Timeout(timeout)) if timeout == Duration::from_millis(100)
    ));
    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(handle.state(), JobState::Failed);
}

fn slow_sum(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    aux: Bytes,
) -> anyhow::Result<Bytes> {
    std::thread::sleep(Duration::from_millis(50));
    workload::sum::reduce(key, values, aux)
}

async fn assert_released_everywhere(cluster: &LocalCluster, id: JobId) {
    wait_for("every node to release the job", || {
        cluster
            .nodes()
            .into_iter()
            .all(|node| cluster.worker(node).map_or(false, |worker| worker.is_released(id)))
    })
    .await;
}

#[tokio::test]
async fn cancel_while_planning() {
    let config = EngineConfig {
        planning_backoff_ms: 50,
        max_planning_attempts: 10,
        ..fast_config(8)
    };
    let cluster = LocalCluster::start(2, config).unwrap();
    numbered(&cluster, 10);
    cluster.membership().begin_migration(partition_for(b"1", 8));

    let handle = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit()
        .unwrap();
    wait_for("planning to start", || handle.state() == JobState::Planning).await;

    assert!(handle.cancel());
    assert!(handle.get().await.unwrap_err().is_cancelled());
    assert_eq!(handle.state(), JobState::Cancelled);
    assert_released_everywhere(&cluster, handle.id()).await;
}

#[tokio::test]
async fn cancel_while_reducing() {
    let cluster = cluster(3, 8);
    let entries: Vec<(String, String)> = (1..=40).map(|i| (i.to_string(), i.to_string())).collect();
    cluster.store().put_all("input", entries);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .reducer(slow_sum)
        .submit()
        .unwrap();
    wait_for("reducing to start", || handle.state() == JobState::Reducing).await;

    assert!(handle.cancel());
    assert!(handle.get().await.unwrap_err().is_cancelled());
    assert_eq!(handle.state(), JobState::Cancelled);
    assert_released_everywhere(&cluster, handle.id()).await;
}

#[tokio::test]
async fn departed_node_work_is_replanned() {
    let cluster = cluster(3, 8);
    numbered(&cluster, 30);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(slow_identity)
        .submit()
        .unwrap();
    wait_for("mapping to start", || handle.state() == JobState::Mapping).await;
    cluster.depart(NodeId(3));

    let grouped = grouped_text(&handle.get().await.unwrap());

    assert_eq!(grouped.len(), 30);
    for (key, values) in &grouped {
        assert_eq!(values, &vec![format!("v{}", key)]);
    }
    assert!(cluster.engine().tracked_job(handle.id()).unwrap().retries > 0);
    assert_eq!(cluster.nodes(), vec![NodeId(1), NodeId(2)]);
}

#[tokio::test]
async fn migrating_partition_is_awaited() {
    let cluster = cluster(2, 8);
    numbered(&cluster, 10);
    let partition = partition_for(b"1", 8);
    cluster.membership().begin_migration(partition);

    let handle = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.membership().complete_migration(partition, NodeId(1));

    let grouped = grouped_text(&handle.get().await.unwrap());
    assert_eq!(grouped.len(), 10);
    assert_eq!(grouped["1"], vec!["v1"]);
}

#[tokio::test]
async fn partition_without_owner_fails_planning() {
    let cluster = cluster(2, 8);
    numbered(&cluster, 10);
    let partition = partition_for(b"1", 8);
    cluster.membership().begin_migration(partition);

    let err = cluster
        .engine()
        .job("input")
        .mapper(workload::identity::map)
        .submit()
        .unwrap()
        .get()
        .await
        .unwrap_err();

    assert!(matches!(
        err.failure(),
        Some(JobFailure::PartitionUnavailable { partition: p, attempts: 5 }) if *p == partition
    ));
}

#[tokio::test]
async fn misconfigured_jobs_are_rejected_before_submission() {
    let cluster = cluster(1, 4);
    let engine = cluster.engine();

    let twice = engine
        .job("input")
        .key_predicate(workload::predicates::even_keys)
        .unwrap()
        .key_predicate(workload::predicates::odd_keys);
    assert!(matches!(
        twice,
        Err(common::error::ConfigurationError::KeyPredicateAlreadySet)
    ));

    let combiners = engine
        .job("input")
        .mapper(workload::identity::map)
        .combiner(workload::sum::reduce)
        .unwrap()
        .combiner(workload::sum::reduce);
    assert!(matches!(
        combiners,
        Err(common::error::ConfigurationError::CombinerAlreadySet)
    ));

    let unnamed = engine.job("").mapper(workload::identity::map).submit();
    assert!(matches!(
        unnamed,
        Err(common::error::ConfigurationError::MissingSource)
    ));

    assert!(engine.jobs().is_empty());
}
