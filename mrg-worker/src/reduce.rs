use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{NodeError, StageError};
use common::message::{JobResult, ReduceRequest};
use common::{JobId, NodeId, ReduceFn, Stage};

use crate::shuffle::AccumulatorStore;

/// Reduces every key this node owns for the job in `request`.
///
/// Without a reducer the grouped values are the result. Blocking; call it
/// from a blocking task.
pub fn perform_reduce(
    node: NodeId,
    accumulators: &AccumulatorStore,
    request: &ReduceRequest,
    token: &CancellationToken,
) -> Result<JobResult, NodeError> {
    accumulators.consume(node, request.job, &request.expected, |grouped| {
        debug!("{} reducing {} keys of {}", node, grouped.len(), request.job);
        match request.reducer {
            None => Ok(JobResult::Grouped(grouped)),
            Some(reducer) => {
                reduce_groups(request.job, reducer, grouped, &request.aux, token).map(JobResult::Reduced)
            }
        }
    })
}

fn reduce_groups(
    job: JobId,
    reducer: ReduceFn,
    grouped: BTreeMap<Bytes, Vec<Bytes>>,
    aux: &Bytes,
    token: &CancellationToken,
) -> Result<BTreeMap<Bytes, Bytes>, NodeError> {
    let mut reduced = BTreeMap::new();
    for (key, values) in grouped {
        if token.is_cancelled() {
            return Err(NodeError::Cancelled(job));
        }
        let aux = aux.clone();
        let reduce_key = key.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            reducer(reduce_key, Box::new(values.into_iter()), aux)
        }));
        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(StageError::new(Stage::Reduce, err).at_key(key).into()),
            Err(payload) => return Err(StageError::panicked(Stage::Reduce, payload).at_key(key).into()),
        };
        reduced.insert(key, value);
    }
    Ok(reduced)
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use common::message::{ShuffleBatch, ShuffleReceipt};
    use common::{KeyValue, PartitionId};

    use super::*;

    fn picky(key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, aux: Bytes) -> anyhow::Result<Bytes> {
        if key == aux {
            bail!("refusing {:?}", key);
        }
        Ok(Bytes::from(values.count().to_string()))
    }

    fn loaded() -> AccumulatorStore {
        let store = AccumulatorStore::new();
        store.append(ShuffleBatch {
            job: JobId(9),
            source: PartitionId(0),
            attempt: 1,
            seq: 0,
            records: vec![
                KeyValue::new("a", "1"),
                KeyValue::new("b", "1"),
                KeyValue::new("a", "1"),
            ],
        });
        store
    }

    fn request(reducer: Option<ReduceFn>, aux: &'static str) -> ReduceRequest {
        ReduceRequest {
            job: JobId(9),
            reducer,
            aux: Bytes::from_static(aux.as_bytes()),
            expected: vec![ShuffleReceipt {
                partition: PartitionId(0),
                attempt: 1,
                batches: 1,
            }],
        }
    }

    #[test]
    fn reducer_runs_per_key() {
        let store = loaded();

        let result = perform_reduce(NodeId(1), &store, &request(Some(picky), ""), &CancellationToken::new()).unwrap();

        let reduced = result.into_reduced().unwrap();
        assert_eq!(reduced[&Bytes::from("a")], Bytes::from("2"));
        assert_eq!(reduced[&Bytes::from("b")], Bytes::from("1"));
    }

    #[test]
    fn missing_reducer_returns_groups() {
        let store = loaded();

        let result = perform_reduce(NodeId(1), &store, &request(None, ""), &CancellationToken::new()).unwrap();

        let grouped = result.into_grouped().unwrap();
        assert_eq!(grouped[&Bytes::from("a")].len(), 2);
    }

    #[test]
    fn reducer_failure_is_a_stage_error_and_retryable() {
        let store = loaded();

        let err = perform_reduce(NodeId(1), &store, &request(Some(picky), "b"), &CancellationToken::new()).unwrap_err();

        match err {
            NodeError::Stage(stage) => {
                assert_eq!(stage.stage, Stage::Reduce);
                assert_eq!(stage.key, Some(Bytes::from("b")));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.received(JobId(9), PartitionId(0)), Some((1, 1)));
        assert!(perform_reduce(NodeId(1), &store, &request(Some(picky), ""), &CancellationToken::new()).is_ok());
    }
}
