//! Map and combine stages, run on the node that owns a partition.

use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use itertools::Itertools;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{NodeError, StageError};
use common::source::KeyedSource;
use common::{partition_for, CombineFn, JobId, JobSpec, KeyValue, PartitionId, Stage};

/// Emissions of one partition attempt, buffered until the whole partition
/// has been mapped.
#[derive(Debug, Default)]
pub struct MappedPartition {
    pub records: Vec<KeyValue>,
    pub mapped_keys: u64,
}

/// Runs the mapper over every key of `partition` that passes the job's filter.
///
/// Blocking; call it from a blocking task.
pub fn map_partition(
    source: &dyn KeyedSource,
    job: JobId,
    spec: &JobSpec,
    partition: PartitionId,
    partition_count: u32,
    token: &CancellationToken,
) -> Result<MappedPartition, NodeError> {
    let keys: Vec<Bytes> = match &spec.filter.keys {
        // Only explicit keys can be looked up directly.
        Some(keys) => keys
            .iter()
            .filter(|key| partition_for(key, partition_count) == partition)
            .cloned()
            .collect(),
        None => source.owned_keys(&spec.source, partition)?,
    };

    let mut output = MappedPartition::default();
    for key in keys {
        if token.is_cancelled() {
            return Err(NodeError::Cancelled(job));
        }

        if let Some(predicate) = spec.filter.predicate {
            let aux = spec.aux.clone();
            let admitted = catch_unwind(AssertUnwindSafe(|| predicate(&key, aux))).map_err(|payload| {
                StageError::panicked(Stage::Map, payload)
                    .in_partition(partition)
                    .at_key(key.clone())
            })?;
            if !admitted {
                continue;
            }
        }

        let Some(value) = source.value_for(&spec.source, &key)? else {
            continue;
        };

        let emitted = invoke_mapper(spec, KeyValue::new(key.clone(), value))
            .map_err(|err| err.in_partition(partition).at_key(key))?;
        output.mapped_keys += 1;
        output.records.extend(emitted);
    }

    debug!(
        "mapped {} keys of {} into {} records",
        output.mapped_keys,
        partition,
        output.records.len()
    );
    Ok(output)
}

fn invoke_mapper(spec: &JobSpec, kv: KeyValue) -> Result<Vec<KeyValue>, StageError> {
    let mapper = spec.mapper;
    let aux = spec.aux.clone();
    // The iterator may be lazy, so user code also runs while it is drained.
    let result = catch_unwind(AssertUnwindSafe(|| -> anyhow::Result<Vec<KeyValue>> {
        mapper(kv, aux)?.collect()
    }));
    match result {
        Ok(Ok(records)) => Ok(records),
        Ok(Err(err)) => Err(StageError::new(Stage::Map, err)),
        Err(payload) => Err(StageError::panicked(Stage::Map, payload)),
    }
}

/// Folds the records of one partition that share a key into a single record.
///
/// Without a combiner the records pass through untouched. Output keys come
/// out sorted; values keep their emission order within a key.
pub fn combine(
    combiner: Option<CombineFn>,
    records: Vec<KeyValue>,
    aux: &Bytes,
    partition: PartitionId,
) -> Result<Vec<KeyValue>, StageError> {
    let Some(combiner) = combiner else {
        return Ok(records);
    };

    let groups = records
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .into_group_map();

    let mut combined = Vec::with_capacity(groups.len());
    for (key, values) in groups.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        let aux = aux.clone();
        let group_key = key.clone();
        let folded = catch_unwind(AssertUnwindSafe(|| {
            combiner(group_key, Box::new(values.into_iter()), aux)
        }));
        let value = match folded {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                return Err(StageError::new(Stage::Combine, err)
                    .in_partition(partition)
                    .at_key(key))
            }
            Err(payload) => {
                return Err(StageError::panicked(Stage::Combine, payload)
                    .in_partition(partition)
                    .at_key(key))
            }
        };
        combined.push(KeyValue::new(key, value));
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::anyhow;
    use common::source::MemoryStore;
    use common::{JobSpecBuilder, MapOutput};

    use super::*;

    fn echo(kv: KeyValue, _aux: Bytes) -> MapOutput {
        Ok(Box::new(std::iter::once(Ok(kv))))
    }

    fn explode(kv: KeyValue, _aux: Bytes) -> MapOutput {
        if kv.key == Bytes::from_static(b"3") {
            return Err(anyhow!("bad record"));
        }
        Ok(Box::new(std::iter::once(Ok(kv))))
    }

    fn even(key: &Bytes, _aux: Bytes) -> bool {
        std::str::from_utf8(key)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map_or(false, |n| n % 2 == 0)
    }

    fn concat(_key: Bytes, values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> anyhow::Result<Bytes> {
        Ok(Bytes::from(values.flat_map(|v| v.to_vec()).collect::<Vec<u8>>()))
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::new(1);
        store.put_all("input", [("1", "v1"), ("2", "v2"), ("3", "v3"), ("4", "v4")]);
        store
    }

    fn spec(configure: impl FnOnce(&mut JobSpecBuilder)) -> JobSpec {
        let mut builder = JobSpecBuilder::new("input");
        configure(&mut builder);
        builder.build().unwrap()
    }

    fn keys(mapped: &MappedPartition) -> BTreeSet<Bytes> {
        mapped.records.iter().map(KeyValue::key).collect()
    }

    #[test]
    fn predicate_prunes_keys() {
        let spec = spec(|b| {
            b.set_mapper(echo).unwrap();
            b.set_predicate(even).unwrap();
        });

        let mapped = map_partition(&store(), JobId(1), &spec, PartitionId(0), 1, &CancellationToken::new()).unwrap();

        assert_eq!(mapped.mapped_keys, 2);
        assert_eq!(keys(&mapped), BTreeSet::from([Bytes::from("2"), Bytes::from("4")]));
    }

    #[test]
    fn explicit_keys_skip_missing_values() {
        let spec = spec(|b| {
            b.set_mapper(echo).unwrap();
            b.add_keys([Bytes::from("1"), Bytes::from("9")]);
        });

        let mapped = map_partition(&store(), JobId(1), &spec, PartitionId(0), 1, &CancellationToken::new()).unwrap();

        assert_eq!(mapped.mapped_keys, 1);
        assert_eq!(keys(&mapped), BTreeSet::from([Bytes::from("1")]));
    }

    #[test]
    fn mapper_error_names_the_key() {
        let spec = spec(|b| b.set_mapper(explode).unwrap());

        let err = map_partition(&store(), JobId(1), &spec, PartitionId(0), 1, &CancellationToken::new()).unwrap_err();

        match err {
            NodeError::Stage(stage) => {
                assert_eq!(stage.stage, Stage::Map);
                assert_eq!(stage.key, Some(Bytes::from("3")));
                assert_eq!(stage.partition, Some(PartitionId(0)));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn cancelled_token_stops_mapping() {
        let spec = spec(|b| b.set_mapper(echo).unwrap());
        let token = CancellationToken::new();
        token.cancel();

        let err = map_partition(&store(), JobId(5), &spec, PartitionId(0), 1, &token).unwrap_err();

        assert!(matches!(err, NodeError::Cancelled(JobId(5))));
    }

    #[test]
    fn combiner_folds_per_key() {
        let records = vec![
            KeyValue::new("b", "1"),
            KeyValue::new("a", "2"),
            KeyValue::new("b", "3"),
        ];

        let combined = combine(Some(concat), records, &Bytes::new(), PartitionId(0)).unwrap();

        assert_eq!(combined, vec![KeyValue::new("a", "2"), KeyValue::new("b", "13")]);
    }

    #[test]
    fn absent_combiner_passes_through() {
        let records = vec![KeyValue::new("b", "1"), KeyValue::new("b", "3")];
        let combined = combine(None, records.clone(), &Bytes::new(), PartitionId(0)).unwrap();
        assert_eq!(combined, records);
    }
}
