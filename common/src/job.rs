use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::{CombineFn, KeyPredicateFn, MapFn, ReduceFn};

/// Identifies a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Attempt number of a partition (or reduce) within a job, starting at 1.
pub type Attempt = u32;

/// A pipeline stage that runs user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Map,
    Combine,
    Shuffle,
    Reduce,
    Collate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Map => "map",
            Stage::Combine => "combine",
            Stage::Shuffle => "shuffle",
            Stage::Reduce => "reduce",
            Stage::Collate => "collate",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Configuring,
    Planning,
    Mapping,
    Shuffling,
    Reducing,
    Collating,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Restricts the keys a job reads.
///
/// Explicit keys and a predicate can be combined; the predicate then prunes
/// the explicit keys.
#[derive(Clone, Default)]
pub struct KeyFilter {
    pub keys: Option<BTreeSet<Bytes>>,
    pub predicate: Option<KeyPredicateFn>,
}

impl KeyFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_explicit(&self) -> bool {
        self.keys.is_some()
    }

    /// Whether an owned key passes the explicit key set. The predicate is
    /// evaluated separately, on the owning node, since it runs user code.
    pub fn admits_key(&self, key: &Bytes) -> bool {
        match &self.keys {
            Some(keys) => keys.contains(key),
            None => true,
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyFilter")
            .field("keys", &self.keys.as_ref().map(BTreeSet::len))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// An immutable job description, shipped to every node that takes part in
/// the job. The collator stays with the coordinator.
#[derive(Clone)]
pub struct JobSpec {
    pub source: String,
    pub filter: KeyFilter,
    pub mapper: MapFn,
    pub combiner: Option<CombineFn>,
    pub reducer: Option<ReduceFn>,
    pub aux: Bytes,
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("source", &self.source)
            .field("filter", &self.filter)
            .field("combiner", &self.combiner.is_some())
            .field("reducer", &self.reducer.is_some())
            .field("aux_len", &self.aux.len())
            .finish()
    }
}

/// Accumulates a [`JobSpec`]. Every function can be set only once.
#[derive(Default, Clone)]
pub struct JobSpecBuilder {
    source: Option<String>,
    keys: Option<BTreeSet<Bytes>>,
    predicate: Option<KeyPredicateFn>,
    mapper: Option<MapFn>,
    combiner: Option<CombineFn>,
    reducer: Option<ReduceFn>,
    aux: Bytes,
}

impl JobSpecBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// Adds explicit keys. Repeated calls extend the set.
    pub fn add_keys(&mut self, keys: impl IntoIterator<Item = Bytes>) {
        self.keys.get_or_insert_with(BTreeSet::new).extend(keys);
    }

    pub fn set_predicate(&mut self, predicate: KeyPredicateFn) -> Result<(), ConfigurationError> {
        if self.predicate.is_some() {
            return Err(ConfigurationError::KeyPredicateAlreadySet);
        }
        self.predicate = Some(predicate);
        Ok(())
    }

    pub fn set_mapper(&mut self, mapper: MapFn) -> Result<(), ConfigurationError> {
        if self.mapper.is_some() {
            return Err(ConfigurationError::MapperAlreadySet);
        }
        self.mapper = Some(mapper);
        Ok(())
    }

    pub fn set_combiner(&mut self, combiner: CombineFn) -> Result<(), ConfigurationError> {
        if self.combiner.is_some() {
            return Err(ConfigurationError::CombinerAlreadySet);
        }
        self.combiner = Some(combiner);
        Ok(())
    }

    pub fn set_reducer(&mut self, reducer: ReduceFn) -> Result<(), ConfigurationError> {
        if self.reducer.is_some() {
            return Err(ConfigurationError::ReducerAlreadySet);
        }
        self.reducer = Some(reducer);
        Ok(())
    }

    pub fn set_aux(&mut self, aux: impl Into<Bytes>) {
        self.aux = aux.into();
    }

    pub fn build(self) -> Result<JobSpec, ConfigurationError> {
        let source = match self.source {
            Some(source) if !source.is_empty() => source,
            _ => return Err(ConfigurationError::MissingSource),
        };
        let mapper = self.mapper.ok_or(ConfigurationError::MissingMapper)?;

        Ok(JobSpec {
            source,
            filter: KeyFilter {
                keys: self.keys,
                predicate: self.predicate,
            },
            mapper,
            combiner: self.combiner,
            reducer: self.reducer,
            aux: self.aux,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyValue, MapOutput};

    fn echo(kv: KeyValue, _aux: Bytes) -> MapOutput {
        Ok(Box::new(std::iter::once(Ok(kv))))
    }

    fn first(_key: Bytes, mut values: Box<dyn Iterator<Item = Bytes> + '_>, _aux: Bytes) -> anyhow::Result<Bytes> {
        Ok(values.next().unwrap_or_default())
    }

    fn never(_key: &Bytes, _aux: Bytes) -> bool {
        false
    }

    #[test]
    fn second_mapper_is_rejected() {
        let mut builder = JobSpecBuilder::new("input");
        builder.set_mapper(echo).unwrap();
        assert_eq!(builder.set_mapper(echo), Err(ConfigurationError::MapperAlreadySet));
    }

    #[test]
    fn one_shot_setters() {
        let mut builder = JobSpecBuilder::new("input");
        builder.set_combiner(first).unwrap();
        builder.set_reducer(first).unwrap();
        builder.set_predicate(never).unwrap();
        assert_eq!(builder.set_combiner(first), Err(ConfigurationError::CombinerAlreadySet));
        assert_eq!(builder.set_reducer(first), Err(ConfigurationError::ReducerAlreadySet));
        assert_eq!(builder.set_predicate(never), Err(ConfigurationError::KeyPredicateAlreadySet));
    }

    #[test]
    fn build_requires_mapper_and_source() {
        assert_eq!(
            JobSpecBuilder::new("input").build().unwrap_err(),
            ConfigurationError::MissingMapper
        );

        let mut builder = JobSpecBuilder::default();
        builder.set_mapper(echo).unwrap();
        assert_eq!(builder.build().unwrap_err(), ConfigurationError::MissingSource);
    }

    #[test]
    fn keys_accumulate() {
        let mut builder = JobSpecBuilder::new("input");
        builder.add_keys([Bytes::from_static(b"a")]);
        builder.add_keys([Bytes::from_static(b"b"), Bytes::from_static(b"a")]);
        builder.set_mapper(echo).unwrap();
        let spec = builder.build().unwrap();

        assert!(spec.filter.is_explicit());
        assert!(spec.filter.admits_key(&Bytes::from_static(b"b")));
        assert!(!spec.filter.admits_key(&Bytes::from_static(b"c")));
        assert_eq!(spec.filter.keys.map(|k| k.len()), Some(2));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Collating.is_terminal());
        assert_eq!(Stage::Combine.to_string(), "combine");
        assert_eq!(JobId(7).to_string(), "job-7");
    }
}
