//! Typed configuration steps: [`Job`] → [`MappingJob`] → [`ReducingJob`].
//!
//! A job cannot be submitted before it has a mapper, and a reducer can only be
//! chosen after the mapper. Each step hands its accumulated [`JobSpecBuilder`]
//! to the next one, so a submitted job is an immutable [`JobSpec`].

use std::collections::BTreeMap;

use anyhow::anyhow;
use bytes::Bytes;

use common::error::ConfigurationError;
use common::message::JobResult;
use common::{CombineFn, JobSpec, JobSpecBuilder, KeyPredicateFn, MapFn, ReduceFn};

use crate::cluster::Engine;
use crate::coordinator::Collation;
use crate::handle::JobHandle;

/// Map output grouped by key, as delivered by a job without a reducer.
pub type Grouped = BTreeMap<Bytes, Vec<Bytes>>;

/// One reduced value per key.
pub type Reduced = BTreeMap<Bytes, Bytes>;

/// A job that names its data source but has no mapper yet.
pub struct Job {
    engine: Engine,
    builder: JobSpecBuilder,
}

impl Job {
    pub(crate) fn new(engine: Engine, source: impl Into<String>) -> Self {
        Self {
            engine,
            builder: JobSpecBuilder::new(source),
        }
    }

    /// Restricts the job to these keys. Only the partitions holding them are
    /// visited.
    pub fn on_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        self.builder.add_keys(keys.into_iter().map(Into::into));
        self
    }

    /// Admits only keys the predicate accepts. Evaluated on the owning node.
    pub fn key_predicate(mut self, predicate: KeyPredicateFn) -> Result<Self, ConfigurationError> {
        self.builder.set_predicate(predicate)?;
        Ok(self)
    }

    /// Opaque arguments handed to every user function.
    pub fn aux(mut self, aux: impl Into<Bytes>) -> Self {
        self.builder.set_aux(aux);
        self
    }

    pub fn mapper(self, mapper: MapFn) -> MappingJob {
        MappingJob {
            engine: self.engine,
            builder: self.builder,
            mapper,
        }
    }
}

/// A job with a mapper. Submitting it yields the grouped map output.
pub struct MappingJob {
    engine: Engine,
    builder: JobSpecBuilder,
    mapper: MapFn,
}

impl MappingJob {
    pub fn combiner(mut self, combiner: CombineFn) -> Result<Self, ConfigurationError> {
        self.builder.set_combiner(combiner)?;
        Ok(self)
    }

    pub fn reducer(self, reducer: ReduceFn) -> ReducingJob {
        ReducingJob {
            engine: self.engine,
            builder: self.builder,
            mapper: self.mapper,
            reducer,
        }
    }

    pub fn submit(self) -> Result<JobHandle<Grouped>, ConfigurationError> {
        let engine = self.engine.clone();
        let spec = self.into_spec()?;
        Ok(engine.launch(spec, Collation::conversion(grouped)))
    }

    /// Submits the job and resolves its handle with the collator's value.
    pub fn submit_with<T, F>(self, collator: F) -> Result<JobHandle<T>, ConfigurationError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Grouped) -> anyhow::Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        let spec = self.into_spec()?;
        Ok(engine.launch(
            spec,
            Collation::collator(move |result| collator(grouped(result)?)),
        ))
    }

    fn into_spec(mut self) -> Result<JobSpec, ConfigurationError> {
        self.builder.set_mapper(self.mapper)?;
        self.builder.build()
    }
}

/// A job with a mapper and a reducer. Submitting it yields one value per key.
pub struct ReducingJob {
    engine: Engine,
    builder: JobSpecBuilder,
    mapper: MapFn,
    reducer: ReduceFn,
}

impl ReducingJob {
    pub fn submit(self) -> Result<JobHandle<Reduced>, ConfigurationError> {
        let engine = self.engine.clone();
        let spec = self.into_spec()?;
        Ok(engine.launch(spec, Collation::conversion(reduced)))
    }

    pub fn submit_with<T, F>(self, collator: F) -> Result<JobHandle<T>, ConfigurationError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Reduced) -> anyhow::Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        let spec = self.into_spec()?;
        Ok(engine.launch(
            spec,
            Collation::collator(move |result| collator(reduced(result)?)),
        ))
    }

    fn into_spec(mut self) -> Result<JobSpec, ConfigurationError> {
        self.builder.set_mapper(self.mapper)?;
        self.builder.set_reducer(self.reducer)?;
        self.builder.build()
    }
}

fn grouped(result: JobResult) -> anyhow::Result<Grouped> {
    result
        .into_grouped()
        .ok_or_else(|| anyhow!("expected grouped map output, got reduced values"))
}

fn reduced(result: JobResult) -> anyhow::Result<Reduced> {
    result
        .into_reduced()
        .ok_or_else(|| anyhow!("expected reduced values, got grouped map output"))
}
