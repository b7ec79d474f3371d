//! Error taxonomy of the grid.
//!
//! Classification guidance:
//! - [`ConfigurationError`]: misuse of the job builder, reported synchronously
//! - [`TransportError`]: a message could not be delivered to a node
//! - [`StageError`]: user code (mapper, combiner, reducer, collator) failed
//! - [`NodeError`]: a node refused or failed a request
//! - [`JobFailure`]: terminal cause a job's future resolves with
//! - [`JobError`]: what a caller observes when a job does not complete

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::cluster::{NodeId, PartitionId};
use crate::job::{JobId, Stage};
use crate::utils::panic_message;

/// A job was configured incorrectly. Never reported through the job's future.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("mapper is already set; it can only be configured once")]
    MapperAlreadySet,

    #[error("combiner is already set; it can only be configured once")]
    CombinerAlreadySet,

    #[error("reducer is already set; it can only be configured once")]
    ReducerAlreadySet,

    #[error("key predicate is already set; it can only be configured once")]
    KeyPredicateAlreadySet,

    #[error("a job cannot be submitted without a mapper")]
    MissingMapper,

    #[error("a job must name a data source")]
    MissingSource,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Delivery to a node failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{0} is unreachable")]
    Unreachable(NodeId),

    #[error("{node} dropped the request: {reason}")]
    Dropped { node: NodeId, reason: String },
}

/// User code failed while running one of the pipeline stages.
#[derive(Debug, Clone)]
pub struct StageError {
    pub stage: Stage,
    pub partition: Option<PartitionId>,
    pub key: Option<Bytes>,
    pub cause: Arc<anyhow::Error>,
}

impl StageError {
    pub fn new(stage: Stage, cause: anyhow::Error) -> Self {
        Self {
            stage,
            partition: None,
            key: None,
            cause: Arc::new(cause),
        }
    }

    /// Wraps the payload of a panic raised by user code.
    pub fn panicked(stage: Stage, payload: Box<dyn Any + Send>) -> Self {
        Self::new(
            stage,
            anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
        )
    }

    pub fn in_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn at_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed", self.stage)?;
        if let Some(partition) = self.partition {
            write!(f, " in {}", partition)?;
        }
        if let Some(key) = &self.key {
            write!(f, " on key `{}`", String::from_utf8_lossy(key))?;
        }
        write!(f, ": {:#}", self.cause)
    }
}

impl std::error::Error for StageError {}

/// A keyed source could not serve a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("unknown data source `{0}`")]
    UnknownSource(String),

    #[error("{node} does not own {partition}")]
    NotOwner { node: NodeId, partition: PartitionId },
}

/// A node refused or failed a request.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    #[error("{node} does not own {partition}")]
    NotOwner { node: NodeId, partition: PartitionId },

    #[error("unknown data source `{0}`")]
    UnknownSource(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("shuffle delivery failed: {0}")]
    Shuffle(#[source] TransportError),

    #[error("{0} was cancelled on this node")]
    Cancelled(JobId),

    #[error("{node} is missing shuffle batches from {partition}: expected {expected}, received {received}")]
    IncompleteShuffle {
        node: NodeId,
        partition: PartitionId,
        expected: u32,
        received: u32,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<SourceError> for NodeError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::UnknownSource(name) => NodeError::UnknownSource(name),
            SourceError::NotOwner { node, partition } => NodeError::NotOwner { node, partition },
        }
    }
}

/// Result of sending a message: either it never arrived, or the node
/// answered with an error.
#[derive(Debug, Error, Clone)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] NodeError),
}

/// Terminal cause of a failed job. Carries the first unrecoverable error.
#[derive(Debug, Error, Clone)]
pub enum JobFailure {
    #[error("{partition} has no resolvable owner after {attempts} planning attempts")]
    PartitionUnavailable { partition: PartitionId, attempts: u32 },

    #[error(transparent)]
    StageExecution(#[from] StageError),

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("{node} is missing shuffle batches from {partition}")]
    IncompleteShuffle { node: NodeId, partition: PartitionId },

    #[error("unknown data source `{0}`")]
    UnknownSource(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<NodeError> for JobFailure {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::NotOwner { partition, .. } => JobFailure::PartitionUnavailable {
                partition,
                attempts: 1,
            },
            NodeError::UnknownSource(name) => JobFailure::UnknownSource(name),
            NodeError::Stage(stage) => JobFailure::StageExecution(stage),
            NodeError::Shuffle(transport) => JobFailure::Transport(transport),
            NodeError::IncompleteShuffle {
                node, partition, ..
            } => JobFailure::IncompleteShuffle { node, partition },
            NodeError::Cancelled(job) => {
                JobFailure::Protocol(format!("{} was released on a node while running", job))
            }
            NodeError::Protocol(message) => JobFailure::Protocol(message),
        }
    }
}

impl From<DeliveryError> for JobFailure {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Transport(transport) => JobFailure::Transport(transport),
            DeliveryError::Remote(node) => node.into(),
        }
    }
}

/// Why a job did not produce a value.
#[derive(Debug, Error, Clone)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(#[from] JobFailure),

    #[error("job was cancelled")]
    Cancelled,
}

impl JobError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobError::Failed(failure) => Some(failure),
            JobError::Cancelled => None,
        }
    }
}
