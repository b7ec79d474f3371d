use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Engine behavior knobs shared by the coordinator and the nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of partitions the key space is split into.
    pub partition_count: u32,
    /// Attempts a partition's map-through-shuffle (or a node's reduce) gets
    /// before the job fails.
    pub max_partition_attempts: u32,
    /// Planning rounds spent waiting for partitions without an owner.
    pub max_planning_attempts: u32,
    pub planning_backoff_ms: u64,
    /// Base delay between partition attempts; doubles on every retry.
    pub retry_backoff_base_ms: u64,
    /// Redeliveries of a single shuffle batch before the partition attempt
    /// is abandoned.
    pub shuffle_max_retries: u32,
    pub shuffle_backoff_base_ms: u64,
    /// Records per shuffle batch.
    pub shuffle_batch_size: usize,
    /// Job-level timeout in milliseconds. `0` disables it.
    pub job_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_count: 271,
            max_partition_attempts: 3,
            max_planning_attempts: 5,
            planning_backoff_ms: 25,
            retry_backoff_base_ms: 25,
            shuffle_max_retries: 3,
            shuffle_backoff_base_ms: 10,
            shuffle_batch_size: 512,
            job_timeout_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.partition_count == 0 {
            return Err(ConfigurationError::Invalid(
                "partition_count must be positive".to_string(),
            ));
        }
        if self.max_partition_attempts == 0 || self.max_planning_attempts == 0 {
            return Err(ConfigurationError::Invalid(
                "attempt budgets must be at least 1".to_string(),
            ));
        }
        if self.shuffle_batch_size == 0 {
            return Err(ConfigurationError::Invalid(
                "shuffle_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        (self.job_timeout_ms > 0).then(|| Duration::from_millis(self.job_timeout_ms))
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        exponential(self.retry_backoff_base_ms, attempt.saturating_sub(1))
    }

    pub fn planning_backoff(&self, round: u32) -> Duration {
        exponential(self.planning_backoff_ms, round.saturating_sub(1))
    }

    /// Delay before redelivering a shuffle batch for the `retry`-th time
    /// (0-based), without jitter.
    pub fn shuffle_backoff(&self, retry: u32) -> Duration {
        exponential(self.shuffle_backoff_base_ms, retry)
    }
}

fn exponential(base_ms: u64, exponent: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1_u64 << exponent.min(10)))
}
