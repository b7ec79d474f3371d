use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use common::EngineConfig;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON engine config. Flags below override its fields.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of in-process nodes.
    #[arg(short, long, default_value = "3")]
    pub nodes: u32,

    /// Number of partitions the key space is split into.
    #[arg(long)]
    pub partitions: Option<u32>,

    /// Job timeout in milliseconds. 0 disables it.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Attempts per partition before the job fails.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the workloads and key predicates that can be submitted.
    Workloads,
    /// Run a workload over a file of `key value` lines and print the result.
    Submit {
        /// Input file, one `key value` pair per line
        #[arg(short, long)]
        input: PathBuf,

        /// Name of the workload
        #[arg(short, long)]
        workload: String,

        /// Only visit these keys (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        keys: Vec<String>,

        /// Name of a key predicate
        #[arg(short, long)]
        predicate: Option<String>,

        /// Print the number of distinct output keys instead of the output
        #[arg(long)]
        count_keys: bool,

        /// Auxiliary arguments to pass to the MapReduce application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
}

impl Args {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(partitions) = self.partitions {
            config.partition_count = partitions;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.job_timeout_ms = timeout_ms;
        }
        if let Some(attempts) = self.max_attempts {
            config.max_partition_attempts = attempts;
        }
        config.validate()?;
        Ok(config)
    }
}
