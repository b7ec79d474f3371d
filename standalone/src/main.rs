use std::collections::BTreeMap;
use std::fs;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use itertools::Itertools;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::EngineConfig;
use mrg_coordinator::LocalCluster;

mod args;
use args::{Args, Commands};

/// Source the input file is loaded into.
const INPUT_SOURCE: &str = "input";

/// Splits `key value` lines. The value is everything after the first run of
/// whitespace; blank lines are skipped.
fn parse_input(contents: &str) -> Result<Vec<(String, String)>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            let line = line.trim();
            let (key, value) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("line {} has no value: `{}`", index + 1, line))?;
            Ok((key.to_string(), value.trim_start().to_string()))
        })
        .collect()
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

struct Submission {
    input: String,
    workload: String,
    keys: Vec<String>,
    predicate: Option<String>,
    count_keys: bool,
    aux: Vec<String>,
}

async fn submit(nodes: u32, config: EngineConfig, submission: Submission) -> Result<()> {
    let app = workload::try_named(&submission.workload).ok_or_else(|| {
        anyhow!(
            "unknown workload `{}`, expected one of: {}",
            submission.workload,
            workload::WORKLOADS.iter().join(", ")
        )
    })?;

    let contents = fs::read_to_string(&submission.input)
        .with_context(|| format!("failed to read {}", submission.input))?;
    let entries = parse_input(&contents)?;

    let cluster = LocalCluster::start(nodes, config)?;
    cluster.store().put_all(INPUT_SOURCE, entries);
    info!(
        "loaded {} entries from {}",
        cluster.store().len(INPUT_SOURCE),
        submission.input
    );

    let mut job = cluster
        .engine()
        .job(INPUT_SOURCE)
        .aux(serde_json::to_string(&submission.aux)?);
    if !submission.keys.is_empty() {
        job = job.on_keys(submission.keys);
    }
    if let Some(name) = &submission.predicate {
        let predicate = workload::predicate_named(name).ok_or_else(|| {
            anyhow!(
                "unknown predicate `{}`, expected one of: {}",
                name,
                workload::PREDICATES.iter().join(", ")
            )
        })?;
        job = job.key_predicate(predicate)?;
    }

    let mut mapping = job.mapper(app.map_fn);
    if let Some(combiner) = app.combine_fn {
        mapping = mapping.combiner(combiner)?;
    }

    let output = match (app.reduce_fn, submission.count_keys) {
        (Some(reducer), true) => {
            let count = mapping
                .reducer(reducer)
                .submit_with(|reduced| Ok(reduced.len()))?
                .get()
                .await?;
            serde_json::to_string_pretty(&count)?
        }
        (Some(reducer), false) => {
            let reduced = mapping.reducer(reducer).submit()?.get().await?;
            let printable: BTreeMap<String, String> = reduced
                .iter()
                .map(|(key, value)| (text(key), text(value)))
                .collect();
            serde_json::to_string_pretty(&printable)?
        }
        (None, true) => {
            let count = mapping
                .submit_with(|grouped| Ok(grouped.len()))?
                .get()
                .await?;
            serde_json::to_string_pretty(&count)?
        }
        (None, false) => {
            let grouped = mapping.submit()?.get().await?;
            let printable: BTreeMap<String, Vec<String>> = grouped
                .iter()
                .map(|(key, values)| (text(key), values.iter().map(text).collect()))
                .collect();
            serde_json::to_string_pretty(&printable)?
        }
    };
    println!("{}", output);

    for job in cluster.engine().jobs() {
        info!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = args.engine_config()?;

    match args.command {
        Commands::Submit {
            input,
            workload,
            keys,
            predicate,
            count_keys,
            args: aux,
        } => {
            let submission = Submission {
                input: input.display().to_string(),
                workload,
                keys,
                predicate,
                count_keys,
                aux,
            };
            submit(args.nodes, config, submission).await?
        }
        Commands::Workloads => {
            println!("[Workloads]");
            for name in workload::WORKLOADS {
                println!("{}", name);
            }
            println!();
            println!("[Predicates]");
            for name in workload::PREDICATES {
                println!("{}", name);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let entries = parse_input("1 10\n\n2   20 30\n").unwrap();
        assert_eq!(
            entries,
            vec![
                ("1".to_string(), "10".to_string()),
                ("2".to_string(), "20 30".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_lines_without_values() {
        let err = parse_input("1 10\nlonely\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
