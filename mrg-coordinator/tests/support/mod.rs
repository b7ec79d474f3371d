#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;

use common::EngineConfig;
use mrg_coordinator::LocalCluster;

/// Default config with short backoffs so that retry paths run quickly.
pub fn fast_config(partitions: u32) -> EngineConfig {
    EngineConfig {
        partition_count: partitions,
        planning_backoff_ms: 10,
        retry_backoff_base_ms: 5,
        shuffle_backoff_base_ms: 2,
        ..EngineConfig::default()
    }
}

pub fn cluster(nodes: u32, partitions: u32) -> LocalCluster {
    LocalCluster::start(nodes, fast_config(partitions)).unwrap()
}

pub fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub fn grouped_text(grouped: &BTreeMap<Bytes, Vec<Bytes>>) -> BTreeMap<String, Vec<String>> {
    grouped
        .iter()
        .map(|(key, values)| (text(key), values.iter().map(text).collect()))
        .collect()
}

pub fn reduced_text(reduced: &BTreeMap<Bytes, Bytes>) -> BTreeMap<String, String> {
    reduced
        .iter()
        .map(|(key, value)| (text(key), text(value)))
        .collect()
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
