//! Sample applications for the grid, addressable by name.

use anyhow::{anyhow, Result};
use bytes::Bytes;

use common::utils::string_from_bytes;
use common::{KeyPredicateFn, Workload};

pub mod identity;
pub mod predicates;
pub mod sum;
pub mod vertex_degree;
pub mod word_count;

/// Every workload [`try_named`] knows about.
pub const WORKLOADS: [&str; 4] = ["identity", "sum", "word-count", "vertex-degree"];

/// Every predicate [`predicate_named`] knows about.
pub const PREDICATES: [&str; 2] = ["even-keys", "odd-keys"];

pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "identity" => Some(Workload {
            map_fn: identity::map,
            combine_fn: None,
            reduce_fn: None,
        }),
        "sum" => Some(Workload {
            map_fn: sum::map,
            combine_fn: Some(sum::reduce),
            reduce_fn: Some(sum::reduce),
        }),
        "word-count" => Some(Workload {
            map_fn: word_count::map,
            combine_fn: Some(word_count::reduce),
            reduce_fn: Some(word_count::reduce),
        }),
        "vertex-degree" => Some(Workload {
            map_fn: vertex_degree::map,
            combine_fn: Some(vertex_degree::combine),
            reduce_fn: Some(vertex_degree::reduce),
        }),
        _ => None,
    }
}

pub fn predicate_named(name: &str) -> Option<KeyPredicateFn> {
    match name {
        "even-keys" => Some(predicates::even_keys),
        "odd-keys" => Some(predicates::odd_keys),
        _ => None,
    }
}

/// Sums values that are decimal integers.
pub fn sum_values(values: Box<dyn Iterator<Item = Bytes> + '_>) -> Result<i64> {
    let mut total = 0i64;
    for value in values {
        let text = string_from_bytes(value)?;
        let n: i64 = text
            .trim()
            .parse()
            .map_err(|err| anyhow!("`{}` is not an integer: {}", text, err))?;
        total = total
            .checked_add(n)
            .ok_or_else(|| anyhow!("sum overflowed"))?;
    }
    Ok(total)
}
