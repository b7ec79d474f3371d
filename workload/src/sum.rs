//! Adds up every input value under the single key `all`.

use anyhow::Result;
use bytes::Bytes;

use common::{KeyValue, MapOutput};

use crate::sum_values;

pub const TOTAL_KEY: &str = "all";

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    Ok(Box::new(std::iter::once(Ok(KeyValue::new(
        TOTAL_KEY,
        kv.into_value(),
    )))))
}

/// Used both as combiner and as reducer: partial sums add up.
pub fn reduce(
    _key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    Ok(Bytes::from(sum_values(values)?.to_string()))
}
