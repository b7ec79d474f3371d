//! Counts words across every value. The aux argument may carry a JSON array
//! of words to skip.

use std::collections::HashSet;

use anyhow::{Context, Result};
use bytes::Bytes;

use common::utils::string_from_bytes;
use common::{KeyValue, MapOutput};

use crate::sum_values;

fn stopwords(aux: &Bytes) -> Result<HashSet<String>> {
    if aux.is_empty() {
        return Ok(HashSet::new());
    }
    let words: Vec<String> =
        serde_json::from_slice(aux).context("word-count aux must be a JSON array of words")?;
    Ok(words.into_iter().map(|w| w.to_lowercase()).collect())
}

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let skip = stopwords(&aux)?;
    let text = string_from_bytes(kv.value)?;
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !skip.contains(word))
        .collect();
    Ok(Box::new(
        words
            .into_iter()
            .map(|word| Ok(KeyValue::new(word, "1"))),
    ))
}

pub fn reduce(
    _key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    Ok(Bytes::from(sum_values(values)?.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(value: &'static str, aux: &'static str) -> Vec<String> {
        map(KeyValue::new("doc", value), Bytes::from(aux))
            .unwrap()
            .map(|kv| String::from_utf8(kv.unwrap().key.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn splits_and_lowercases() {
        assert_eq!(words("The cat, the hat.", ""), vec!["the", "cat", "the", "hat"]);
    }

    #[test]
    fn skips_stopwords() {
        assert_eq!(words("The cat, the hat.", r#"["THE"]"#), vec!["cat", "hat"]);
    }

    #[test]
    fn malformed_aux_fails_the_map() {
        assert!(map(KeyValue::new("doc", "a b"), Bytes::from("the")).is_err());
    }
}
