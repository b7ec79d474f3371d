//! Key predicates over decimal keys. Keys that are not integers are rejected.

use bytes::Bytes;

fn parse(key: &Bytes) -> Option<i64> {
    std::str::from_utf8(key).ok()?.trim().parse().ok()
}

pub fn even_keys(key: &Bytes, _aux: Bytes) -> bool {
    parse(key).map_or(false, |n| n % 2 == 0)
}

pub fn odd_keys(key: &Bytes, _aux: Bytes) -> bool {
    parse(key).map_or(false, |n| n % 2 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity() {
        let evens: Vec<&str> = ["1", "2", "3", "4", "x"]
            .into_iter()
            .filter(|k| even_keys(&Bytes::from(*k), Bytes::new()))
            .collect();
        assert_eq!(evens, vec!["2", "4"]);
        assert!(odd_keys(&Bytes::from("-3"), Bytes::new()));
        assert!(!odd_keys(&Bytes::from("x"), Bytes::new()));
    }
}
