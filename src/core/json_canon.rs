//! Canonical JSON encoder.
//!
//! One deterministic byte form serves the wire envelope, the HMAC
//! input, and the persistence layout, so round-trips are byte-identical
//! and every peer hashes the same bytes.
//!
//! Canonical rules:
//! - object keys sorted by UTF-8 byte order, recursively
//! - no insignificant whitespace

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonJsonError {
    #[error("json encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("json decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Serialize a value to canonical JSON bytes.
pub fn to_canon_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonJsonError> {
    let value = serde_json::to_value(value).map_err(CanonJsonError::Encode)?;
    let canon = canon_value(value);
    serde_json::to_vec(&canon).map_err(CanonJsonError::Encode)
}

/// Deserialize a value previously produced by [`to_canon_json_bytes`].
pub fn from_canon_json_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CanonJsonError> {
    serde_json::from_slice(bytes).map_err(CanonJsonError::Decode)
}

fn canon_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            let mut canon = Map::new();
            for (key, val) in entries {
                canon.insert(key, canon_value(val));
            }
            Value::Object(canon)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canon_value).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn keys_are_sorted_recursively() {
        let mut inner = HashMap::new();
        inner.insert("zeta", 1);
        inner.insert("alpha", 2);
        let mut outer = HashMap::new();
        outer.insert("b", inner.clone());
        outer.insert("a", inner);

        let bytes = to_canon_json_bytes(&outer).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"a":{"alpha":2,"zeta":1},"b":{"alpha":2,"zeta":1}}"#);
    }

    #[test]
    fn encoding_is_stable_across_insertion_order() {
        let mut one = HashMap::new();
        one.insert("x", 1);
        one.insert("y", 2);
        let mut two = HashMap::new();
        two.insert("y", 2);
        two.insert("x", 1);
        assert_eq!(
            to_canon_json_bytes(&one).unwrap(),
            to_canon_json_bytes(&two).unwrap()
        );
    }

    #[test]
    fn round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Probe {
            name: String,
            n: u64,
        }
        let probe = Probe {
            name: "r1".into(),
            n: 42,
        };
        let bytes = to_canon_json_bytes(&probe).unwrap();
        let back: Probe = from_canon_json_bytes(&bytes).unwrap();
        assert_eq!(back, probe);
    }
}
