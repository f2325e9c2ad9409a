//! Serde adapter encoding maps as ordered pair lists.
//!
//! JSON objects only take string keys; CRDT internals key maps by
//! stamps, positions and whole profiles. Encoding them as `[key,
//! value]` pairs keeps the canonical byte form deterministic (BTreeMap
//! iteration order) and round-trippable.
//!
//! Use as `#[serde(with = "crate::crdt::pairs")]`.

use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::Serializer;
use serde::Serialize;

pub fn serialize<K, V, S>(map: &BTreeMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    K: Serialize,
    V: Serialize,
    S: Serializer,
{
    serializer.collect_seq(map.iter())
}

pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<BTreeMap<K, V>, D::Error>
where
    K: Deserialize<'de> + Ord,
    V: Deserialize<'de>,
    D: Deserializer<'de>,
{
    let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
    Ok(pairs.into_iter().collect())
}
