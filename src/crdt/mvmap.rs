//! Multi-value map.
//!
//! Values are sets of (value, stamp) siblings. A write supersedes the
//! siblings it observed at the origin; writes that never saw each other
//! both survive and surface to readers until a later write covers them.
//! Logical group membership uses this to keep conflicting assignments
//! visible instead of silently dropping one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, pairs};

/// One operation against an [`MvMap`].
///
/// `supersedes`/`observed` carry the sibling stamps the writer saw, so
/// replicas retire exactly those and nothing concurrent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MvOp<K, V> {
    Write {
        key: K,
        value: V,
        supersedes: Vec<Stamp>,
    },
    Remove {
        key: K,
        observed: Vec<Stamp>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Sibling<V> {
    value: V,
    supersedes: Vec<Stamp>,
}

/// Stamp-keyed map encoded as pairs, since stamps are not JSON object
/// keys.
#[derive(Clone, Debug, PartialEq, Eq)]
struct StampKeyed<V>(BTreeMap<Stamp, V>);

impl<V> Default for StampKeyed<V> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<V: Serialize> Serialize for StampKeyed<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        pairs::serialize(&self.0, serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for StampKeyed<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        pairs::deserialize(deserializer).map(StampKeyed)
    }
}

/// Map whose values surface concurrent siblings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Ord + Serialize, V: Serialize",
    deserialize = "K: Ord + Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct MvMap<K: Ord, V> {
    #[serde(with = "crate::crdt::pairs")]
    siblings: BTreeMap<K, StampKeyed<Sibling<V>>>,
    #[serde(with = "crate::crdt::pairs")]
    retired: BTreeMap<K, BTreeSet<Stamp>>,
    #[serde(with = "crate::crdt::pairs")]
    removes: BTreeMap<K, StampKeyed<Vec<Stamp>>>,
}

impl<K: Ord + Clone, V: Clone> MvMap<K, V> {
    pub fn new() -> Self {
        Self {
            siblings: BTreeMap::new(),
            retired: BTreeMap::new(),
            removes: BTreeMap::new(),
        }
    }

    /// Build the write op for a local mutation: it supersedes every
    /// sibling currently visible for the key.
    pub fn write_op(&self, key: K, value: V) -> MvOp<K, V> {
        let supersedes = self.sibling_stamps(&key);
        MvOp::Write {
            key,
            value,
            supersedes,
        }
    }

    /// Build the remove op for a local mutation over observed siblings.
    pub fn remove_op(&self, key: K) -> MvOp<K, V> {
        let observed = self.sibling_stamps(&key);
        MvOp::Remove { key, observed }
    }

    fn sibling_stamps(&self, key: &K) -> Vec<Stamp> {
        self.get(key).map(|(stamp, _)| stamp.clone()).collect()
    }

    pub fn apply(&mut self, op: MvOp<K, V>, stamp: Stamp) {
        match op {
            MvOp::Write {
                key,
                value,
                supersedes,
            } => {
                let retired = self.retired.entry(key.clone()).or_default();
                retired.extend(supersedes.iter().cloned());
                if !retired.contains(&stamp) {
                    self.siblings
                        .entry(key)
                        .or_default()
                        .0
                        .insert(stamp, Sibling { value, supersedes });
                }
            }
            MvOp::Remove { key, observed } => {
                let retired = self.retired.entry(key.clone()).or_default();
                retired.extend(observed.iter().cloned());
                self.removes
                    .entry(key.clone())
                    .or_default()
                    .0
                    .insert(stamp, observed);
                self.prune_key(&key);
            }
        }
    }

    fn prune_key(&mut self, key: &K) {
        let Some(retired) = self.retired.get(key) else {
            return;
        };
        if let Some(sibs) = self.siblings.get_mut(key) {
            sibs.0.retain(|stamp, _| !retired.contains(stamp));
            if sibs.0.is_empty() {
                self.siblings.remove(key);
            }
        }
    }

    /// Live siblings for a key in stamp order. One element means no
    /// conflict; several mean concurrent writers that nothing has
    /// superseded yet.
    pub fn get(&self, key: &K) -> impl Iterator<Item = (&Stamp, &V)> {
        let retired = self.retired.get(key);
        self.siblings
            .get(key)
            .into_iter()
            .flat_map(|sibs| sibs.0.iter())
            .filter(move |(stamp, _)| !retired.is_some_and(|r| r.contains(*stamp)))
            .map(|(stamp, sib)| (stamp, &sib.value))
    }

    /// Deterministic display winner among siblings: greatest stamp.
    pub fn resolve(&self, key: &K) -> Option<&V> {
        self.get(key).last().map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).next().is_some()
    }

    /// Keys with at least one live sibling.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.siblings
            .keys()
            .filter(move |key| self.contains_key(*key))
    }

    /// All operations stamped after `since`. Writes replay with their
    /// original supersedes list, so retirement reconstructs on replay.
    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, MvOp<K, V>)> {
        let mut ops = Vec::new();
        for (key, sibs) in &self.siblings {
            for (stamp, sib) in &sibs.0 {
                if stamp.at > *since {
                    ops.push((
                        stamp.clone(),
                        MvOp::Write {
                            key: key.clone(),
                            value: sib.value.clone(),
                            supersedes: sib.supersedes.clone(),
                        },
                    ));
                }
            }
        }
        for (key, removals) in &self.removes {
            for (stamp, observed) in &removals.0 {
                if stamp.at > *since {
                    ops.push((
                        stamp.clone(),
                        MvOp::Remove {
                            key: key.clone(),
                            observed: observed.clone(),
                        },
                    ));
                }
            }
        }
        ops
    }
}

impl<K: Ord + Clone, V: Clone> Default for MvMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> Crdt for MvMap<K, V> {
    fn merge(&mut self, other: &Self) {
        for (key, retired) in &other.retired {
            self.retired
                .entry(key.clone())
                .or_default()
                .extend(retired.iter().cloned());
        }
        for (key, removals) in &other.removes {
            let local = self.removes.entry(key.clone()).or_default();
            for (stamp, observed) in &removals.0 {
                local.0.entry(stamp.clone()).or_insert(observed.clone());
            }
        }
        for (key, sibs) in &other.siblings {
            let local = self.siblings.entry(key.clone()).or_default();
            for (stamp, sib) in &sibs.0 {
                local.0.entry(stamp.clone()).or_insert(sib.clone());
            }
        }
        let keys: Vec<K> = self.siblings.keys().cloned().collect();
        for key in keys {
            self.prune_key(&key);
        }
    }

    fn high_water(&self) -> WriteStamp {
        let writes = self
            .siblings
            .values()
            .flat_map(|sibs| sibs.0.keys())
            .map(|stamp| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        let removals = self
            .removes
            .values()
            .flat_map(|r| r.0.keys())
            .map(|stamp| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        writes.max(removals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::PeerId;

    fn stamp(wall: u64, peer: &str) -> Stamp {
        Stamp::new(WriteStamp::new(wall, 0), PeerId::new(peer).unwrap())
    }

    #[test]
    fn sequential_writes_supersede() {
        let mut map = MvMap::new();
        let op = map.write_op("slot", "a");
        map.apply(op, stamp(1, "p1"));
        let op = map.write_op("slot", "b");
        map.apply(op, stamp(2, "p1"));

        let live: Vec<_> = map.get(&"slot").map(|(_, v)| *v).collect();
        assert_eq!(live, vec!["b"]);
    }

    #[test]
    fn concurrent_writes_surface_as_siblings() {
        let base: MvMap<&str, &str> = MvMap::new();

        let mut a = base.clone();
        let op = a.write_op("slot", "from-a");
        a.apply(op, stamp(5, "p1"));

        let mut b = base.clone();
        let op = b.write_op("slot", "from-b");
        b.apply(op, stamp(5, "p2"));

        a.merge(&b);
        let live: Vec<_> = a.get(&"slot").map(|(_, v)| *v).collect();
        assert_eq!(live.len(), 2);
        assert_eq!(a.resolve(&"slot"), Some(&"from-b"));
    }

    #[test]
    fn later_write_subsumes_all_siblings() {
        let base: MvMap<&str, &str> = MvMap::new();
        let mut a = base.clone();
        let op = a.write_op("slot", "one");
        a.apply(op, stamp(5, "p1"));
        let mut b = base.clone();
        let op = b.write_op("slot", "two");
        b.apply(op, stamp(5, "p2"));
        a.merge(&b);

        let op = a.write_op("slot", "final");
        a.apply(op, stamp(9, "p1"));
        let live: Vec<_> = a.get(&"slot").map(|(_, v)| *v).collect();
        assert_eq!(live, vec!["final"]);
    }

    #[test]
    fn remove_spares_concurrent_write() {
        let mut origin = MvMap::new();
        let op = origin.write_op("slot", "old");
        origin.apply(op, stamp(1, "p1"));

        // p2 removes what it observed; p3 writes concurrently.
        let remove = origin.remove_op("slot");
        let mut other = origin.clone();
        let write = other.write_op("slot", "new");
        other.apply(write, stamp(3, "p3"));
        other.apply(remove, stamp(2, "p2"));

        let live: Vec<_> = other.get(&"slot").map(|(_, v)| *v).collect();
        assert_eq!(live, vec!["new"]);
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let base: MvMap<&str, u32> = MvMap::new();
        let mut a = base.clone();
        let op = a.write_op("k", 1);
        a.apply(op, stamp(1, "p1"));
        let mut b = base.clone();
        let op = b.write_op("k", 2);
        b.apply(op, stamp(1, "p2"));
        let remove = b.remove_op("k");
        b.apply(remove, stamp(2, "p2"));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        twice.merge(&ab);
        assert_eq!(twice, ab);
    }

    #[test]
    fn delta_replays_to_equal_view() {
        let mut map = MvMap::new();
        let op = map.write_op("a", 1);
        map.apply(op, stamp(1, "p1"));
        let op = map.write_op("a", 2);
        map.apply(op, stamp(2, "p1"));
        let op = map.write_op("b", 3);
        map.apply(op, stamp(3, "p1"));
        let remove = map.remove_op("b");
        map.apply(remove, stamp(4, "p1"));

        let mut replica = MvMap::new();
        for (stamp, op) in map.delta(&WriteStamp::ZERO) {
            replica.apply(op, stamp);
        }
        let live: Vec<_> = replica.get(&"a").map(|(_, v)| *v).collect();
        assert_eq!(live, vec![2]);
        assert!(!replica.contains_key(&"b"));
    }

    #[test]
    fn serde_round_trips_with_stamp_keys() {
        let mut map = MvMap::new();
        let op = map.write_op("slot".to_string(), 7u32);
        map.apply(op, stamp(1, "p1"));
        let remove = map.remove_op("gone".to_string());
        map.apply(remove, stamp(2, "p1"));

        let text = serde_json::to_string(&map).unwrap();
        let back: MvMap<String, u32> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, map);
    }
}
