//! Last-writer-wins register and map.
//!
//! The fundamental merge primitives for scalar fields. Higher stamp
//! wins; the stamp carries the writing peer, so ties resolve the same
//! way everywhere.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::Crdt;

/// Last-writer-wins register.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    stamp: Stamp,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    /// Record a write. Returns false when an existing newer write wins.
    pub fn set(&mut self, value: T, stamp: Stamp) -> bool {
        if stamp > self.stamp {
            self.value = value;
            self.stamp = stamp;
            true
        } else {
            false
        }
    }

    /// Current value when written after `since`, for delta extraction.
    pub fn delta(&self, since: &WriteStamp) -> Option<(Stamp, T)> {
        (self.stamp.at > *since).then(|| (self.stamp.clone(), self.value.clone()))
    }
}

impl<T: Clone> Crdt for LwwRegister<T> {
    fn merge(&mut self, other: &Self) {
        if other.stamp > self.stamp {
            self.value = other.value.clone();
            self.stamp = other.stamp.clone();
        }
    }

    fn high_water(&self) -> WriteStamp {
        self.stamp.at
    }
}

/// One operation against an [`LwwMap`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MapOp<K, V> {
    Set { key: K, value: V },
    Remove { key: K },
}

/// Map from K to an LWW register per key, plus a tombstone stamp per
/// removed key.
///
/// A removed key revives when a later write outstamps its tombstone.
/// Tombstones are never garbage-collected; dropping one without a
/// causal-safety barrier would resurrect deleted keys on merge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Ord + Serialize, V: Serialize",
    deserialize = "K: Ord + Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct LwwMap<K: Ord, V> {
    #[serde(with = "crate::crdt::pairs")]
    entries: BTreeMap<K, LwwRegister<V>>,
    #[serde(with = "crate::crdt::pairs")]
    tombstones: BTreeMap<K, Stamp>,
}

impl<K: Ord + Clone, V: Clone> LwwMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, op: MapOp<K, V>, stamp: Stamp) {
        match op {
            MapOp::Set { key, value } => self.apply_set(key, value, stamp),
            MapOp::Remove { key } => self.apply_remove(key, stamp),
        }
    }

    pub fn apply_set(&mut self, key: K, value: V, stamp: Stamp) {
        match self.entries.get_mut(&key) {
            Some(reg) => {
                reg.set(value, stamp);
            }
            None => {
                self.entries.insert(key, LwwRegister::new(value, stamp));
            }
        }
    }

    pub fn apply_remove(&mut self, key: K, stamp: Stamp) {
        match self.tombstones.get_mut(&key) {
            Some(existing) => {
                if stamp > *existing {
                    *existing = stamp;
                }
            }
            None => {
                self.tombstones.insert(key, stamp);
            }
        }
    }

    /// Read a live value; tombstoned keys read as absent.
    pub fn get(&self, key: &K) -> Option<&V> {
        let reg = self.entries.get(key)?;
        match self.tombstones.get(key) {
            Some(dead) if *dead > *reg.stamp() => None,
            _ => Some(reg.get()),
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Deterministic materialized view of live entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().filter_map(|(key, reg)| {
            match self.tombstones.get(key) {
                Some(dead) if *dead > *reg.stamp() => None,
                _ => Some((key, reg.get())),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// All operations stamped after `since`.
    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, MapOp<K, V>)> {
        let mut ops = Vec::new();
        for (key, reg) in &self.entries {
            if let Some((stamp, value)) = reg.delta(since) {
                ops.push((
                    stamp,
                    MapOp::Set {
                        key: key.clone(),
                        value,
                    },
                ));
            }
        }
        for (key, stamp) in &self.tombstones {
            if stamp.at > *since {
                ops.push((stamp.clone(), MapOp::Remove { key: key.clone() }));
            }
        }
        ops
    }
}

impl<K: Ord + Clone, V: Clone> Default for LwwMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Clone, V: Clone> Crdt for LwwMap<K, V> {
    fn merge(&mut self, other: &Self) {
        for (key, reg) in &other.entries {
            match self.entries.get_mut(key) {
                Some(local) => local.merge(reg),
                None => {
                    self.entries.insert(key.clone(), reg.clone());
                }
            }
        }
        for (key, stamp) in &other.tombstones {
            self.apply_remove(key.clone(), stamp.clone());
        }
    }

    fn high_water(&self) -> WriteStamp {
        let entries = self
            .entries
            .values()
            .map(|reg| reg.high_water())
            .max()
            .unwrap_or(WriteStamp::ZERO);
        let tombs = self
            .tombstones
            .values()
            .map(|stamp| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        entries.max(tombs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::PeerId;

    fn stamp(wall: u64, counter: u32, peer: &str) -> Stamp {
        Stamp::new(WriteStamp::new(wall, counter), PeerId::new(peer).unwrap())
    }

    #[test]
    fn register_keeps_greater_stamp() {
        let mut reg = LwwRegister::new("a", stamp(10, 0, "p1"));
        assert!(reg.set("b", stamp(11, 0, "p1")));
        assert!(!reg.set("stale", stamp(10, 5, "p1")));
        assert_eq!(*reg.get(), "b");
    }

    #[test]
    fn register_tie_breaks_on_peer() {
        let mut a = LwwRegister::new("from-a", stamp(10, 0, "aaa"));
        let b = LwwRegister::new("from-b", stamp(10, 0, "bbb"));
        a.merge(&b);
        assert_eq!(*a.get(), "from-b");
    }

    #[test]
    fn register_merge_is_commutative_and_idempotent() {
        let one = LwwRegister::new(1u32, stamp(5, 0, "p1"));
        let two = LwwRegister::new(2u32, stamp(5, 1, "p2"));

        let mut ab = one.clone();
        ab.merge(&two);
        let mut ba = two.clone();
        ba.merge(&one);
        assert_eq!(ab, ba);

        let mut twice = ab.clone();
        twice.merge(&ab);
        assert_eq!(twice, ab);
    }

    #[test]
    fn map_set_get_remove() {
        let mut map = LwwMap::new();
        map.apply_set("k", 1, stamp(1, 0, "p1"));
        assert_eq!(map.get(&"k"), Some(&1));

        map.apply_remove("k", stamp(2, 0, "p1"));
        assert_eq!(map.get(&"k"), None);
        assert!(map.is_empty());
    }

    #[test]
    fn map_revives_after_tombstone() {
        let mut map = LwwMap::new();
        map.apply_set("k", 1, stamp(1, 0, "p1"));
        map.apply_remove("k", stamp(2, 0, "p1"));
        map.apply_set("k", 2, stamp(3, 0, "p1"));
        assert_eq!(map.get(&"k"), Some(&2));
    }

    #[test]
    fn map_remove_wins_concurrent_older_set() {
        let mut map = LwwMap::new();
        map.apply_set("k", 1, stamp(5, 0, "aaa"));
        map.apply_remove("k", stamp(5, 0, "bbb"));
        // bbb > aaa at equal (wall, counter)
        assert_eq!(map.get(&"k"), None);
    }

    #[test]
    fn map_merge_unions_keys() {
        let mut a = LwwMap::new();
        a.apply_set("x", 1, stamp(1, 0, "p1"));
        let mut b = LwwMap::new();
        b.apply_set("y", 2, stamp(1, 0, "p2"));

        a.merge(&b);
        assert_eq!(a.get(&"x"), Some(&1));
        assert_eq!(a.get(&"y"), Some(&2));
    }

    #[test]
    fn map_delta_contains_only_newer_ops() {
        let mut map = LwwMap::new();
        map.apply_set("old", 1, stamp(1, 0, "p1"));
        map.apply_set("new", 2, stamp(10, 0, "p1"));
        map.apply_remove("gone", stamp(11, 0, "p1"));

        let ops = map.delta(&WriteStamp::new(5, 0));
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|(stamp, _)| stamp.at.wall_ms >= 10));
    }

    #[test]
    fn map_delta_replays_to_equal_state() {
        let mut map = LwwMap::new();
        map.apply_set("a", 1, stamp(1, 0, "p1"));
        map.apply_set("b", 2, stamp(2, 0, "p1"));
        map.apply_remove("a", stamp(3, 0, "p1"));

        let mut replica = LwwMap::new();
        for (stamp, op) in map.delta(&WriteStamp::ZERO) {
            replica.apply(op, stamp);
        }
        assert_eq!(replica, map);
    }
}
