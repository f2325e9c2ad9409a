//! Fractionally indexed sequence.
//!
//! Positions are dense rationals: between any two positions another one
//! always fits, so physical layout (rows, racks, slots) stays editable
//! without reindexing peers. Interstitial positions come from the
//! Stern-Brocot mediant of the neighbors.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::Crdt;

/// A reduced rational position.
///
/// `LOW` (0/1) and `HIGH` (1/0, the point at infinity) bound the
/// sequence; every element position lies strictly between them.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct FracIndex {
    num: u64,
    den: u64,
}

// Equality and hashing follow the rational value, not the
// representation, so an unreduced fraction off the wire still behaves.
impl PartialEq for FracIndex {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FracIndex {}

impl std::hash::Hash for FracIndex {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let reduced = self.reduced();
        reduced.num.hash(state);
        reduced.den.hash(state);
    }
}

impl FracIndex {
    /// Sentinel below every element position.
    pub const LOW: FracIndex = FracIndex { num: 0, den: 1 };
    /// Sentinel above every element position.
    pub const HIGH: FracIndex = FracIndex { num: 1, den: 0 };

    /// The mediant of two positions: always strictly between them.
    ///
    /// Returns None when the components would overflow, which takes on
    /// the order of ninety consecutive insertions into the same gap;
    /// callers surface that as a validation error rather than silently
    /// misordering.
    pub fn between(low: &FracIndex, high: &FracIndex) -> Option<FracIndex> {
        let num = low.num.checked_add(high.num)?;
        let den = low.den.checked_add(high.den)?;
        Some(FracIndex { num, den }.reduced())
    }

    /// Position for the first element of an empty sequence.
    pub fn first() -> FracIndex {
        // Mediant of the sentinels, 1/1.
        FracIndex { num: 1, den: 1 }
    }

    fn reduced(self) -> FracIndex {
        let g = gcd(self.num, self.den);
        if g <= 1 {
            self
        } else {
            FracIndex {
                num: self.num / g,
                den: self.den / g,
            }
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl PartialOrd for FracIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FracIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        // Cross-multiply in u128; denominator 0 encodes infinity and
        // still orders correctly through this comparison.
        let left = self.num as u128 * other.den as u128;
        let right = other.num as u128 * self.den as u128;
        left.cmp(&right)
    }
}

impl fmt::Debug for FracIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl fmt::Display for FracIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Unique key of one inserted element.
///
/// Concurrent inserts into the same gap compute the same mediant; the
/// stamp makes the key unique and fixes their relative order
/// deterministically (timestamp, then peer).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqKey {
    pub pos: FracIndex,
    pub stamp: Stamp,
}

/// One operation against an [`IndexedSeq`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SeqOp<T> {
    Insert { pos: FracIndex, value: T },
    Delete { key: SeqKey },
}

/// Totally ordered sequence over fractional positions.
///
/// Deletion leaves a tombstone keyed by the element's position key, so
/// a delete and a concurrent re-insert at the same gap never collide.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: Deserialize<'de>"
))]
pub struct IndexedSeq<T> {
    #[serde(with = "crate::crdt::pairs")]
    entries: BTreeMap<SeqKey, T>,
    #[serde(with = "crate::crdt::pairs")]
    tombstones: BTreeMap<SeqKey, Stamp>,
}

impl<T: Clone> IndexedSeq<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, op: SeqOp<T>, stamp: Stamp) {
        match op {
            SeqOp::Insert { pos, value } => {
                let key = SeqKey { pos, stamp };
                if !self.tombstones.contains_key(&key) {
                    self.entries.entry(key).or_insert(value);
                }
            }
            SeqOp::Delete { key } => {
                self.entries.remove(&key);
                self.tombstones.entry(key).or_insert(stamp);
            }
        }
    }

    /// Position strictly after every live element.
    pub fn tail_position(&self) -> Option<FracIndex> {
        let last = self
            .entries
            .keys()
            .next_back()
            .map(|key| key.pos)
            .unwrap_or(FracIndex::LOW);
        FracIndex::between(&last, &FracIndex::HIGH)
    }

    /// Position between the live elements at `index - 1` and `index`.
    ///
    /// `index` past the end appends. Returns None on position overflow.
    pub fn position_at(&self, index: usize) -> Option<FracIndex> {
        let keys: Vec<&SeqKey> = self.entries.keys().collect();
        let low = if index == 0 {
            FracIndex::LOW
        } else {
            keys.get(index - 1).map(|k| k.pos).unwrap_or_else(|| {
                keys.last().map(|k| k.pos).unwrap_or(FracIndex::LOW)
            })
        };
        let high = keys.get(index).map(|k| k.pos).unwrap_or(FracIndex::HIGH);
        FracIndex::between(&low, &high)
    }

    /// Next free gap at or after a requested position: when the hint is
    /// already taken, the mediant between the hint and its successor.
    pub fn resolve_hint(&self, hint: FracIndex) -> Option<FracIndex> {
        let taken = self.entries.keys().any(|key| key.pos == hint);
        if !taken {
            return Some(hint);
        }
        let next = self
            .entries
            .keys()
            .map(|key| key.pos)
            .find(|pos| *pos > hint)
            .unwrap_or(FracIndex::HIGH);
        FracIndex::between(&hint, &next)
    }

    pub fn get(&self, key: &SeqKey) -> Option<&T> {
        self.entries.get(key)
    }

    /// Live elements in position order.
    pub fn iter(&self) -> impl Iterator<Item = (&SeqKey, &T)> {
        self.entries.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All operations stamped after `since`.
    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, SeqOp<T>)> {
        let mut ops = Vec::new();
        for (key, value) in &self.entries {
            if key.stamp.at > *since {
                ops.push((
                    key.stamp.clone(),
                    SeqOp::Insert {
                        pos: key.pos,
                        value: value.clone(),
                    },
                ));
            }
        }
        for (key, stamp) in &self.tombstones {
            if stamp.at > *since {
                ops.push((stamp.clone(), SeqOp::Delete { key: key.clone() }));
            }
        }
        ops
    }
}

impl<T: Clone> Default for IndexedSeq<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Crdt for IndexedSeq<T> {
    fn merge(&mut self, other: &Self) {
        for (key, stamp) in &other.tombstones {
            self.entries.remove(key);
            self.tombstones
                .entry(key.clone())
                .or_insert(stamp.clone());
        }
        for (key, value) in &other.entries {
            if !self.tombstones.contains_key(key) {
                self.entries.entry(key.clone()).or_insert(value.clone());
            }
        }
    }

    fn high_water(&self) -> WriteStamp {
        let inserts = self
            .entries
            .keys()
            .map(|key| key.stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        let deletes = self
            .tombstones
            .values()
            .map(|stamp| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        inserts.max(deletes)
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
    fn mediant_lies_strictly_between() {
        let low = FracIndex::first();
        let high = FracIndex::between(&low, &FracIndex::HIGH).unwrap();
        let mid = FracIndex::between(&low, &high).unwrap();
        assert!(low < mid);
        assert!(mid < high);
    }

    #[test]
    fn mediant_reduces_to_lowest_terms() {
        let third = FracIndex { num: 1, den: 3 };
        let one = FracIndex::first();
        // mediant 2/4 reduces to 1/2
        let mid = FracIndex::between(&third, &one).unwrap();
        assert_eq!(mid, FracIndex { num: 1, den: 2 });
    }

    #[test]
    fn repeated_gap_insertion_stays_ordered() {
        let mut low = FracIndex::LOW;
        let high = FracIndex::first();
        let mut previous = low;
        for _ in 0..64 {
            let mid = FracIndex::between(&low, &high).unwrap();
            assert!(previous < mid || previous == FracIndex::LOW);
            assert!(mid < high);
            previous = mid;
            low = mid;
        }
    }

    #[test]
    fn sequence_orders_by_position() {
        let mut seq = IndexedSeq::new();
        let first = FracIndex::first();
        seq.apply(
            SeqOp::Insert {
                pos: first,
                value: "b",
            },
            stamp(1, "p1"),
        );
        let before = FracIndex::between(&FracIndex::LOW, &first).unwrap();
        seq.apply(
            SeqOp::Insert {
                pos: before,
                value: "a",
            },
            stamp(2, "p1"),
        );
        let order: Vec<_> = seq.values().copied().collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn concurrent_same_gap_inserts_order_by_stamp() {
        // Both peers insert between the same neighbors and compute the
        // same mediant; stamps fix the relative order on every replica.
        let pos = FracIndex::first();
        let mut a = IndexedSeq::new();
        a.apply(
            SeqOp::Insert {
                pos,
                value: "from-p1",
            },
            stamp(200, "p1"),
        );
        let mut b = IndexedSeq::new();
        b.apply(
            SeqOp::Insert {
                pos,
                value: "from-p2",
            },
            stamp(201, "p2"),
        );

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        let order: Vec<_> = ab.values().copied().collect();
        assert_eq!(order, vec!["from-p1", "from-p2"]);
    }

    #[test]
    fn delete_tombstone_beats_late_insert() {
        let pos = FracIndex::first();
        let insert_stamp = stamp(5, "p1");
        let key = SeqKey {
            pos,
            stamp: insert_stamp.clone(),
        };

        let mut replica = IndexedSeq::<&str>::new();
        replica.apply(SeqOp::Delete { key: key.clone() }, stamp(6, "p2"));
        replica.apply(SeqOp::Insert { pos, value: "x" }, insert_stamp);
        assert!(replica.is_empty());
    }

    #[test]
    fn resolve_hint_moves_right_when_taken() {
        let mut seq = IndexedSeq::new();
        let pos = FracIndex::first();
        seq.apply(SeqOp::Insert { pos, value: "x" }, stamp(1, "p1"));

        let resolved = seq.resolve_hint(pos).unwrap();
        assert!(resolved > pos);

        let free = FracIndex::between(&FracIndex::LOW, &pos).unwrap();
        assert_eq!(seq.resolve_hint(free).unwrap(), free);
    }

    #[test]
    fn delta_replays_to_equal_state() {
        let mut seq = IndexedSeq::new();
        let first = FracIndex::first();
        seq.apply(
            SeqOp::Insert {
                pos: first,
                value: "a",
            },
            stamp(1, "p1"),
        );
        let second = seq.tail_position().unwrap();
        seq.apply(
            SeqOp::Insert {
                pos: second,
                value: "b",
            },
            stamp(2, "p1"),
        );
        let key = seq.iter().next().map(|(k, _)| k.clone()).unwrap();
        seq.apply(SeqOp::Delete { key }, stamp(3, "p1"));

        let mut replica = IndexedSeq::new();
        for (stamp, op) in seq.delta(&WriteStamp::ZERO) {
            replica.apply(op, stamp);
        }
        assert_eq!(replica, seq);
    }
}
