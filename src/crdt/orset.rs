//! Observed-remove set.
//!
//! Each addition mints a unique tag; removal tombstones only the tags it
//! has observed. A re-add after removal carries a fresh tag and wins,
//! which is the behavior reservations need: withdrawing a profile must
//! not cancel a concurrent re-submission.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::Crdt;

/// Unique tag minted per addition.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self.0)
    }
}

/// One operation against an [`OrSet`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SetOp<T> {
    Add { value: T, tag: Tag },
    Remove { value: T, tag: Tag },
}

/// Observed-remove set with per-addition tags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize + Ord",
    deserialize = "T: Deserialize<'de> + Ord"
))]
pub struct OrSet<T: Ord> {
    #[serde(with = "crate::crdt::pairs")]
    entries: BTreeMap<T, BTreeMap<Tag, Stamp>>,
    tombstones: BTreeMap<Tag, (T, Stamp)>,
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Record a local addition, minting the tag for the caller to put in
    /// the op envelope.
    pub fn add(&mut self, value: T, stamp: Stamp) -> Tag {
        let tag = Tag::generate();
        self.apply(
            SetOp::Add {
                value,
                tag: tag.clone(),
            },
            stamp,
        );
        tag
    }

    /// Tags currently observed for a value, as removal targets.
    pub fn observed_tags(&self, value: &T) -> Vec<Tag> {
        self.entries
            .get(value)
            .map(|tags| tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Removal ops tombstoning every observed tag of a value. A
    /// concurrent add under a tag we have not seen survives.
    pub fn removal_ops(&self, value: &T) -> Vec<SetOp<T>> {
        self.observed_tags(value)
            .into_iter()
            .map(|tag| SetOp::Remove {
                value: value.clone(),
                tag,
            })
            .collect()
    }

    pub fn apply(&mut self, op: SetOp<T>, stamp: Stamp) {
        match op {
            SetOp::Add { value, tag } => {
                if self.tombstones.contains_key(&tag) {
                    return;
                }
                self.entries.entry(value).or_default().insert(tag, stamp);
            }
            SetOp::Remove { value, tag } => {
                self.tombstones
                    .entry(tag.clone())
                    .or_insert((value.clone(), stamp));
                if let Some(tags) = self.entries.get_mut(&value) {
                    tags.remove(&tag);
                    if tags.is_empty() {
                        self.entries.remove(&value);
                    }
                }
            }
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains_key(value)
    }

    /// Deterministic materialized view.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All operations stamped after `since`.
    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, SetOp<T>)> {
        let mut ops = Vec::new();
        for (value, tags) in &self.entries {
            for (tag, stamp) in tags {
                if stamp.at > *since {
                    ops.push((
                        stamp.clone(),
                        SetOp::Add {
                            value: value.clone(),
                            tag: tag.clone(),
                        },
                    ));
                }
            }
        }
        for (tag, (value, stamp)) in &self.tombstones {
            if stamp.at > *since {
                ops.push((
                    stamp.clone(),
                    SetOp::Remove {
                        value: value.clone(),
                        tag: tag.clone(),
                    },
                ));
            }
        }
        ops
    }
}

impl<T: Ord + Clone> Default for OrSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> Crdt for OrSet<T> {
    fn merge(&mut self, other: &Self) {
        for (tag, (value, stamp)) in &other.tombstones {
            self.apply(
                SetOp::Remove {
                    value: value.clone(),
                    tag: tag.clone(),
                },
                stamp.clone(),
            );
        }
        for (value, tags) in &other.entries {
            for (tag, stamp) in tags {
                self.apply(
                    SetOp::Add {
                        value: value.clone(),
                        tag: tag.clone(),
                    },
                    stamp.clone(),
                );
            }
        }
    }

    fn high_water(&self) -> WriteStamp {
        let adds = self
            .entries
            .values()
            .flat_map(|tags| tags.values())
            .map(|stamp| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        let removes = self
            .tombstones
            .values()
            .map(|(_, stamp)| stamp.at)
            .max()
            .unwrap_or(WriteStamp::ZERO);
        adds.max(removes)
    }
}
