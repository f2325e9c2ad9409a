//! Hybrid timestamps.
//!
//! `WriteStamp` is the (wall_ms, counter) ordering primitive; `Stamp`
//! adds the originating peer for a deterministic total order across the
//! cluster. Wall time is a measurement, causality lives in the pair.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::identity::PeerId;

/// HLC timestamp - the ordering primitive.
///
/// (wall_ms, counter) forms a total order within a peer. Counter breaks
/// ties for events inside the same millisecond and absorbs wall clocks
/// that stand still or step backward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteStamp {
    pub wall_ms: u64,
    pub counter: u32,
}

impl WriteStamp {
    pub const ZERO: WriteStamp = WriteStamp {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }
}

impl PartialOrd for WriteStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WriteStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_ms
            .cmp(&other.wall_ms)
            .then_with(|| self.counter.cmp(&other.counter))
    }
}

impl std::fmt::Display for WriteStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.wall_ms, self.counter)
    }
}

/// WriteStamp plus attribution.
///
/// This is what LWW merges compare - the peer id makes concurrent writes
/// at identical (wall_ms, counter) resolve the same way on every peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub at: WriteStamp,
    pub by: PeerId,
}

impl Stamp {
    pub fn new(at: WriteStamp, by: PeerId) -> Self {
        Self { at, by }
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then_with(|| self.by.cmp(&other.by))
    }
}

impl std::fmt::Display for Stamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.at, self.by)
    }
}
