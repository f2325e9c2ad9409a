//! Conflict-free replicated data types.
//!
//! Every primitive exposes the same capability set: stamped mutators, a
//! pure `merge`, `delta(since)` returning the ops newer than a stamp,
//! and a deterministic materialized view. The model layer composes them;
//! nothing here knows about resources or claims.

pub mod lww;
pub mod mvmap;
pub mod orset;
pub mod pairs;
pub mod seq;

pub use lww::{LwwMap, LwwRegister, MapOp};
pub use mvmap::{MvMap, MvOp};
pub use orset::{OrSet, SetOp, Tag};
pub use seq::{FracIndex, IndexedSeq, SeqKey, SeqOp};

use crate::core::time::WriteStamp;

/// A state that can be merged deterministically.
///
/// Properties every implementation upholds:
/// - Commutative: merging a into b equals merging b into a
/// - Associative: grouping of merges does not matter
/// - Idempotent: merging a state into itself changes nothing
pub trait Crdt {
    /// Fold a remote state into this one.
    fn merge(&mut self, other: &Self);

    /// Greatest write stamp contained anywhere in this state.
    ///
    /// Tombstone resolution and clock recovery after restart both lean
    /// on this.
    fn high_water(&self) -> WriteStamp;
}
