//! Logical groups: named slots mapping onto resources across
//! datacenters.
//!
//! Membership is a multi-value map so that two operators assigning the
//! same slot concurrently both stay visible until someone resolves the
//! conflict with a later write.

use serde::{Deserialize, Serialize};

use crate::core::identity::{PeerId, ResourceId};
use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, LwwRegister, MvMap, MvOp};

/// One operation against a logical group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum GroupOp {
    Name { name: String },
    Member(MvOp<String, ResourceId>),
}

/// Composite record for one logical group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalGroup {
    name: LwwRegister<String>,
    members: MvMap<String, ResourceId>,
}

impl LogicalGroup {
    /// Deterministic empty record; see `Resource::placeholder`.
    pub fn placeholder() -> Self {
        let zero = Stamp::new(WriteStamp::ZERO, PeerId::sentinel());
        Self {
            name: LwwRegister::new(String::new(), zero),
            members: MvMap::new(),
        }
    }

    pub fn apply(&mut self, op: GroupOp, stamp: Stamp) {
        match op {
            GroupOp::Name { name } => {
                self.name.set(name, stamp);
            }
            GroupOp::Member(op) => self.members.apply(op, stamp),
        }
    }

    pub fn name(&self) -> &str {
        self.name.get()
    }

    pub fn members(&self) -> &MvMap<String, ResourceId> {
        &self.members
    }

    /// Build the op assigning a slot, superseding observed siblings.
    pub fn assign_op(&self, slot: String, resource: ResourceId) -> GroupOp {
        GroupOp::Member(self.members.write_op(slot, resource))
    }

    /// Build the op clearing a slot's observed assignments.
    pub fn clear_op(&self, slot: String) -> GroupOp {
        GroupOp::Member(self.members.remove_op(slot))
    }

    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, GroupOp)> {
        let mut ops = Vec::new();
        if let Some((stamp, name)) = self.name.delta(since) {
            ops.push((stamp, GroupOp::Name { name }));
        }
        for (stamp, op) in self.members.delta(since) {
            ops.push((stamp, GroupOp::Member(op)));
        }
        ops
    }
}

impl Crdt for LogicalGroup {
    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
        self.members.merge(&other.members);
    }

    fn high_water(&self) -> WriteStamp {
        self.name.high_water().max(self.members.high_water())
    }
}
