//! The stamped operation envelope.
//!
//! One `Op` is the unit of everything that moves: local mutation,
//! delta gossip between peers, and the persisted delta log. The stamp
//! doubles as the cluster-wide dedup key, since stamps are strictly
//! increasing per peer.

use serde::{Deserialize, Serialize};

use crate::core::identity::{ClaimId, DatacenterId, GroupId, PeerId, ResourceId};
use crate::core::time::Stamp;
use crate::model::claim::ClaimOp;
use crate::model::datacenter::DatacenterOp;
use crate::model::group::GroupOp;
use crate::model::resource::ResourceOp;

/// Entity routing plus the field-level CRDT operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum OpBody {
    Resource { id: ResourceId, op: ResourceOp },
    ResourceRemove { id: ResourceId },
    Datacenter { id: DatacenterId, op: DatacenterOp },
    Group { id: GroupId, op: GroupOp },
    Claim { id: ClaimId, op: ClaimOp },
    ClaimRemove { id: ClaimId },
}

/// A stamped CRDT operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub stamp: Stamp,
    pub body: OpBody,
}

impl Op {
    pub fn new(stamp: Stamp, body: OpBody) -> Self {
        Self { stamp, body }
    }

    /// The peer that authored this op.
    pub fn origin(&self) -> &PeerId {
        &self.stamp.by
    }
}
