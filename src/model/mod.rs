//! The logical infrastructure model.
//!
//! Typed entities built on the CRDT substrate:
//! - resource: capacity-carrying inventory records
//! - datacenter: ordered physical layout referencing resources by id
//! - group: logical slot-to-resource mapping
//! - claim: time-bounded reservations and maintenance events
//! - op: the stamped operation envelope
//! - infra: the merged aggregate and its validated operations

pub mod claim;
pub mod datacenter;
pub mod group;
pub mod infra;
pub mod op;
pub mod resource;

pub use claim::{Claim, ClaimMeta, ClaimOp, ClaimStatus, ResourceProfile, Window};
pub use datacenter::{Datacenter, DatacenterOp, RackId, RowId};
pub use group::{GroupOp, LogicalGroup};
pub use infra::Infrastructure;
pub use op::{Op, OpBody};
pub use resource::{
    CAPACITY_DIMENSIONS, Capacity, Resource, ResourceKind, ResourceMeta, ResourceOp, ResourceState,
};
