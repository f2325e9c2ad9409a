#![forbid(unsafe_code)]

//! Meridian federates physical and virtual resources across
//! datacenters and cloud providers into one eventually-consistent
//! logical infrastructure. Every instance is a peer holding the full
//! model; peers converge by gossiping CRDT deltas over websockets,
//! ordered by a hybrid logical clock. Tenants reserve resource
//! profiles for time windows through a fair-share scheduler;
//! maintenance events ride the same machinery under a reserved tenant.
//!
//! Layering, leaves first:
//! - [`core`]: stamps, the clock, identities, canonical JSON
//! - [`crdt`]: LWW register/map, OR-set, fractional-index sequence,
//!   multi-value map
//! - [`model`]: typed entities and the merged aggregate
//! - [`store`]: snapshots and the delta log behind an opaque sink
//! - [`sched`]: fair-share admission, placement, availability
//! - [`sync`]: authenticated delta gossip with backpressure
//! - [`controller`]: the provider adapter contract
//! - [`runtime`]: the assembled node

pub mod config;
pub mod controller;
pub mod core;
pub mod crdt;
pub mod error;
pub mod model;
pub mod runtime;
pub mod sched;
pub mod store;
pub mod sync;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at crate root for convenience.
pub use crate::config::Config;
pub use crate::controller::{Controller, ControllerError, InventoryPush, InventoryResource};
pub use crate::core::{
    ClaimId, Clock, CoreError, DatacenterId, GroupId, PeerId, ProfileId, ResourceId, Stamp,
    TenantId, WriteStamp,
};
pub use crate::crdt::{Crdt, FracIndex, IndexedSeq, LwwMap, LwwRegister, MvMap, OrSet};
pub use crate::model::{
    Capacity, Claim, ClaimMeta, ClaimStatus, Datacenter, Infrastructure, LogicalGroup, Op,
    Resource, ResourceKind, ResourceProfile, ResourceState, Window,
};
pub use crate::runtime::Node;
pub use crate::sched::{Availability, CapacityError, Scheduler, SchedulerConfig};
pub use crate::store::{DirSink, MemorySink, Persister, Snapshot, StoreError, StoreSink};
pub use crate::sync::{SyncAuthError, SyncConfig, SyncCore, SyncEngine, SyncError, SyncMetrics};
