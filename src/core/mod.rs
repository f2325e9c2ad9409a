//! Core primitives.
//!
//! Module order follows type dependency order:
//! - time: hybrid timestamp primitives
//! - identity: peer/tenant/resource/claim ids
//! - clock: the hybrid logical clock
//! - json_canon: canonical JSON bytes
//! - error: core error taxonomy

pub mod clock;
pub mod error;
pub mod identity;
pub mod json_canon;
pub mod time;

pub use clock::{Clock, DEFAULT_CLOCK_OFFSET_SECS, now_ms};
pub use error::{CoreError, InvalidId};
pub use identity::{
    ClaimId, DatacenterId, GroupId, MAINTENANCE_TENANT, PeerId, ProfileId, ResourceId, TenantId,
};
pub use json_canon::{CanonJsonError, from_canon_json_bytes, to_canon_json_bytes};
pub use time::{Stamp, WriteStamp};
