//! Identity atoms.
//!
//! Every entity carries a stable opaque identifier assigned at creation.
//! Peers never reassign them; equality is plain string equality.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $variant:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
                let s = s.into();
                if s.is_empty() {
                    return Err(InvalidId::$variant {
                        raw: s,
                        reason: "empty".into(),
                    }
                    .into());
                }
                if s.contains(char::is_whitespace) {
                    return Err(InvalidId::$variant {
                        raw: s,
                        reason: "cannot contain whitespace".into(),
                    }
                    .into());
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Stable self-identity of a running peer.
    PeerId,
    Peer
);

string_id!(
    /// Tenant as the partitioning unit for shares and claims.
    TenantId,
    Tenant
);

string_id!(
    /// Identifier of a physical or virtual resource.
    ResourceId,
    Resource
);

string_id!(
    /// Identifier of a claim on the infrastructure.
    ClaimId,
    Claim
);

string_id!(
    /// Identifier of a datacenter.
    DatacenterId,
    Datacenter
);

string_id!(
    /// Identifier of a logical grouping of resources.
    GroupId,
    Group
);

string_id!(
    /// Identifier of one resource profile inside a claim.
    ProfileId,
    Profile
);

impl PeerId {
    /// Random identity for peers started without a configured one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Sentinel author for zero stamps on placeholder records. Any real
    /// write outstamps it because its wall time is zero.
    pub(crate) fn sentinel() -> Self {
        Self("-".to_string())
    }
}

impl ClaimId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl ProfileId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

/// Reserved tenant under which maintenance events are scheduled.
///
/// Maintenance consumes no share; the scheduler skips this tenant in
/// fair-share accounting.
pub const MAINTENANCE_TENANT: &str = "maintenance";

impl TenantId {
    pub fn maintenance() -> Self {
        Self(MAINTENANCE_TENANT.to_string())
    }

    pub fn is_maintenance(&self) -> bool {
        self.0 == MAINTENANCE_TENANT
    }
}
