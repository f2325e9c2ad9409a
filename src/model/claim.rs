//! Claims: time-bounded requests for resource profiles.
//!
//! A claim moves through the scheduler state machine; the record itself
//! is a composite CRDT so concurrent peers converge on the same status
//! and placements. Maintenance events are claims under the reserved
//! maintenance tenant.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::identity::{PeerId, ProfileId, ResourceId, TenantId};
use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, LwwMap, LwwRegister, MapOp, OrSet, SetOp};
use crate::model::resource::ResourceKind;

/// Half-open reservation window `[start_ms, end_ms)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Window {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start_ms < other.end_ms && other.start_ms < self.end_ms
    }

    /// Milliseconds of overlap with another window.
    pub fn overlap_ms(&self, other: &Window) -> u64 {
        let start = self.start_ms.max(other.start_ms);
        let end = self.end_ms.min(other.end_ms);
        end.saturating_sub(start)
    }

    pub fn contains_instant(&self, at_ms: u64) -> bool {
        self.start_ms <= at_ms && at_ms < self.end_ms
    }
}

/// Abstract description of desired resources.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub id: ProfileId,
    pub kind: ResourceKind,
    pub quantity: u32,
    /// `key=value` attributes a resource must carry.
    pub required: BTreeMap<String, String>,
    /// Soft preferences; placement favors but does not require them.
    pub preferred: BTreeMap<String, String>,
    /// Shorter-than-window duration, when the profile does not need the
    /// whole claim window.
    pub duration_ms: Option<u64>,
}

impl ResourceProfile {
    /// The slice of the claim window this profile actually occupies.
    pub fn effective_window(&self, claim: &Window) -> Window {
        match self.duration_ms {
            Some(duration) => Window::new(
                claim.start_ms,
                claim.end_ms.min(claim.start_ms.saturating_add(duration)),
            ),
            None => *claim,
        }
    }
}

/// Scheduler state machine position.
///
/// `pending -> admitted -> placed -> expired`, with `rejected` exits
/// from pending and admitted. Rejected and expired are terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Admitted { at: WriteStamp },
    Placed { admitted: WriteStamp },
    Rejected { cause: String },
    Expired,
}

impl ClaimStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Rejected { .. } | ClaimStatus::Expired)
    }

    /// Admission stamp, when one has been assigned.
    pub fn admitted_at(&self) -> Option<&WriteStamp> {
        match self {
            ClaimStatus::Admitted { at } => Some(at),
            ClaimStatus::Placed { admitted } => Some(admitted),
            _ => None,
        }
    }
}

/// Immutable-at-submit claim header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMeta {
    pub tenant: TenantId,
    pub window: Window,
    pub priority: u8,
}

/// One operation against a claim record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum ClaimOp {
    Meta { meta: ClaimMeta },
    Profile(SetOp<ResourceProfile>),
    Status { status: ClaimStatus },
    Placement(MapOp<ProfileId, BTreeSet<ResourceId>>),
}

/// Composite record for one claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    meta: LwwRegister<ClaimMeta>,
    profiles: OrSet<ResourceProfile>,
    status: LwwRegister<ClaimStatus>,
    placements: LwwMap<ProfileId, BTreeSet<ResourceId>>,
}

impl Claim {
    /// Deterministic empty record; see `Resource::placeholder`.
    pub fn placeholder() -> Self {
        let zero = Stamp::new(WriteStamp::ZERO, PeerId::sentinel());
        Self {
            meta: LwwRegister::new(
                ClaimMeta {
                    tenant: TenantId::maintenance(),
                    window: Window::new(0, 0),
                    priority: 0,
                },
                zero.clone(),
            ),
            profiles: OrSet::new(),
            status: LwwRegister::new(ClaimStatus::Pending, zero),
            placements: LwwMap::new(),
        }
    }

    pub fn apply(&mut self, op: ClaimOp, stamp: Stamp) {
        match op {
            ClaimOp::Meta { meta } => {
                self.meta.set(meta, stamp);
            }
            ClaimOp::Profile(op) => self.profiles.apply(op, stamp),
            ClaimOp::Status { status } => {
                self.status.set(status, stamp);
            }
            ClaimOp::Placement(op) => self.placements.apply(op, stamp),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.meta.stamp().at == WriteStamp::ZERO
    }

    /// Stamp of the submit; tombstone resolution compares against this.
    pub fn meta_stamp(&self) -> &Stamp {
        self.meta.stamp()
    }

    pub fn tenant(&self) -> &TenantId {
        &self.meta.get().tenant
    }

    pub fn window(&self) -> Window {
        self.meta.get().window
    }

    pub fn priority(&self) -> u8 {
        self.meta.get().priority
    }

    /// Maintenance events block placement but consume no tenant share.
    pub fn is_maintenance(&self) -> bool {
        self.tenant().is_maintenance()
    }

    pub fn status(&self) -> &ClaimStatus {
        self.status.get()
    }

    pub fn status_stamp(&self) -> &Stamp {
        self.status.stamp()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &ResourceProfile> {
        self.profiles.iter()
    }

    pub fn profile_set(&self) -> &OrSet<ResourceProfile> {
        &self.profiles
    }

    pub fn placements(&self) -> &LwwMap<ProfileId, BTreeSet<ResourceId>> {
        &self.placements
    }

    /// All resources this claim is placed on.
    pub fn placed_resources(&self) -> BTreeSet<ResourceId> {
        self.placements
            .iter()
            .flat_map(|(_, set)| set.iter().cloned())
            .collect()
    }

    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, ClaimOp)> {
        let mut ops = Vec::new();
        if let Some((stamp, meta)) = self.meta.delta(since) {
            ops.push((stamp, ClaimOp::Meta { meta }));
        }
        for (stamp, op) in self.profiles.delta(since) {
            ops.push((stamp, ClaimOp::Profile(op)));
        }
        if let Some((stamp, status)) = self.status.delta(since) {
            ops.push((stamp, ClaimOp::Status { status }));
        }
        for (stamp, op) in self.placements.delta(since) {
            ops.push((stamp, ClaimOp::Placement(op)));
        }
        ops
    }
}

impl Crdt for Claim {
    fn merge(&mut self, other: &Self) {
        self.meta.merge(&other.meta);
        self.profiles.merge(&other.profiles);
        self.status.merge(&other.status);
        self.placements.merge(&other.placements);
    }

    fn high_water(&self) -> WriteStamp {
        self.meta
            .high_water()
            .max(self.profiles.high_water())
            .max(self.status.high_water())
            .max(self.placements.high_water())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(wall: u64, peer: &str) -> Stamp {
        Stamp::new(WriteStamp::new(wall, 0), PeerId::new(peer).unwrap())
    }

    #[test]
    fn window_overlap() {
        let a = Window::new(0, 100);
        let b = Window::new(100, 200);
        let c = Window::new(50, 150);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert_eq!(a.overlap_ms(&c), 50);
        assert_eq!(a.overlap_ms(&b), 0);
    }

    #[test]
    fn profile_effective_window_clamps_to_claim() {
        let claim = Window::new(1_000, 5_000);
        let profile = ResourceProfile {
            id: ProfileId::generate(),
            kind: ResourceKind::Compute,
            quantity: 1,
            required: BTreeMap::new(),
            preferred: BTreeMap::new(),
            duration_ms: Some(1_500),
        };
        assert_eq!(profile.effective_window(&claim), Window::new(1_000, 2_500));

        let unbounded = ResourceProfile {
            duration_ms: None,
            ..profile
        };
        assert_eq!(unbounded.effective_window(&claim), claim);
    }

    #[test]
    fn status_terminality() {
        assert!(!ClaimStatus::Pending.is_terminal());
        assert!(
            !ClaimStatus::Admitted {
                at: WriteStamp::new(1, 0)
            }
            .is_terminal()
        );
        assert!(
            ClaimStatus::Rejected {
                cause: "no capacity".into()
            }
            .is_terminal()
        );
        assert!(ClaimStatus::Expired.is_terminal());
    }

    #[test]
    fn concurrent_status_writes_resolve_by_stamp() {
        let mut claim = Claim::placeholder();
        claim.apply(
            ClaimOp::Meta {
                meta: ClaimMeta {
                    tenant: TenantId::new("acme").unwrap(),
                    window: Window::new(0, 100),
                    priority: 1,
                },
            },
            stamp(1, "p1"),
        );

        let mut other = claim.clone();
        other.apply(
            ClaimOp::Status {
                status: ClaimStatus::Admitted {
                    at: WriteStamp::new(5, 0),
                },
            },
            stamp(5, "p2"),
        );
        claim.apply(
            ClaimOp::Status {
                status: ClaimStatus::Rejected {
                    cause: "quota".into(),
                },
            },
            stamp(6, "p1"),
        );

        claim.merge(&other);
        assert!(matches!(claim.status(), ClaimStatus::Rejected { .. }));
    }

    #[test]
    fn placed_resources_collects_across_profiles() {
        let mut claim = Claim::placeholder();
        let p1 = ProfileId::generate();
        let p2 = ProfileId::generate();
        let mut set1 = BTreeSet::new();
        set1.insert(ResourceId::new("r1").unwrap());
        let mut set2 = BTreeSet::new();
        set2.insert(ResourceId::new("r2").unwrap());
        claim.apply(
            ClaimOp::Placement(MapOp::Set {
                key: p1,
                value: set1,
            }),
            stamp(1, "p1"),
        );
        claim.apply(
            ClaimOp::Placement(MapOp::Set {
                key: p2,
                value: set2,
            }),
            stamp(2, "p1"),
        );
        assert_eq!(claim.placed_resources().len(), 2);
    }
}
