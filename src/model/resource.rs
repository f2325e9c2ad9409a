//! Resources: the unit of inventory.
//!
//! A resource is one schedulable slice of compute, network or storage
//! capacity, published by a provider adapter and referenced by id from
//! racks, groups and placements.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::CoreError;
use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, LwwMap, LwwRegister, MapOp};

/// The three dimensions of inventory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Compute,
    Network,
    Storage,
}

impl ResourceKind {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw {
            "compute" => Ok(ResourceKind::Compute),
            "network" => Ok(ResourceKind::Network),
            "storage" => Ok(ResourceKind::Storage),
            _ => Err(CoreError::InvalidKind {
                raw: raw.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Compute => "compute",
            ResourceKind::Network => "network",
            ResourceKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-dimension capacity vector.
///
/// Accelerators and other boolean traits live in attributes; the vector
/// carries only divisible quantities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Capacity {
    pub cpu: u64,
    pub memory_gb: u64,
    pub bandwidth_gbps: u64,
    pub iops: u64,
    pub storage_tb: u64,
}

/// Names of the capacity dimensions, in vector order.
pub const CAPACITY_DIMENSIONS: [&str; 5] = ["cpu", "memory_gb", "bandwidth_gbps", "iops", "storage_tb"];

impl Capacity {
    pub fn dims(&self) -> [u64; 5] {
        [
            self.cpu,
            self.memory_gb,
            self.bandwidth_gbps,
            self.iops,
            self.storage_tb,
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.dims().iter().all(|d| *d == 0)
    }

    pub fn saturating_add(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu: self.cpu.saturating_add(other.cpu),
            memory_gb: self.memory_gb.saturating_add(other.memory_gb),
            bandwidth_gbps: self.bandwidth_gbps.saturating_add(other.bandwidth_gbps),
            iops: self.iops.saturating_add(other.iops),
            storage_tb: self.storage_tb.saturating_add(other.storage_tb),
        }
    }

    /// Per-kind schema check: the dimensions a kind is measured in must
    /// be present.
    pub fn validate_shape(&self, kind: ResourceKind) -> Result<(), CoreError> {
        let missing = match kind {
            ResourceKind::Compute if self.cpu == 0 => Some("cpu"),
            ResourceKind::Compute if self.memory_gb == 0 => Some("memory_gb"),
            ResourceKind::Network if self.bandwidth_gbps == 0 => Some("bandwidth_gbps"),
            ResourceKind::Storage if self.storage_tb == 0 => Some("storage_tb"),
            ResourceKind::Storage if self.iops == 0 => Some("iops"),
            _ => None,
        };
        match missing {
            Some(missing) => Err(CoreError::CapacityShape {
                kind: kind.as_str(),
                missing,
            }),
            None => Ok(()),
        }
    }
}

/// Scheduling availability of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Active,
    Draining,
    Offline,
}

/// Kind and capacity move together; a provider republishing a resource
/// replaces both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub kind: ResourceKind,
    pub capacity: Capacity,
}

/// One operation against a resource record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum ResourceOp {
    Meta { meta: ResourceMeta },
    Attr(MapOp<String, String>),
    State { state: ResourceState },
}

/// Composite record for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    meta: LwwRegister<ResourceMeta>,
    attrs: LwwMap<String, String>,
    state: LwwRegister<ResourceState>,
}

impl Resource {
    /// Deterministic empty record, used when an op arrives for a
    /// resource whose create has not been observed yet. Every field
    /// starts at the zero stamp so any real write wins.
    pub fn placeholder() -> Self {
        let zero = Stamp::new(WriteStamp::ZERO, crate::core::identity::PeerId::sentinel());
        Self {
            meta: LwwRegister::new(
                ResourceMeta {
                    kind: ResourceKind::Compute,
                    capacity: Capacity::default(),
                },
                zero.clone(),
            ),
            attrs: LwwMap::new(),
            state: LwwRegister::new(ResourceState::Active, zero),
        }
    }

    pub fn create(meta: ResourceMeta, stamp: Stamp) -> Self {
        let mut resource = Self::placeholder();
        resource.apply(ResourceOp::Meta { meta }, stamp);
        resource
    }

    /// True until a meta write lands; placeholders never schedule.
    pub fn is_placeholder(&self) -> bool {
        self.meta.stamp().at == WriteStamp::ZERO
    }

    pub fn apply(&mut self, op: ResourceOp, stamp: Stamp) {
        match op {
            ResourceOp::Meta { meta } => {
                self.meta.set(meta, stamp);
            }
            ResourceOp::Attr(op) => self.attrs.apply(op, stamp),
            ResourceOp::State { state } => {
                self.state.set(state, stamp);
            }
        }
    }

    /// Stamp of the last create/replace; tombstone resolution compares
    /// against this, so attribute churn alone never revives a deleted
    /// resource.
    pub fn meta_stamp(&self) -> &Stamp {
        self.meta.stamp()
    }

    pub fn kind(&self) -> ResourceKind {
        self.meta.get().kind
    }

    pub fn capacity(&self) -> &Capacity {
        &self.meta.get().capacity
    }

    pub fn state(&self) -> ResourceState {
        *self.state.get()
    }

    pub fn attrs(&self) -> &LwwMap<String, String> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(&key.to_string()).map(String::as_str)
    }

    /// Does this resource satisfy a profile's kind and required
    /// `key=value` attributes?
    pub fn matches(&self, kind: ResourceKind, required: &BTreeMap<String, String>) -> bool {
        self.kind() == kind
            && required
                .iter()
                .all(|(key, want)| self.attrs.get(key).is_some_and(|have| have == want))
    }

    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, ResourceOp)> {
        let mut ops = Vec::new();
        if let Some((stamp, meta)) = self.meta.delta(since) {
            ops.push((stamp, ResourceOp::Meta { meta }));
        }
        for (stamp, op) in self.attrs.delta(since) {
            ops.push((stamp, ResourceOp::Attr(op)));
        }
        if let Some((stamp, state)) = self.state.delta(since) {
            ops.push((stamp, ResourceOp::State { state }));
        }
        ops
    }
}

impl Crdt for Resource {
    fn merge(&mut self, other: &Self) {
        self.meta.merge(&other.meta);
        self.attrs.merge(&other.attrs);
        self.state.merge(&other.state);
    }

    fn high_water(&self) -> WriteStamp {
        self.meta
            .high_water()
            .max(self.attrs.high_water())
            .max(self.state.high_water())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::PeerId;

    fn stamp(wall: u64, peer: &str) -> Stamp {
        Stamp::new(WriteStamp::new(wall, 0), PeerId::new(peer).unwrap())
    }

    fn compute_meta() -> ResourceMeta {
        ResourceMeta {
            kind: ResourceKind::Compute,
            capacity: Capacity {
                cpu: 8,
                memory_gb: 32,
                ..Capacity::default()
            },
        }
    }

    #[test]
    fn shape_validation_per_kind() {
        let compute = Capacity {
            cpu: 8,
            memory_gb: 32,
            ..Capacity::default()
        };
        assert!(compute.validate_shape(ResourceKind::Compute).is_ok());
        assert!(compute.validate_shape(ResourceKind::Network).is_err());

        let network = Capacity {
            bandwidth_gbps: 100,
            ..Capacity::default()
        };
        assert!(network.validate_shape(ResourceKind::Network).is_ok());

        let storage = Capacity {
            iops: 50_000,
            storage_tb: 12,
            ..Capacity::default()
        };
        assert!(storage.validate_shape(ResourceKind::Storage).is_ok());
        assert!(
            Capacity {
                iops: 0,
                storage_tb: 12,
                ..Capacity::default()
            }
            .validate_shape(ResourceKind::Storage)
            .is_err()
        );
    }

    #[test]
    fn kind_parse_round_trip() {
        for raw in ["compute", "network", "storage"] {
            assert_eq!(ResourceKind::parse(raw).unwrap().as_str(), raw);
        }
        assert!(ResourceKind::parse("quantum").is_err());
    }

    #[test]
    fn matches_requires_kind_and_attrs() {
        let mut resource = Resource::create(compute_meta(), stamp(1, "p1"));
        resource.apply(
            ResourceOp::Attr(MapOp::Set {
                key: "zone".into(),
                value: "eu-1".into(),
            }),
            stamp(2, "p1"),
        );

        let mut required = BTreeMap::new();
        required.insert("zone".to_string(), "eu-1".to_string());
        assert!(resource.matches(ResourceKind::Compute, &required));

        required.insert("accelerator".to_string(), "true".to_string());
        assert!(!resource.matches(ResourceKind::Compute, &required));
        assert!(!resource.matches(ResourceKind::Storage, &BTreeMap::new()));
    }

    #[test]
    fn state_defaults_active_and_merges_lww() {
        let mut a = Resource::create(compute_meta(), stamp(1, "p1"));
        assert_eq!(a.state(), ResourceState::Active);

        let mut b = a.clone();
        b.apply(
            ResourceOp::State {
                state: ResourceState::Draining,
            },
            stamp(2, "p2"),
        );
        a.apply(
            ResourceOp::State {
                state: ResourceState::Offline,
            },
            stamp(3, "p1"),
        );

        a.merge(&b);
        assert_eq!(a.state(), ResourceState::Offline);
    }

    #[test]
    fn delta_replays_to_equal_record() {
        let mut resource = Resource::create(compute_meta(), stamp(1, "p1"));
        resource.apply(
            ResourceOp::Attr(MapOp::Set {
                key: "zone".into(),
                value: "eu-1".into(),
            }),
            stamp(2, "p1"),
        );
        resource.apply(
            ResourceOp::State {
                state: ResourceState::Draining,
            },
            stamp(3, "p1"),
        );

        let mut ops = resource.delta(&WriteStamp::ZERO);
        ops.sort_by(|(a, _), (b, _)| a.cmp(b));
        let (first_stamp, first_op) = ops.remove(0);
        let ResourceOp::Meta { meta } = first_op else {
            panic!("expected meta op first");
        };
        let mut replica = Resource::create(meta, first_stamp);
        for (stamp, op) in ops {
            replica.apply(op, stamp);
        }
        assert_eq!(replica, resource);
    }
}
