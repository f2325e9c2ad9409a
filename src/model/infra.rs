//! The merged logical infrastructure.
//!
//! One flat id-keyed map per entity type; racks, groups and placements
//! reference resources by id only, so no aggregate owns a resource and
//! lifetime is governed by tombstones.
//!
//! Typed operations are local read-then-write: read the materialized
//! view, check preconditions, stamp and apply ops. Validation is
//! best-effort; concurrent conflicting writes resolve deterministically
//! by stamp on merge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::clock::Clock;
use crate::core::error::CoreError;
use crate::core::identity::{ClaimId, DatacenterId, GroupId, ProfileId, ResourceId};
use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, FracIndex, MapOp, SetOp, Tag};
use crate::model::claim::{Claim, ClaimMeta, ClaimOp, ClaimStatus, ResourceProfile};
use crate::model::datacenter::{Datacenter, DatacenterOp, RackId, RowId};
use crate::model::group::{GroupOp, LogicalGroup};
use crate::model::op::{Op, OpBody};
use crate::model::resource::{Capacity, Resource, ResourceKind, ResourceMeta, ResourceOp, ResourceState};

/// Entire replicated state of one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Infrastructure {
    resources: BTreeMap<ResourceId, Resource>,
    resource_tombs: BTreeMap<ResourceId, Stamp>,
    datacenters: BTreeMap<DatacenterId, Datacenter>,
    groups: BTreeMap<GroupId, LogicalGroup>,
    claims: BTreeMap<ClaimId, Claim>,
    claim_tombs: BTreeMap<ClaimId, Stamp>,
}

impl Infrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- materialized views ------------------------------------------------

    /// A live resource: created, not tombstoned since its last create.
    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        let resource = self.resources.get(id)?;
        if resource.is_placeholder() {
            return None;
        }
        match self.resource_tombs.get(id) {
            Some(dead) if *dead > *resource.meta_stamp() => None,
            _ => Some(resource),
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = (&ResourceId, &Resource)> {
        self.resources
            .keys()
            .filter_map(|id| self.resource(id).map(|resource| (id, resource)))
    }

    pub fn datacenter(&self, id: &DatacenterId) -> Option<&Datacenter> {
        self.datacenters.get(id)
    }

    pub fn datacenters(&self) -> impl Iterator<Item = (&DatacenterId, &Datacenter)> {
        self.datacenters.iter()
    }

    pub fn group(&self, id: &GroupId) -> Option<&LogicalGroup> {
        self.groups.get(id)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&GroupId, &LogicalGroup)> {
        self.groups.iter()
    }

    pub fn claim(&self, id: &ClaimId) -> Option<&Claim> {
        let claim = self.claims.get(id)?;
        if claim.is_placeholder() {
            return None;
        }
        match self.claim_tombs.get(id) {
            Some(dead) if *dead > *claim.meta_stamp() => None,
            _ => Some(claim),
        }
    }

    pub fn claims(&self) -> impl Iterator<Item = (&ClaimId, &Claim)> {
        self.claims
            .keys()
            .filter_map(|id| self.claim(id).map(|claim| (id, claim)))
    }

    // ---- typed operations --------------------------------------------------

    /// Create or replace a resource.
    pub fn upsert_resource(
        &mut self,
        clock: &Clock,
        id: &ResourceId,
        kind: ResourceKind,
        capacity: Capacity,
        attrs: BTreeMap<String, String>,
    ) -> Result<Vec<Op>, CoreError> {
        capacity.validate_shape(kind)?;
        let mut ops = vec![self.commit(
            clock,
            OpBody::Resource {
                id: id.clone(),
                op: ResourceOp::Meta {
                    meta: ResourceMeta { kind, capacity },
                },
            },
        )];
        for (key, value) in attrs {
            ops.push(self.commit(
                clock,
                OpBody::Resource {
                    id: id.clone(),
                    op: ResourceOp::Attr(MapOp::Set { key, value }),
                },
            ));
        }
        Ok(ops)
    }

    /// Change a resource's scheduling availability.
    pub fn set_resource_state(
        &mut self,
        clock: &Clock,
        id: &ResourceId,
        state: ResourceState,
    ) -> Result<Op, CoreError> {
        if self.resource(id).is_none() {
            return Err(CoreError::UnknownEntity {
                entity: "resource",
                id: id.to_string(),
            });
        }
        Ok(self.commit(
            clock,
            OpBody::Resource {
                id: id.clone(),
                op: ResourceOp::State { state },
            },
        ))
    }

    /// Tombstone a resource.
    pub fn remove_resource(&mut self, clock: &Clock, id: &ResourceId) -> Result<Op, CoreError> {
        if self.resource(id).is_none() {
            return Err(CoreError::UnknownEntity {
                entity: "resource",
                id: id.to_string(),
            });
        }
        Ok(self.commit(clock, OpBody::ResourceRemove { id: id.clone() }))
    }

    pub fn create_datacenter(
        &mut self,
        clock: &Clock,
        id: &DatacenterId,
        name: &str,
        location: BTreeMap<String, String>,
    ) -> Result<Vec<Op>, CoreError> {
        let mut ops = vec![self.commit(
            clock,
            OpBody::Datacenter {
                id: id.clone(),
                op: DatacenterOp::Name {
                    name: name.to_string(),
                },
            },
        )];
        for (key, value) in location {
            ops.push(self.commit(
                clock,
                OpBody::Datacenter {
                    id: id.clone(),
                    op: DatacenterOp::Location(MapOp::Set { key, value }),
                },
            ));
        }
        Ok(ops)
    }

    /// Insert a resource into a rack at a requested position.
    ///
    /// Rows and racks up to the requested indexes are created on demand;
    /// when the position hint is taken, the insert lands at the mediant
    /// to the right.
    pub fn attach_to_rack(
        &mut self,
        clock: &Clock,
        resource_id: &ResourceId,
        datacenter_id: &DatacenterId,
        row_idx: usize,
        rack_idx: usize,
        position_hint: Option<FracIndex>,
    ) -> Result<Vec<Op>, CoreError> {
        if self.resource(resource_id).is_none() {
            return Err(CoreError::UnknownEntity {
                entity: "resource",
                id: resource_id.to_string(),
            });
        }
        if !self.datacenters.contains_key(datacenter_id) {
            return Err(CoreError::UnknownEntity {
                entity: "datacenter",
                id: datacenter_id.to_string(),
            });
        }

        let mut ops = Vec::new();

        let row = loop {
            let dc = self.datacenters.get(datacenter_id).ok_or_else(|| {
                CoreError::UnknownEntity {
                    entity: "datacenter",
                    id: datacenter_id.to_string(),
                }
            })?;
            if let Some(row) = dc.row_at(row_idx) {
                break row.clone();
            }
            let pos = dc.rows().tail_position().ok_or_else(depth_exhausted)?;
            ops.push(self.commit(
                clock,
                OpBody::Datacenter {
                    id: datacenter_id.clone(),
                    op: DatacenterOp::RowInsert {
                        pos,
                        row: RowId::generate(),
                    },
                },
            ));
        };

        let rack = loop {
            let dc = self.datacenters.get(datacenter_id).ok_or_else(|| {
                CoreError::UnknownEntity {
                    entity: "datacenter",
                    id: datacenter_id.to_string(),
                }
            })?;
            if let Some(rack) = dc.rack_at(&row, rack_idx) {
                break rack.clone();
            }
            let pos = dc
                .racks_of(&row)
                .map(|seq| seq.tail_position())
                .unwrap_or(Some(FracIndex::first()))
                .ok_or_else(depth_exhausted)?;
            ops.push(self.commit(
                clock,
                OpBody::Datacenter {
                    id: datacenter_id.clone(),
                    op: DatacenterOp::RackInsert {
                        row: row.clone(),
                        pos,
                        rack: RackId::generate(),
                    },
                },
            ));
        };

        let slots = self
            .datacenters
            .get(datacenter_id)
            .and_then(|dc| dc.slots_of(&rack));
        let pos = match position_hint {
            Some(hint) => slots
                .map(|seq| seq.resolve_hint(hint))
                .unwrap_or(Some(hint))
                .ok_or_else(depth_exhausted)?,
            None => slots
                .map(|seq| seq.tail_position())
                .unwrap_or(Some(FracIndex::first()))
                .ok_or_else(depth_exhausted)?,
        };
        ops.push(self.commit(
            clock,
            OpBody::Datacenter {
                id: datacenter_id.clone(),
                op: DatacenterOp::SlotInsert {
                    rack,
                    pos,
                    resource: resource_id.clone(),
                },
            },
        ));
        Ok(ops)
    }

    pub fn create_logical_group(
        &mut self,
        clock: &Clock,
        id: &GroupId,
        name: &str,
    ) -> Result<Op, CoreError> {
        Ok(self.commit(
            clock,
            OpBody::Group {
                id: id.clone(),
                op: GroupOp::Name {
                    name: name.to_string(),
                },
            },
        ))
    }

    /// Point a logical slot at a resource.
    pub fn assign_group_slot(
        &mut self,
        clock: &Clock,
        group_id: &GroupId,
        slot: &str,
        resource_id: &ResourceId,
    ) -> Result<Op, CoreError> {
        if self.resource(resource_id).is_none() {
            return Err(CoreError::UnknownEntity {
                entity: "resource",
                id: resource_id.to_string(),
            });
        }
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| CoreError::UnknownEntity {
                entity: "group",
                id: group_id.to_string(),
            })?;
        let op = group.assign_op(slot.to_string(), resource_id.clone());
        Ok(self.commit(
            clock,
            OpBody::Group {
                id: group_id.clone(),
                op,
            },
        ))
    }

    /// Submit a claim for scheduling.
    pub fn submit_claim(
        &mut self,
        clock: &Clock,
        id: &ClaimId,
        meta: ClaimMeta,
        profiles: Vec<ResourceProfile>,
    ) -> Result<Vec<Op>, CoreError> {
        if meta.window.end_ms <= meta.window.start_ms {
            return Err(CoreError::Validation {
                reason: "claim window must end after it starts".to_string(),
            });
        }
        if profiles.is_empty() && !meta.tenant.is_maintenance() {
            return Err(CoreError::Validation {
                reason: "claim must request at least one profile".to_string(),
            });
        }
        if profiles.iter().any(|p| p.quantity == 0) {
            return Err(CoreError::Validation {
                reason: "profile quantity must be at least 1".to_string(),
            });
        }

        let mut ops = vec![self.commit(
            clock,
            OpBody::Claim {
                id: id.clone(),
                op: ClaimOp::Meta { meta },
            },
        )];
        for profile in profiles {
            ops.push(self.commit(
                clock,
                OpBody::Claim {
                    id: id.clone(),
                    op: ClaimOp::Profile(SetOp::Add {
                        value: profile,
                        tag: Tag::generate(),
                    }),
                },
            ));
        }
        Ok(ops)
    }

    /// Withdraw a claim entirely.
    pub fn withdraw_claim(&mut self, clock: &Clock, id: &ClaimId) -> Result<Op, CoreError> {
        if self.claim(id).is_none() {
            return Err(CoreError::UnknownEntity {
                entity: "claim",
                id: id.to_string(),
            });
        }
        Ok(self.commit(clock, OpBody::ClaimRemove { id: id.clone() }))
    }

    /// Scheduler-internal status transition.
    pub(crate) fn set_claim_status(
        &mut self,
        clock: &Clock,
        id: &ClaimId,
        status: ClaimStatus,
    ) -> Op {
        self.commit(
            clock,
            OpBody::Claim {
                id: id.clone(),
                op: ClaimOp::Status { status },
            },
        )
    }

    /// Scheduler-internal placement write.
    pub(crate) fn set_placement(
        &mut self,
        clock: &Clock,
        id: &ClaimId,
        profile: &ProfileId,
        resources: std::collections::BTreeSet<ResourceId>,
    ) -> Op {
        self.commit(
            clock,
            OpBody::Claim {
                id: id.clone(),
                op: ClaimOp::Placement(MapOp::Set {
                    key: profile.clone(),
                    value: resources,
                }),
            },
        )
    }

    /// Scheduler-internal placement retraction.
    pub(crate) fn clear_placements(&mut self, clock: &Clock, id: &ClaimId) -> Vec<Op> {
        let keys: Vec<ProfileId> = self
            .claims
            .get(id)
            .map(|claim| claim.placements().iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default();
        keys.into_iter()
            .map(|profile| {
                self.commit(
                    clock,
                    OpBody::Claim {
                        id: id.clone(),
                        op: ClaimOp::Placement(MapOp::Remove { key: profile }),
                    },
                )
            })
            .collect()
    }

    fn commit(&mut self, clock: &Clock, body: OpBody) -> Op {
        let op = Op::new(clock.tick(), body);
        self.apply(&op);
        op
    }

    // ---- CRDT surface ------------------------------------------------------

    /// Apply one stamped op. Idempotent; order-insensitive across
    /// origins.
    pub fn apply(&mut self, op: &Op) {
        let stamp = op.stamp.clone();
        match &op.body {
            OpBody::Resource { id, op } => {
                self.resources
                    .entry(id.clone())
                    .or_insert_with(Resource::placeholder)
                    .apply(op.clone(), stamp);
            }
            OpBody::ResourceRemove { id } => {
                tombstone(&mut self.resource_tombs, id.clone(), stamp);
            }
            OpBody::Datacenter { id, op } => {
                self.datacenters
                    .entry(id.clone())
                    .or_insert_with(Datacenter::placeholder)
                    .apply(op.clone(), stamp);
            }
            OpBody::Group { id, op } => {
                self.groups
                    .entry(id.clone())
                    .or_insert_with(LogicalGroup::placeholder)
                    .apply(op.clone(), stamp);
            }
            OpBody::Claim { id, op } => {
                self.claims
                    .entry(id.clone())
                    .or_insert_with(Claim::placeholder)
                    .apply(op.clone(), stamp);
            }
            OpBody::ClaimRemove { id } => {
                tombstone(&mut self.claim_tombs, id.clone(), stamp);
            }
        }
    }

    /// All ops stamped after `since`, ordered by stamp (which keeps
    /// each origin's ops monotone).
    pub fn delta(&self, since: &WriteStamp) -> Vec<Op> {
        let mut ops = Vec::new();
        for (id, resource) in &self.resources {
            for (stamp, op) in resource.delta(since) {
                ops.push(Op::new(
                    stamp,
                    OpBody::Resource {
                        id: id.clone(),
                        op,
                    },
                ));
            }
        }
        for (id, stamp) in &self.resource_tombs {
            if stamp.at > *since {
                ops.push(Op::new(
                    stamp.clone(),
                    OpBody::ResourceRemove { id: id.clone() },
                ));
            }
        }
        for (id, dc) in &self.datacenters {
            for (stamp, op) in dc.delta(since) {
                ops.push(Op::new(
                    stamp,
                    OpBody::Datacenter {
                        id: id.clone(),
                        op,
                    },
                ));
            }
        }
        for (id, group) in &self.groups {
            for (stamp, op) in group.delta(since) {
                ops.push(Op::new(
                    stamp,
                    OpBody::Group {
                        id: id.clone(),
                        op,
                    },
                ));
            }
        }
        for (id, claim) in &self.claims {
            for (stamp, op) in claim.delta(since) {
                ops.push(Op::new(
                    stamp,
                    OpBody::Claim {
                        id: id.clone(),
                        op,
                    },
                ));
            }
        }
        for (id, stamp) in &self.claim_tombs {
            if stamp.at > *since {
                ops.push(Op::new(stamp.clone(), OpBody::ClaimRemove { id: id.clone() }));
            }
        }
        ops.sort_by(|a, b| a.stamp.cmp(&b.stamp));
        ops
    }
}

fn tombstone<K: Ord>(tombs: &mut BTreeMap<K, Stamp>, key: K, stamp: Stamp) {
    match tombs.get_mut(&key) {
        Some(existing) => {
            if stamp > *existing {
                *existing = stamp;
            }
        }
        None => {
            tombs.insert(key, stamp);
        }
    }
}

fn depth_exhausted() -> CoreError {
    CoreError::Validation {
        reason: "fractional position depth exhausted at this gap".to_string(),
    }
}

impl Crdt for Infrastructure {
    fn merge(&mut self, other: &Self) {
        for (id, resource) in &other.resources {
            match self.resources.get_mut(id) {
                Some(local) => local.merge(resource),
                None => {
                    self.resources.insert(id.clone(), resource.clone());
                }
            }
        }
        for (id, stamp) in &other.resource_tombs {
            tombstone(&mut self.resource_tombs, id.clone(), stamp.clone());
        }
        for (id, dc) in &other.datacenters {
            match self.datacenters.get_mut(id) {
                Some(local) => local.merge(dc),
                None => {
                    self.datacenters.insert(id.clone(), dc.clone());
                }
            }
        }
        for (id, group) in &other.groups {
            match self.groups.get_mut(id) {
                Some(local) => local.merge(group),
                None => {
                    self.groups.insert(id.clone(), group.clone());
                }
            }
        }
        for (id, claim) in &other.claims {
            match self.claims.get_mut(id) {
                Some(local) => local.merge(claim),
                None => {
                    self.claims.insert(id.clone(), claim.clone());
                }
            }
        }
        for (id, stamp) in &other.claim_tombs {
            tombstone(&mut self.claim_tombs, id.clone(), stamp.clone());
        }
    }

    fn high_water(&self) -> WriteStamp {
        let mut max = WriteStamp::ZERO;
        for resource in self.resources.values() {
            max = max.max(resource.high_water());
        }
        for stamp in self.resource_tombs.values() {
            max = max.max(stamp.at);
        }
        for dc in self.datacenters.values() {
            max = max.max(dc.high_water());
        }
        for group in self.groups.values() {
            max = max.max(group.high_water());
        }
        for claim in self.claims.values() {
            max = max.max(claim.high_water());
        }
        for stamp in self.claim_tombs.values() {
            max = max.max(stamp.at);
        }
        max
    }
}
