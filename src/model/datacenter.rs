//! Datacenters: physical layout as ordered rows of ordered racks.
//!
//! Order is meaningful (it mirrors the floor plan), so rows, racks and
//! rack slots are fractionally indexed sequences. Racks hold resource
//! ids, never resources; the flat resource map owns the records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::identity::{PeerId, ResourceId};
use crate::core::time::{Stamp, WriteStamp};
use crate::crdt::{Crdt, FracIndex, IndexedSeq, LwwMap, LwwRegister, MapOp, SeqKey, SeqOp};

/// Internal identity of one row; layout position comes from the
/// sequence, not the id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

/// Internal identity of one rack.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RackId(String);

impl RackId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RackId({})", self.0)
    }
}

/// One operation against a datacenter record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum DatacenterOp {
    Name { name: String },
    Location(MapOp<String, String>),
    RowInsert { pos: FracIndex, row: RowId },
    RowDelete { key: SeqKey },
    RackInsert { row: RowId, pos: FracIndex, rack: RackId },
    RackDelete { row: RowId, key: SeqKey },
    SlotInsert { rack: RackId, pos: FracIndex, resource: ResourceId },
    SlotDelete { rack: RackId, key: SeqKey },
}

/// Composite record for one datacenter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datacenter {
    name: LwwRegister<String>,
    location: LwwMap<String, String>,
    rows: IndexedSeq<RowId>,
    racks: BTreeMap<RowId, IndexedSeq<RackId>>,
    slots: BTreeMap<RackId, IndexedSeq<ResourceId>>,
}

impl Datacenter {
    /// Deterministic empty record; see `Resource::placeholder`.
    pub fn placeholder() -> Self {
        let zero = Stamp::new(WriteStamp::ZERO, PeerId::sentinel());
        Self {
            name: LwwRegister::new(String::new(), zero),
            location: LwwMap::new(),
            rows: IndexedSeq::new(),
            racks: BTreeMap::new(),
            slots: BTreeMap::new(),
        }
    }

    pub fn apply(&mut self, op: DatacenterOp, stamp: Stamp) {
        match op {
            DatacenterOp::Name { name } => {
                self.name.set(name, stamp);
            }
            DatacenterOp::Location(op) => self.location.apply(op, stamp),
            DatacenterOp::RowInsert { pos, row } => {
                self.rows.apply(SeqOp::Insert { pos, value: row }, stamp);
            }
            DatacenterOp::RowDelete { key } => {
                self.rows.apply(SeqOp::Delete { key }, stamp);
            }
            DatacenterOp::RackInsert { row, pos, rack } => {
                self.racks
                    .entry(row)
                    .or_default()
                    .apply(SeqOp::Insert { pos, value: rack }, stamp);
            }
            DatacenterOp::RackDelete { row, key } => {
                self.racks
                    .entry(row)
                    .or_default()
                    .apply(SeqOp::Delete { key }, stamp);
            }
            DatacenterOp::SlotInsert {
                rack,
                pos,
                resource,
            } => {
                self.slots
                    .entry(rack)
                    .or_default()
                    .apply(SeqOp::Insert { pos, value: resource }, stamp);
            }
            DatacenterOp::SlotDelete { rack, key } => {
                self.slots
                    .entry(rack)
                    .or_default()
                    .apply(SeqOp::Delete { key }, stamp);
            }
        }
    }

    pub fn name(&self) -> &str {
        self.name.get()
    }

    pub fn location(&self) -> &LwwMap<String, String> {
        &self.location
    }

    pub fn rows(&self) -> &IndexedSeq<RowId> {
        &self.rows
    }

    pub fn row_at(&self, index: usize) -> Option<&RowId> {
        self.rows.values().nth(index)
    }

    pub fn racks_of(&self, row: &RowId) -> Option<&IndexedSeq<RackId>> {
        self.racks.get(row)
    }

    pub fn rack_at(&self, row: &RowId, index: usize) -> Option<&RackId> {
        self.racks.get(row)?.values().nth(index)
    }

    pub fn slots_of(&self, rack: &RackId) -> Option<&IndexedSeq<ResourceId>> {
        self.slots.get(rack)
    }

    /// Resources in one rack, in slot order.
    pub fn rack_resources(&self, rack: &RackId) -> Vec<ResourceId> {
        self.slots
            .get(rack)
            .map(|seq| seq.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delta(&self, since: &WriteStamp) -> Vec<(Stamp, DatacenterOp)> {
        let mut ops = Vec::new();
        if let Some((stamp, name)) = self.name.delta(since) {
            ops.push((stamp, DatacenterOp::Name { name }));
        }
        for (stamp, op) in self.location.delta(since) {
            ops.push((stamp, DatacenterOp::Location(op)));
        }
        for (stamp, op) in self.rows.delta(since) {
            ops.push((
                stamp,
                match op {
                    SeqOp::Insert { pos, value } => DatacenterOp::RowInsert { pos, row: value },
                    SeqOp::Delete { key } => DatacenterOp::RowDelete { key },
                },
            ));
        }
        for (row, racks) in &self.racks {
            for (stamp, op) in racks.delta(since) {
                ops.push((
                    stamp,
                    match op {
                        SeqOp::Insert { pos, value } => DatacenterOp::RackInsert {
                            row: row.clone(),
                            pos,
                            rack: value,
                        },
                        SeqOp::Delete { key } => DatacenterOp::RackDelete {
                            row: row.clone(),
                            key,
                        },
                    },
                ));
            }
        }
        for (rack, slots) in &self.slots {
            for (stamp, op) in slots.delta(since) {
                ops.push((
                    stamp,
                    match op {
                        SeqOp::Insert { pos, value } => DatacenterOp::SlotInsert {
                            rack: rack.clone(),
                            pos,
                            resource: value,
                        },
                        SeqOp::Delete { key } => DatacenterOp::SlotDelete {
                            rack: rack.clone(),
                            key,
                        },
                    },
                ));
            }
        }
        ops
    }
}

impl Crdt for Datacenter {
    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
        self.location.merge(&other.location);
        self.rows.merge(&other.rows);
        for (row, racks) in &other.racks {
            self.racks.entry(row.clone()).or_default().merge(racks);
        }
        for (rack, slots) in &other.slots {
            self.slots.entry(rack.clone()).or_default().merge(slots);
        }
    }

    fn high_water(&self) -> WriteStamp {
        let mut max = self
            .name
            .high_water()
            .max(self.location.high_water())
            .max(self.rows.high_water());
        for racks in self.racks.values() {
            max = max.max(racks.high_water());
        }
        for slots in self.slots.values() {
            max = max.max(slots.high_water());
        }
        max
    }
}
