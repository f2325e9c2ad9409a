//! Provider adapter contract.
//!
//! Adapters pull inventory from their provider and get told when claims
//! land on their resources. The core treats each adapter as
//! authoritative for its slice: every push replaces the slice, and
//! resources missing from consecutive pushes get tombstoned after the
//! grace interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::core::clock::{Clock, now_ms};
use crate::core::identity::{ClaimId, DatacenterId, ProfileId, ResourceId};
use crate::error::Transience;
use crate::model::claim::ClaimStatus;
use crate::model::infra::Infrastructure;
use crate::model::op::Op;
use crate::model::resource::{Capacity, ResourceKind, ResourceState};

/// Attribute recording which adapter published a resource.
pub const ORIGIN_ATTR: &str = "origin";

#[derive(Debug, Error, Clone)]
pub enum ControllerError {
    #[error("adapter {adapter} pull failed: {reason}")]
    Pull { adapter: String, reason: String },
    #[error("adapter {adapter} rejected placement of {claim}: {reason}")]
    Hook {
        adapter: String,
        claim: ClaimId,
        reason: String,
    },
}

impl ControllerError {
    pub fn transience(&self) -> Transience {
        Transience::Retryable
    }
}

/// One resource as a provider reports it.
#[derive(Clone, Debug)]
pub struct InventoryResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub capacity: Capacity,
    pub attrs: BTreeMap<String, String>,
}

/// A provider's full slice for one datacenter.
#[derive(Clone, Debug)]
pub struct InventoryPush {
    pub datacenter: DatacenterId,
    pub resources: Vec<InventoryResource>,
}

/// The surface provider adapters implement. Adapters live in-process;
/// no wire format is mandated.
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// Cadence for [`Controller::pull`].
    fn pull_interval(&self) -> Duration;

    /// Fetch the provider's current inventory.
    fn pull(&self) -> Result<InventoryPush, ControllerError>;

    /// A claim using this adapter's resources entered placed. Errors
    /// revert the claim to admitted and cool the resources off.
    fn placement_hook(
        &self,
        claim: &ClaimId,
        placements: &BTreeMap<ProfileId, BTreeSet<ResourceId>>,
    ) -> Result<(), ControllerError>;
}

struct TrackedAdapter {
    adapter: Arc<dyn Controller>,
    /// Consecutive pushes each known resource has been absent from.
    misses: BTreeMap<ResourceId, u32>,
    next_pull: Instant,
}

struct RegistryState {
    adapters: Vec<TrackedAdapter>,
    /// Resources parked in draining until the cool-off passes.
    cooloff: BTreeMap<ResourceId, u64>,
}

/// Runs adapters on their cadence and applies their pushes to the
/// model.
pub struct ControllerRegistry {
    infra: Arc<RwLock<Infrastructure>>,
    clock: Arc<Clock>,
    publish: Arc<dyn Fn(&[Op]) + Send + Sync>,
    state: Mutex<RegistryState>,
    grace_interval: u32,
    cooloff: Duration,
}

impl ControllerRegistry {
    pub fn new(
        infra: Arc<RwLock<Infrastructure>>,
        clock: Arc<Clock>,
        publish: Arc<dyn Fn(&[Op]) + Send + Sync>,
        grace_interval: u32,
        cooloff: Duration,
    ) -> Self {
        Self {
            infra,
            clock,
            publish,
            state: Mutex::new(RegistryState {
                adapters: Vec::new(),
                cooloff: BTreeMap::new(),
            }),
            grace_interval: grace_interval.max(1),
            cooloff,
        }
    }

    pub fn register(&self, adapter: Arc<dyn Controller>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.adapters.push(TrackedAdapter {
            adapter,
            misses: BTreeMap::new(),
            next_pull: Instant::now(),
        });
    }

    /// Replace or merge one adapter's slice. Public so tests and
    /// push-style adapters can bypass the pull cadence.
    ///
    /// The state guard spans the whole push including publish, so this
    /// origin's ops reach the peer queues in stamp order.
    pub fn inventory_push(&self, adapter_name: &str, push: InventoryPush) {
        let mut ops = Vec::new();
        let present: BTreeSet<ResourceId> =
            push.resources.iter().map(|r| r.id.clone()).collect();

        let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
        for resource in push.resources {
            let mut attrs = resource.attrs;
            attrs.insert(ORIGIN_ATTR.to_string(), adapter_name.to_string());
            attrs.insert("datacenter".to_string(), push.datacenter.to_string());
            match infra.upsert_resource(
                &self.clock,
                &resource.id,
                resource.kind,
                resource.capacity,
                attrs,
            ) {
                Ok(mut upserted) => ops.append(&mut upserted),
                Err(err) => {
                    tracing::warn!(
                        adapter = adapter_name,
                        resource = %resource.id,
                        "inventory record rejected: {err}"
                    );
                }
            }
        }

        // Grace-interval absence tracking: a resource missing from this
        // many consecutive pushes is gone from the provider.
        let mut to_remove = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tracked) = state
                .adapters
                .iter_mut()
                .find(|t| t.adapter.name() == adapter_name)
            {
                for id in &present {
                    tracked.misses.insert(id.clone(), 0);
                }
                for (id, misses) in tracked.misses.iter_mut() {
                    if present.contains(id) {
                        continue;
                    }
                    *misses += 1;
                    if *misses >= self.grace_interval {
                        to_remove.push(id.clone());
                    }
                }
                for id in &to_remove {
                    tracked.misses.remove(id);
                }
            }
        }
        for id in to_remove {
            tracing::info!(adapter = adapter_name, resource = %id, "tombstoning resource absent past grace interval");
            if let Ok(op) = infra.remove_resource(&self.clock, &id) {
                ops.push(op);
            }
        }

        (self.publish)(&ops);
    }

    /// Fire the placement hook of the adapter owning each placed
    /// resource. A hook error reverts the claim to admitted and parks
    /// the resources in draining for the cool-off window.
    pub fn dispatch_placement(&self, claim_id: &ClaimId) {
        let (placements, owners) = {
            let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
            let Some(claim) = infra.claim(claim_id) else {
                return;
            };
            if !matches!(claim.status(), ClaimStatus::Placed { .. }) {
                return;
            }
            let placements: BTreeMap<ProfileId, BTreeSet<ResourceId>> = claim
                .placements()
                .iter()
                .map(|(profile, set)| (profile.clone(), set.clone()))
                .collect();
            let mut owners: BTreeMap<String, BTreeSet<ResourceId>> = BTreeMap::new();
            for resource_id in claim.placed_resources() {
                if let Some(resource) = infra.resource(&resource_id)
                    && let Some(origin) = resource.attr(ORIGIN_ATTR)
                {
                    owners
                        .entry(origin.to_string())
                        .or_default()
                        .insert(resource_id);
                }
            }
            (placements, owners)
        };

        let adapters: Vec<Arc<dyn Controller>> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .adapters
                .iter()
                .filter(|t| owners.contains_key(t.adapter.name()))
                .map(|t| Arc::clone(&t.adapter))
                .collect()
        };

        for adapter in adapters {
            if let Err(err) = adapter.placement_hook(claim_id, &placements) {
                tracing::warn!(claim = %claim_id, "placement hook failed: {err}");
                self.revert_placement(claim_id, &owners[adapter.name()]);
                return;
            }
        }
    }

    fn revert_placement(&self, claim_id: &ClaimId, offending: &BTreeSet<ResourceId>) {
        let mut ops = Vec::new();
        let until = now_ms() + self.cooloff.as_millis() as u64;
        {
            let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
            ops.extend(infra.clear_placements(&self.clock, claim_id));
            let admitted = infra
                .claim(claim_id)
                .and_then(|c| c.status().admitted_at().copied())
                .unwrap_or(crate::core::time::WriteStamp::ZERO);
            ops.push(infra.set_claim_status(
                &self.clock,
                claim_id,
                ClaimStatus::Admitted { at: admitted },
            ));
            for id in offending {
                if let Ok(op) = infra.set_resource_state(&self.clock, id, ResourceState::Draining) {
                    ops.push(op);
                }
            }
            (self.publish)(&ops);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for id in offending {
            state.cooloff.insert(id.clone(), until);
        }
    }

    /// One cadence step: run due pulls, lift expired cool-offs.
    pub fn run_due(&self, now: Instant) {
        let due: Vec<Arc<dyn Controller>> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut due = Vec::new();
            for tracked in state.adapters.iter_mut() {
                if tracked.next_pull <= now {
                    tracked.next_pull = now + tracked.adapter.pull_interval();
                    due.push(Arc::clone(&tracked.adapter));
                }
            }
            due
        };

        for adapter in due {
            match adapter.pull() {
                Ok(push) => self.inventory_push(adapter.name(), push),
                Err(err) => {
                    tracing::warn!(adapter = adapter.name(), "inventory pull failed: {err}");
                }
            }
        }

        self.lift_cooloffs();
    }

    fn lift_cooloffs(&self) {
        let now = now_ms();
        let expired: Vec<ResourceId> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<ResourceId> = state
                .cooloff
                .iter()
                .filter(|(_, until)| **until <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.cooloff.remove(id);
            }
            expired
        };
        if expired.is_empty() {
            return;
        }
        let mut ops = Vec::new();
        let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
        for id in expired {
            if let Ok(op) = infra.set_resource_state(&self.clock, &id, ResourceState::Active) {
                ops.push(op);
            }
        }
        (self.publish)(&ops);
    }

    /// Background pull loop; granularity is one second.
    pub fn start(self: Arc<Self>) -> ControllerHandle {
        let (stop_tx, stop_rx) = crossbeam::channel::bounded::<()>(1);
        let registry = Arc::clone(&self);
        let join = thread::spawn(move || {
            let ticker = crossbeam::channel::tick(Duration::from_secs(1));
            loop {
                crossbeam::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => registry.run_due(Instant::now()),
                }
            }
        });
        ControllerHandle {
            stop: stop_tx,
            join: Some(join),
        }
    }
}

pub struct ControllerHandle {
    stop: crossbeam::channel::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn shutdown(mut self) {
        let _ = self.stop.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
