//! The assembled node.
//!
//! One `Node` owns everything a peer runs: the merged state behind its
//! read/write lock, the clock, the persister, the sync engine, the
//! scheduler worker and the controller registry. It is built once at
//! startup and torn down at shutdown; workers get explicit handles, no
//! global singletons.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::controller::{Controller, ControllerHandle, ControllerRegistry};
use crate::core::clock::{Clock, now_ms};
use crate::core::identity::{ClaimId, DatacenterId, GroupId, PeerId, ResourceId, TenantId};
use crate::crdt::Crdt;
use crate::error::Error;
use crate::model::claim::{ClaimMeta, ClaimStatus, ResourceProfile, Window};
use crate::model::infra::Infrastructure;
use crate::model::op::Op;
use crate::model::resource::{Capacity, ResourceKind, ResourceState};
use crate::sched::{Availability, Scheduler};
use crate::store::{Persister, StoreSink};
use crate::sync::auth::AuthContext;
use crate::sync::engine::{PeerEndpoint, SyncConfig, SyncCore, SyncEngine, SyncHandle};

/// How long one scheduler pass may run before leftover claims wait for
/// the next pass.
const SCHED_PASS_BUDGET: Duration = Duration::from_secs(2);
const SCHED_TICK: Duration = Duration::from_millis(500);

pub struct Node {
    peer_id: PeerId,
    clock: Arc<Clock>,
    infra: Arc<RwLock<Infrastructure>>,
    core: Arc<SyncCore>,
    persister: Arc<Persister>,
    scheduler: Arc<Scheduler>,
    registry: Arc<ControllerRegistry>,
    sched_stop: crossbeam::channel::Sender<()>,
    sync_handle: Option<SyncHandle>,
    controller_handle: Option<ControllerHandle>,
    sched_join: Option<JoinHandle<()>>,
}

impl Node {
    /// Build and start a node: load persisted state, advance the clock
    /// past everything recovered, then bring up the workers.
    pub fn start(config: Config, sink: Arc<dyn StoreSink>) -> Result<Self, Error> {
        config.validate()?;
        let peer_id = config.resolve_peer_id()?;
        let host_id = config.resolve_host_id();

        let persister = Arc::new(Persister::new(
            Arc::clone(&sink),
            peer_id.clone(),
            config.persister_config(),
        ));
        let (state, floor) = persister.load()?;
        let clock = Arc::new(Clock::new(peer_id.clone()));
        clock.advance_to(&floor);
        let infra = Arc::new(RwLock::new(state));

        let allowed: BTreeSet<PeerId> = config
            .peers
            .iter()
            .filter_map(|p| PeerId::new(p.peer_id.clone()).ok())
            .collect();
        let auth = AuthContext::new(
            &config.peer_secret,
            config.clock_offset,
            config.peer_strict,
            allowed,
        );
        let core = Arc::new(SyncCore::new(
            Arc::clone(&clock),
            Arc::clone(&infra),
            auth,
            host_id,
            config.sync_delta_duration(),
            config.sync_max,
            Some(Arc::clone(&persister)),
        ));

        let scheduler = Arc::new(Scheduler::new(config.scheduler_config()));

        let publish = {
            let core = Arc::clone(&core);
            let persister = Arc::clone(&persister);
            Arc::new(move |ops: &[Op]| {
                for op in ops {
                    persister.record_op(op);
                }
                core.publish(ops);
            })
        };
        let registry = Arc::new(ControllerRegistry::new(
            Arc::clone(&infra),
            Arc::clone(&clock),
            publish,
            config.controllers.grace_interval,
            Duration::from_secs(config.controllers.cooloff_seconds),
        ));

        let sync_config = SyncConfig {
            host_id: config.resolve_host_id(),
            peers: config
                .peers
                .iter()
                .filter_map(|p| {
                    PeerId::new(p.peer_id.clone()).ok().map(|peer_id| PeerEndpoint {
                        peer_id,
                        url: p.url.clone(),
                    })
                })
                .collect(),
            sync_delta: config.sync_delta_duration(),
            sync_max: config.sync_max,
            backoff_base: Duration::from_millis(config.reconnect.backoff_base_ms),
            backoff_max: Duration::from_millis(config.reconnect.backoff_max_ms),
            listen_addr: config.listen_addr.clone(),
        };
        let sync_handle = SyncEngine::start(Arc::clone(&core), sync_config).map_err(|e| {
            Error::Config {
                reason: format!("failed to start sync listener: {e}"),
            }
        })?;

        let controller_handle = Arc::clone(&registry).start();

        let (sched_stop, sched_stop_rx) = crossbeam::channel::bounded::<()>(1);
        let sched_join = {
            let infra = Arc::clone(&infra);
            let clock = Arc::clone(&clock);
            let scheduler = Arc::clone(&scheduler);
            let registry = Arc::clone(&registry);
            let core = Arc::clone(&core);
            let persister = Arc::clone(&persister);
            thread::spawn(move || {
                let ticker = crossbeam::channel::tick(SCHED_TICK);
                loop {
                    crossbeam::select! {
                        recv(sched_stop_rx) -> _ => break,
                        recv(ticker) -> _ => run_scheduler_pass(
                            &infra, &clock, &scheduler, &registry, &core, &persister,
                        ),
                    }
                }
            })
        };

        Ok(Self {
            peer_id,
            clock,
            infra,
            core,
            persister,
            scheduler,
            registry,
            sched_stop,
            sync_handle: Some(sync_handle),
            controller_handle: Some(controller_handle),
            sched_join: Some(sched_join),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Address the sync listener bound to, when one is configured.
    pub fn sync_addr(&self) -> Option<std::net::SocketAddr> {
        self.sync_handle.as_ref().and_then(|h| h.local_addr())
    }

    pub fn register_controller(&self, adapter: Arc<dyn Controller>) {
        self.registry.register(adapter);
    }

    pub fn sync_metrics(&self) -> &crate::sync::SyncMetrics {
        self.core.metrics()
    }

    pub fn store_degraded(&self) -> bool {
        self.persister.degraded()
    }

    // ---- request path ------------------------------------------------------

    fn commit<T>(
        &self,
        write: impl FnOnce(&mut Infrastructure, &Clock) -> Result<(Vec<Op>, T), Error>,
    ) -> Result<T, Error> {
        // The guard spans validate-then-write-then-publish so ops from
        // one origin reach the peer queues in stamp order.
        let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
        let (ops, out) = write(&mut infra, &self.clock)?;
        for op in &ops {
            self.persister.record_op(op);
        }
        self.core.publish(&ops);
        drop(infra);
        self.maybe_snapshot();
        Ok(out)
    }

    pub fn upsert_resource(
        &self,
        id: &ResourceId,
        kind: ResourceKind,
        capacity: Capacity,
        attrs: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let ops = infra.upsert_resource(clock, id, kind, capacity, attrs)?;
            Ok((ops, ()))
        })
    }

    pub fn set_resource_state(&self, id: &ResourceId, state: ResourceState) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let op = infra.set_resource_state(clock, id, state)?;
            Ok((vec![op], ()))
        })
    }

    pub fn create_datacenter(
        &self,
        id: &DatacenterId,
        name: &str,
        location: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let ops = infra.create_datacenter(clock, id, name, location)?;
            Ok((ops, ()))
        })
    }

    pub fn attach_to_rack(
        &self,
        resource: &ResourceId,
        datacenter: &DatacenterId,
        row_idx: usize,
        rack_idx: usize,
        position_hint: Option<crate::crdt::FracIndex>,
    ) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let ops =
                infra.attach_to_rack(clock, resource, datacenter, row_idx, rack_idx, position_hint)?;
            Ok((ops, ()))
        })
    }

    pub fn create_logical_group(&self, id: &GroupId, name: &str) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let op = infra.create_logical_group(clock, id, name)?;
            Ok((vec![op], ()))
        })
    }

    pub fn assign_group_slot(
        &self,
        group: &GroupId,
        slot: &str,
        resource: &ResourceId,
    ) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let op = infra.assign_group_slot(clock, group, slot, resource)?;
            Ok((vec![op], ()))
        })
    }

    pub fn submit_claim(
        &self,
        id: &ClaimId,
        tenant: TenantId,
        window: Window,
        priority: u8,
        profiles: Vec<ResourceProfile>,
    ) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let ops = infra.submit_claim(
                clock,
                id,
                ClaimMeta {
                    tenant,
                    window,
                    priority,
                },
                profiles,
            )?;
            Ok((ops, ()))
        })
    }

    pub fn withdraw_claim(&self, id: &ClaimId) -> Result<(), Error> {
        self.commit(|infra, clock| {
            let op = infra.withdraw_claim(clock, id)?;
            Ok((vec![op], ()))
        })
    }

    pub fn claim_status(&self, id: &ClaimId) -> Option<ClaimStatus> {
        let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
        infra.claim(id).map(|claim| claim.status().clone())
    }

    /// Forward-looking availability for a profile shape.
    pub fn probe(
        &self,
        kind: ResourceKind,
        required: &BTreeMap<String, String>,
        window: Window,
        quantity: u32,
    ) -> Availability {
        let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
        self.scheduler.probe(&infra, kind, required, window, quantity)
    }

    /// Run one scheduler pass now instead of waiting for the worker.
    pub fn run_scheduler_now(&self) {
        run_scheduler_pass(
            &self.infra,
            &self.clock,
            &self.scheduler,
            &self.registry,
            &self.core,
            &self.persister,
        );
    }

    fn maybe_snapshot(&self) {
        if !self.persister.snapshot_due() {
            return;
        }
        let (state, high_water) = {
            let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
            (infra.clone(), infra.high_water())
        };
        if let Err(err) = self.persister.snapshot(&state, high_water) {
            tracing::warn!("snapshot failed, will retry on next cadence: {err}");
        }
    }

    /// Stop workers, flush a final snapshot, tear down.
    pub fn shutdown(mut self) {
        let _ = self.sched_stop.send(());
        if let Some(join) = self.sched_join.take() {
            let _ = join.join();
        }
        if let Some(handle) = self.controller_handle.take() {
            handle.shutdown();
        }
        if let Some(handle) = self.sync_handle.take() {
            handle.shutdown();
        }
        let (state, high_water) = {
            let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
            (infra.clone(), infra.high_water())
        };
        if let Err(err) = self.persister.snapshot(&state, high_water) {
            tracing::warn!("final snapshot failed: {err}");
        }
    }
}

fn run_scheduler_pass(
    infra: &Arc<RwLock<Infrastructure>>,
    clock: &Arc<Clock>,
    scheduler: &Arc<Scheduler>,
    registry: &Arc<ControllerRegistry>,
    core: &Arc<SyncCore>,
    persister: &Arc<Persister>,
) {
    let pass = {
        let mut infra = infra.write().unwrap_or_else(|e| e.into_inner());
        let pass = scheduler.tick(
            &mut infra,
            clock,
            now_ms(),
            Some(Instant::now() + SCHED_PASS_BUDGET),
        );
        for op in &pass.ops {
            persister.record_op(op);
        }
        core.publish(&pass.ops);
        pass
    };
    for claim in &pass.placed {
        registry.dispatch_placement(claim);
    }
    for rejection in &pass.rejected {
        tracing::info!(claim = %rejection.claim, "claim rejected: {}", rejection.cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySink;

    fn quiet_config() -> Config {
        // No peers, no listener: workers idle but the request path is
        // fully live.
        Config::default()
    }

    fn capacity() -> Capacity {
        Capacity {
            cpu: 8,
            memory_gb: 32,
            ..Capacity::default()
        }
    }

    #[test]
    fn node_round_trips_resources_and_claims() {
        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let node = Node::start(quiet_config(), sink).unwrap();

        let rid = ResourceId::new("r1").unwrap();
        node.upsert_resource(&rid, ResourceKind::Compute, capacity(), BTreeMap::new())
            .unwrap();

        let claim = ClaimId::new("c1").unwrap();
        let start = now_ms() + 60_000;
        node.submit_claim(
            &claim,
            TenantId::new("acme").unwrap(),
            Window::new(start, start + 3_600_000),
            0,
            vec![ResourceProfile {
                id: crate::core::identity::ProfileId::generate(),
                kind: ResourceKind::Compute,
                quantity: 1,
                required: BTreeMap::new(),
                preferred: BTreeMap::new(),
                duration_ms: None,
            }],
        )
        .unwrap();

        node.run_scheduler_now();
        assert!(matches!(
            node.claim_status(&claim),
            Some(ClaimStatus::Placed { .. })
        ));

        node.shutdown();
    }

    #[test]
    fn node_restart_recovers_state() {
        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let rid = ResourceId::new("r1").unwrap();
        {
            let node = Node::start(quiet_config(), Arc::clone(&sink)).unwrap();
            node.upsert_resource(&rid, ResourceKind::Compute, capacity(), BTreeMap::new())
                .unwrap();
            node.shutdown();
        }

        let node = Node::start(quiet_config(), sink).unwrap();
        let probe = node.probe(
            ResourceKind::Compute,
            &BTreeMap::new(),
            Window::new(0, 1_000),
            1,
        );
        assert_eq!(probe.max_quantity, 1);
        node.shutdown();
    }
}
