//! Gossip over websockets.
//!
//! `SyncCore` is the transport-free heart: it signs and verifies
//! envelopes, answers handshakes, merges deltas, dedups by origin
//! stamp, and feeds the per-peer pending queues. `SyncEngine` wraps it
//! in threads: one connector loop per configured peer, one listener for
//! inbound connections. Each session runs a reader thread feeding a
//! crossbeam channel, with the session loop selecting over inbound
//! frames and the flush tick.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tungstenite::WebSocket;
use tungstenite::protocol::Message as WsMessage;

use crate::core::clock::Clock;
use crate::core::identity::PeerId;
use crate::core::time::WriteStamp;
use crate::crdt::Crdt;
use crate::model::infra::Infrastructure;
use crate::model::op::Op;
use crate::store::Persister;
use crate::sync::auth::{AuthContext, SyncAuthError};
use crate::sync::proto::{Envelope, Message, ProtoError};
use crate::sync::queue::PendingQueue;

/// Read timeout that doubles as the flush poll interval.
const SESSION_TICK: Duration = Duration::from_millis(50);
/// Budget for the final drain when a session closes.
const CLOSE_DRAIN_BUDGET: Duration = Duration::from_millis(500);
/// Bound on the inbound websocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Auth(#[from] SyncAuthError),
    #[error("websocket transport failed: {0}")]
    Transport(#[from] Box<tungstenite::Error>),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// One configured remote peer.
#[derive(Clone, Debug)]
pub struct PeerEndpoint {
    pub peer_id: PeerId,
    pub url: String,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub host_id: String,
    pub peers: Vec<PeerEndpoint>,
    pub sync_delta: Duration,
    pub sync_max: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Bind address for inbound peers; None disables the listener.
    pub listen_addr: Option<String>,
}

/// Dropped/accepted counters, exposed rather than exported.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    auth_failures: AtomicU64,
    transport_failures: AtomicU64,
    applied_ops: AtomicU64,
    forwarded_ops: AtomicU64,
}

impl SyncMetrics {
    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn transport_failures(&self) -> u64 {
        self.transport_failures.load(Ordering::Relaxed)
    }

    pub fn applied_ops(&self) -> u64 {
        self.applied_ops.load(Ordering::Relaxed)
    }

    pub fn forwarded_ops(&self) -> u64 {
        self.forwarded_ops.load(Ordering::Relaxed)
    }
}

/// What a due flush wants on the wire.
pub enum Flush {
    Delta { envelope: Envelope, ops: Vec<Op> },
    Snapshot { envelope: Envelope },
}

/// Transport-free sync state machine, shared by every session thread.
pub struct SyncCore {
    peer_id: PeerId,
    host_id: String,
    auth: AuthContext,
    infra: Arc<RwLock<Infrastructure>>,
    clock: Arc<Clock>,
    persister: Option<Arc<Persister>>,
    queues: Mutex<BTreeMap<PeerId, PendingQueue>>,
    /// Greatest stamp applied per origin; the dedup and fan-out gate.
    applied: Mutex<BTreeMap<PeerId, WriteStamp>>,
    metrics: SyncMetrics,
    sync_delta: Duration,
    sync_max: usize,
}

impl SyncCore {
    pub fn new(
        clock: Arc<Clock>,
        infra: Arc<RwLock<Infrastructure>>,
        auth: AuthContext,
        host_id: String,
        sync_delta: Duration,
        sync_max: usize,
        persister: Option<Arc<Persister>>,
    ) -> Self {
        Self {
            peer_id: clock.peer().clone(),
            host_id,
            auth,
            infra,
            clock,
            persister,
            queues: Mutex::new(BTreeMap::new()),
            applied: Mutex::new(BTreeMap::new()),
            metrics: SyncMetrics::default(),
            sync_delta,
            sync_max,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Register a peer so local ops queue for it.
    pub fn ensure_peer(&self, peer: &PeerId) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(peer.clone())
            .or_insert_with(|| PendingQueue::new(self.sync_delta, self.sync_max));
    }

    /// Drop a peer removed from configuration; its queue goes with it.
    pub fn forget_peer(&self, peer: &PeerId) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.remove(peer);
    }

    /// Feed locally committed ops into every peer queue.
    pub fn publish(&self, ops: &[Op]) {
        if ops.is_empty() {
            return;
        }
        {
            let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            for op in ops {
                let seen = applied.entry(op.stamp.by.clone()).or_insert(WriteStamp::ZERO);
                if op.stamp.at > *seen {
                    *seen = op.stamp.at;
                }
            }
        }
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for queue in queues.values_mut() {
            for op in ops {
                queue.push(op.clone());
            }
        }
    }

    fn signed(&self, message: Message) -> Result<Envelope, ProtoError> {
        // A send is a clock event; the envelope carries the stamp.
        let ts = self.clock.tick().at;
        let mut envelope =
            Envelope::unsigned(self.peer_id.clone(), self.host_id.clone(), ts, message);
        self.auth.sign(&mut envelope)?;
        Ok(envelope)
    }

    /// The connect handshake we open every session with.
    pub fn hello(&self) -> Result<Envelope, ProtoError> {
        let applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
        self.signed(Message::Hello {
            last_seen: applied.clone(),
        })
    }

    /// Verify and process one inbound frame. Returns the authenticated
    /// sender and any responses to write back on the same connection.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<(PeerId, Vec<Envelope>), SyncError> {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };
        if let Err(err) = self.auth.verify(&envelope, &self.clock) {
            self.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(sender = %envelope.sender, kind = envelope.message.kind_str(), "dropping peer message: {err}");
            return Err(err.into());
        }

        let sender = envelope.sender.clone();
        let responses = match envelope.message {
            Message::Hello { last_seen } => {
                let ops = self.delta_since(&last_seen);
                tracing::debug!(peer = %sender, ops = ops.len(), "answering hello");
                if ops.is_empty() {
                    Vec::new()
                } else {
                    vec![self.signed(Message::Delta { ops }).map_err(SyncError::from)?]
                }
            }
            Message::Delta { ops } => {
                self.ingest(&sender, ops);
                Vec::new()
            }
            Message::SnapshotReq => {
                let (state, high_water) = {
                    let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
                    (infra.clone(), infra.high_water())
                };
                vec![
                    self.signed(Message::Snapshot {
                        state: Box::new(state),
                        high_water,
                    })
                    .map_err(SyncError::from)?,
                ]
            }
            Message::Snapshot { state, high_water } => {
                {
                    let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
                    infra.merge(&state);
                }
                self.clock.observe(&high_water);
                tracing::info!(peer = %sender, "merged full snapshot");
                Vec::new()
            }
        };
        Ok((sender, responses))
    }

    /// Ops newer than what the remote reports having seen, per origin.
    fn delta_since(&self, last_seen: &BTreeMap<PeerId, WriteStamp>) -> Vec<Op> {
        let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
        // Extract from zero and filter per origin: origins absent from
        // the remote map need their full history.
        infra
            .delta(&WriteStamp::ZERO)
            .into_iter()
            .filter(|op| {
                let seen = last_seen.get(&op.stamp.by).copied().unwrap_or(WriteStamp::ZERO);
                op.stamp.at > seen
            })
            .collect()
    }

    /// Merge a delta batch: apply everything (applies are idempotent),
    /// but persist and fan out only first-seen ops.
    ///
    /// Lock order is state, then applied, then queues - the same order
    /// every local write path uses.
    fn ingest(&self, from: &PeerId, ops: Vec<Op>) {
        let mut fresh = Vec::new();
        {
            let mut infra = self.infra.write().unwrap_or_else(|e| e.into_inner());
            let mut applied = self.applied.lock().unwrap_or_else(|e| e.into_inner());
            for op in ops {
                infra.apply(&op);
                self.clock.observe(&op.stamp.at);
                let seen = applied.entry(op.stamp.by.clone()).or_insert(WriteStamp::ZERO);
                if op.stamp.at > *seen {
                    *seen = op.stamp.at;
                    fresh.push(op);
                }
            }
        }
        if fresh.is_empty() {
            return;
        }
        self.metrics
            .applied_ops
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);
        if let Some(persister) = &self.persister {
            for op in &fresh {
                persister.record_op(op);
            }
        }

        // Anti-entropy fan-out to everyone but the delivering peer and
        // each op's origin.
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut forwarded = 0u64;
        for (peer, queue) in queues.iter_mut() {
            if peer == from {
                continue;
            }
            for op in &fresh {
                if op.stamp.by == *peer {
                    continue;
                }
                queue.push(op.clone());
                forwarded += 1;
            }
        }
        self.metrics
            .forwarded_ops
            .fetch_add(forwarded, Ordering::Relaxed);
    }

    /// A flush for this peer if a threshold tripped; queue overflow
    /// upgrades the flush to a full snapshot.
    pub fn due_flush(&self, peer: &PeerId, now: Instant) -> Option<Result<Flush, ProtoError>> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.get_mut(peer)?;
        if queue.needs_snapshot() {
            queue.drain(now);
            queue.mark_snapshot_sent();
            drop(queues);
            let (state, high_water) = {
                let infra = self.infra.read().unwrap_or_else(|e| e.into_inner());
                (infra.clone(), infra.high_water())
            };
            return Some(
                self.signed(Message::Snapshot {
                    state: Box::new(state),
                    high_water,
                })
                .map(|envelope| Flush::Snapshot { envelope }),
            );
        }
        if !queue.should_flush(now) {
            return None;
        }
        let ops = queue.drain(now);
        drop(queues);
        Some(
            self.signed(Message::Delta { ops: ops.clone() })
                .map(|envelope| Flush::Delta { envelope, ops }),
        )
    }

    /// Everything still queued, regardless of thresholds; the closing
    /// drain uses this.
    pub fn drain_remaining(&self, peer: &PeerId, now: Instant) -> Option<Result<Flush, ProtoError>> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.get_mut(peer)?;
        if queue.is_empty() {
            return None;
        }
        let ops = queue.drain(now);
        drop(queues);
        Some(
            self.signed(Message::Delta { ops: ops.clone() })
                .map(|envelope| Flush::Delta { envelope, ops }),
        )
    }

    /// Put undelivered ops back for the next connection.
    pub fn requeue(&self, peer: &PeerId, ops: Vec<Op>) {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = queues.get_mut(peer) {
            queue.requeue_front(ops);
        }
    }

    fn note_transport_failure(&self) {
        self.metrics
            .transport_failures
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Thread-per-connection websocket runtime around [`SyncCore`].
pub struct SyncEngine;

pub struct SyncHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl SyncHandle {
    /// Address the inbound listener bound to, when one was configured.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

impl SyncEngine {
    pub fn start(core: Arc<SyncCore>, config: SyncConfig) -> std::io::Result<SyncHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut joins = Vec::new();
        let mut local_addr = None;

        if let Some(addr) = &config.listen_addr {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            local_addr = Some(listener.local_addr()?);
            let core = Arc::clone(&core);
            let stop = Arc::clone(&shutdown);
            joins.push(thread::spawn(move || run_listener(listener, core, stop)));
        }

        for peer in config.peers.clone() {
            core.ensure_peer(&peer.peer_id);
            let core = Arc::clone(&core);
            let stop = Arc::clone(&shutdown);
            let backoff = (config.backoff_base, config.backoff_max);
            joins.push(thread::spawn(move || {
                run_peer_loop(peer, core, stop, backoff)
            }));
        }

        Ok(SyncHandle {
            shutdown,
            joins,
            local_addr,
        })
    }
}

fn run_listener(listener: TcpListener, core: Arc<SyncCore>, shutdown: Arc<AtomicBool>) {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, remote)) => {
                let core = Arc::clone(&core);
                let stop = Arc::clone(&shutdown);
                sessions.push(thread::spawn(move || {
                    if stream.set_nonblocking(false).is_err()
                        || stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
                    {
                        return;
                    }
                    match tungstenite::accept(stream) {
                        Ok(ws) => {
                            // Tighten from the handshake bound to the
                            // session tick the reader loops on.
                            if ws.get_ref().set_read_timeout(Some(SESSION_TICK)).is_err() {
                                core.note_transport_failure();
                                return;
                            }
                            if let Err(err) = run_session(ws, None, &core, &stop) {
                                core.note_transport_failure();
                                tracing::warn!(%remote, "inbound session ended: {err}");
                            }
                        }
                        Err(err) => {
                            core.note_transport_failure();
                            tracing::warn!(%remote, "websocket accept failed: {err}");
                        }
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(SESSION_TICK);
            }
            Err(err) => {
                tracing::warn!("listener accept failed: {err}");
                thread::sleep(SESSION_TICK);
            }
        }
        sessions.retain(|join| !join.is_finished());
    }
    for join in sessions {
        let _ = join.join();
    }
}

fn run_peer_loop(
    peer: PeerEndpoint,
    core: Arc<SyncCore>,
    shutdown: Arc<AtomicBool>,
    (backoff_base, backoff_max): (Duration, Duration),
) {
    let mut backoff = backoff_base;
    while !shutdown.load(Ordering::Relaxed) {
        match tungstenite::connect(peer.url.as_str()) {
            Ok((ws, _response)) => {
                backoff = backoff_base;
                if set_stream_timeout(&ws).is_ok() {
                    if let Err(err) = run_session(ws, Some(peer.peer_id.clone()), &core, &shutdown)
                    {
                        core.note_transport_failure();
                        tracing::warn!(peer = %peer.peer_id, "peer session ended: {err}");
                    }
                } else {
                    core.note_transport_failure();
                }
            }
            Err(err) => {
                core.note_transport_failure();
                tracing::warn!(peer = %peer.peer_id, url = %peer.url, "connect failed: {err}");
            }
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        // Exponential backoff with jitter so a rebooted mesh does not
        // reconnect in lockstep.
        let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 4 + 1);
        thread::sleep(backoff + Duration::from_millis(jitter));
        backoff = (backoff * 2).min(backoff_max);
    }
}

fn set_stream_timeout(
    ws: &WebSocket<tungstenite::stream::MaybeTlsStream<std::net::TcpStream>>,
) -> std::io::Result<()> {
    match ws.get_ref() {
        tungstenite::stream::MaybeTlsStream::Plain(stream) => {
            stream.set_read_timeout(Some(SESSION_TICK))
        }
        _ => Ok(()),
    }
}

/// What the reader thread hands the session loop.
enum Inbound {
    Frame(Vec<u8>),
    Closed,
    Failed(SyncError),
}

/// One bidirectional session. A reader thread pulls frames off the
/// socket into a channel; the session loop selects over inbound frames
/// and the flush tick, then drains on close.
///
/// The socket sits behind a mutex; the reader holds it only for the
/// bounded read timeout, so writes interleave at tick granularity.
fn run_session<S: Read + Write + Send + 'static>(
    ws: WebSocket<S>,
    configured_peer: Option<PeerId>,
    core: &Arc<SyncCore>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), SyncError> {
    let ws = Arc::new(Mutex::new(ws));
    let hello = core.hello()?;
    send_envelope(&ws, &hello)?;

    let session_stop = Arc::new(AtomicBool::new(false));
    let (inbound_tx, inbound_rx) = crossbeam::channel::unbounded::<Inbound>();
    let reader_handle = {
        let ws = Arc::clone(&ws);
        let stop = Arc::clone(&session_stop);
        let global_stop = Arc::clone(shutdown);
        thread::spawn(move || run_reader_loop(&ws, inbound_tx, stop, global_stop))
    };

    let mut session_peer = configured_peer;

    let result = loop {
        if shutdown.load(Ordering::Relaxed) {
            break Ok(());
        }

        let tick = crossbeam::channel::after(SESSION_TICK);
        crossbeam::select! {
            recv(inbound_rx) -> msg => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(_) => break Ok(()),
                };
                match msg {
                    Inbound::Frame(bytes) => {
                        match handle_inbound(&ws, core, &bytes, &mut session_peer) {
                            Ok(()) => {}
                            Err(err @ SyncError::Auth(_)) => break Err(err),
                            Err(err) => {
                                tracing::warn!("discarding malformed frame: {err}");
                            }
                        }
                    }
                    Inbound::Closed => break Ok(()),
                    Inbound::Failed(err) => break Err(err),
                }
            }
            recv(tick) -> _ => {}
        }

        if let Some(peer) = session_peer.clone()
            && let Some(flush) = core.due_flush(&peer, Instant::now())
        {
            match flush {
                Ok(Flush::Delta { envelope, ops }) => {
                    if let Err(err) = send_envelope(&ws, &envelope) {
                        core.requeue(&peer, ops);
                        break Err(err);
                    }
                }
                Ok(Flush::Snapshot { envelope }) => {
                    if let Err(err) = send_envelope(&ws, &envelope) {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err.into()),
            }
        }
    };

    // Closing drain with a bounded budget; whatever cannot be sent is
    // requeued for the next connection.
    if let Some(peer) = session_peer {
        let deadline = Instant::now() + CLOSE_DRAIN_BUDGET;
        while Instant::now() < deadline {
            match core.drain_remaining(&peer, Instant::now()) {
                Some(Ok(Flush::Delta { envelope, ops })) => {
                    if send_envelope(&ws, &envelope).is_err() {
                        core.requeue(&peer, ops);
                        break;
                    }
                }
                Some(Ok(Flush::Snapshot { .. })) | Some(Err(_)) | None => break,
            }
        }
    }

    session_stop.store(true, Ordering::Relaxed);
    {
        let mut ws = ws.lock().unwrap_or_else(|e| e.into_inner());
        let _ = ws.close(None);
    }
    let _ = reader_handle.join();

    result
}

/// Pull frames off the socket into the session channel until the
/// session ends or the connection dies.
fn run_reader_loop<S: Read + Write>(
    ws: &Mutex<WebSocket<S>>,
    inbound_tx: crossbeam::channel::Sender<Inbound>,
    session_stop: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if session_stop.load(Ordering::Relaxed) || shutdown.load(Ordering::Relaxed) {
            return;
        }

        let msg = {
            let mut ws = ws.lock().unwrap_or_else(|e| e.into_inner());
            ws.read()
        };
        match msg {
            Ok(WsMessage::Binary(bytes)) => {
                if inbound_tx.send(Inbound::Frame(bytes.to_vec())).is_err() {
                    return;
                }
            }
            Ok(WsMessage::Text(text)) => {
                if inbound_tx
                    .send(Inbound::Frame(text.as_bytes().to_vec()))
                    .is_err()
                {
                    return;
                }
            }
            Ok(WsMessage::Close(_)) => {
                let _ = inbound_tx.send(Inbound::Closed);
                return;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                let _ = inbound_tx.send(Inbound::Closed);
                return;
            }
            Err(err) => {
                let _ = inbound_tx.send(Inbound::Failed(SyncError::Transport(Box::new(err))));
                return;
            }
        }
    }
}

fn handle_inbound<S: Read + Write>(
    ws: &Mutex<WebSocket<S>>,
    core: &Arc<SyncCore>,
    bytes: &[u8],
    session_peer: &mut Option<PeerId>,
) -> Result<(), SyncError> {
    let (sender, responses) = core.handle_frame(bytes)?;
    if session_peer.is_none() {
        core.ensure_peer(&sender);
        *session_peer = Some(sender);
    }
    for response in responses {
        send_envelope(ws, &response)?;
    }
    Ok(())
}

fn send_envelope<S: Read + Write>(
    ws: &Mutex<WebSocket<S>>,
    envelope: &Envelope,
) -> Result<(), SyncError> {
    let bytes = envelope.encode()?;
    let mut ws = ws.lock().unwrap_or_else(|e| e.into_inner());
    ws.send(WsMessage::Binary(bytes.into()))
        .map_err(|err| SyncError::Transport(Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::ResourceId;
    use crate::model::resource::{Capacity, ResourceKind};
    use std::collections::BTreeSet;

    fn make_core(peer: &str, secret: &str) -> (Arc<SyncCore>, Arc<Clock>, Arc<RwLock<Infrastructure>>) {
        let clock = Arc::new(Clock::new(PeerId::new(peer).unwrap()));
        let infra = Arc::new(RwLock::new(Infrastructure::new()));
        let auth = AuthContext::new(secret, 30.0, false, BTreeSet::new());
        let core = Arc::new(SyncCore::new(
            Arc::clone(&clock),
            Arc::clone(&infra),
            auth,
            format!("{peer}-host"),
            Duration::from_secs(180),
            1000,
            None,
        ));
        (core, clock, infra)
    }

    fn upsert(core: &SyncCore, clock: &Clock, infra: &RwLock<Infrastructure>, id: &str) -> Vec<Op> {
        let ops = infra
            .write()
            .unwrap()
            .upsert_resource(
                clock,
                &ResourceId::new(id).unwrap(),
                ResourceKind::Compute,
                Capacity {
                    cpu: 8,
                    memory_gb: 32,
                    ..Capacity::default()
                },
                Default::default(),
            )
            .unwrap();
        core.publish(&ops);
        ops
    }

    #[test]
    fn hello_exchange_returns_missing_ops() {
        let (core_a, clock_a, infra_a) = make_core("p1", "s3cret");
        let (core_b, _clock_b, infra_b) = make_core("p2", "s3cret");

        upsert(&core_a, &clock_a, &infra_a, "r1");

        // B says hello with an empty history; A answers with a delta.
        let hello_b = core_b.hello().unwrap();
        let (sender, responses) = core_a.handle_frame(&hello_b.encode().unwrap()).unwrap();
        assert_eq!(sender, *core_b.peer_id());
        assert_eq!(responses.len(), 1);

        // B ingests the delta and converges.
        let (_, more) = core_b
            .handle_frame(&responses[0].encode().unwrap())
            .unwrap();
        assert!(more.is_empty());
        assert_eq!(infra_b.read().unwrap().resources().count(), 1);
    }

    #[test]
    fn bad_hmac_is_dropped_and_counted() {
        let (core_a, _clock_a, _infra_a) = make_core("p1", "right-secret");
        let (core_q, clock_q, infra_q) = make_core("q", "wrong-secret");

        upsert(&core_q, &clock_q, &infra_q, "rq");
        let ops = infra_q.read().unwrap().delta(&WriteStamp::ZERO);
        let envelope = core_q
            .signed(Message::Delta { ops })
            .unwrap();

        let err = core_a.handle_frame(&envelope.encode().unwrap()).unwrap_err();
        assert!(matches!(err, SyncError::Auth(SyncAuthError::HmacMismatch { .. })));
        assert_eq!(core_a.metrics().auth_failures(), 1);

        // Last-seen for q must not advance.
        let hello = core_a.hello().unwrap();
        let Message::Hello { last_seen } = hello.message else {
            panic!("expected hello");
        };
        assert!(!last_seen.contains_key(core_q.peer_id()));
    }

    #[test]
    fn delta_is_forwarded_to_other_peers_once() {
        let (core_b, _clock_b, _infra_b) = make_core("p2", "s");
        let (core_a, clock_a, infra_a) = make_core("p1", "s");
        let third = PeerId::new("p3").unwrap();
        core_b.ensure_peer(&third);

        let ops = upsert(&core_a, &clock_a, &infra_a, "r1");
        let envelope = core_a.signed(Message::Delta { ops: ops.clone() }).unwrap();
        let bytes = envelope.encode().unwrap();

        core_b.handle_frame(&bytes).unwrap();
        assert_eq!(core_b.metrics().forwarded_ops(), ops.len() as u64);

        // Duplicate delivery neither re-applies nor re-forwards.
        core_b.handle_frame(&bytes).unwrap();
        assert_eq!(core_b.metrics().forwarded_ops(), ops.len() as u64);
        assert_eq!(core_b.metrics().applied_ops(), ops.len() as u64);
    }

    #[test]
    fn snapshot_request_returns_full_state() {
        let (core_a, clock_a, infra_a) = make_core("p1", "s");
        let (core_b, _clock_b, infra_b) = make_core("p2", "s");
        upsert(&core_a, &clock_a, &infra_a, "r1");
        upsert(&core_a, &clock_a, &infra_a, "r2");

        let req = core_b.signed(Message::SnapshotReq).unwrap();
        let (_, responses) = core_a.handle_frame(&req.encode().unwrap()).unwrap();
        assert_eq!(responses.len(), 1);

        core_b
            .handle_frame(&responses[0].encode().unwrap())
            .unwrap();
        assert_eq!(infra_b.read().unwrap().resources().count(), 2);
    }

    #[test]
    fn overflow_turns_flush_into_snapshot() {
        let clock = Arc::new(Clock::new(PeerId::new("p1").unwrap()));
        let infra = Arc::new(RwLock::new(Infrastructure::new()));
        let auth = AuthContext::new("s", 30.0, false, BTreeSet::new());
        let core = SyncCore::new(
            Arc::clone(&clock),
            Arc::clone(&infra),
            auth,
            "host".into(),
            Duration::from_secs(180),
            2,
            None,
        );
        let peer = PeerId::new("p2").unwrap();
        core.ensure_peer(&peer);

        let mut ops = Vec::new();
        for i in 0..64 {
            ops.extend(
                infra
                    .write()
                    .unwrap()
                    .upsert_resource(
                        &clock,
                        &ResourceId::new(format!("r{i}")).unwrap(),
                        ResourceKind::Compute,
                        Capacity {
                            cpu: 1,
                            memory_gb: 1,
                            ..Capacity::default()
                        },
                        Default::default(),
                    )
                    .unwrap(),
            );
        }
        core.publish(&ops);

        let flush = core.due_flush(&peer, Instant::now()).unwrap().unwrap();
        assert!(matches!(flush, Flush::Snapshot { .. }));
    }

    #[test]
    fn due_flush_respects_thresholds() {
        let (core, clock, infra) = make_core("p1", "s");
        let peer = PeerId::new("p2").unwrap();
        core.ensure_peer(&peer);

        upsert(&core, &clock, &infra, "r1");
        // One op, fresh window: nothing due yet.
        assert!(core.due_flush(&peer, Instant::now()).is_none());
    }
}
