//! Snapshots and the delta-log tail.
//!
//! Layout on the sink:
//! - `snapshot/<schema_ver>/<ts>`: full merged state
//! - `delta/<origin>/<ts>`: one op each
//! - `meta/self`: peer identity, schema version, last snapshot stamp
//!
//! Warm restart loads the newest snapshot, replays the tail, and hands
//! back the clock high-water mark so new writes stamp after everything
//! recovered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::core::identity::PeerId;
use crate::core::json_canon::{from_canon_json_bytes, to_canon_json_bytes};
use crate::core::time::WriteStamp;
use crate::crdt::Crdt;
use crate::model::infra::Infrastructure;
use crate::model::op::Op;
use crate::store::{StoreError, StoreSink};

/// Version of the persisted encoding.
pub const SCHEMA_VERSION: u32 = 1;

const CRC_HEADER_LEN: usize = 4;
const MAX_PENDING_RETRY: usize = 16 * 1024;

/// Self-describing full snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub schema_version: u32,
    /// Clock high-water mark when the snapshot was taken.
    pub taken_at: WriteStamp,
    pub state: Infrastructure,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SelfMeta {
    peer_id: PeerId,
    schema_version: u32,
    last_snapshot: WriteStamp,
}

/// Frame a value with a crc32c over its canonical bytes.
fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let body = to_canon_json_bytes(value)?;
    let mut out = Vec::with_capacity(CRC_HEADER_LEN + body.len());
    out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_framed<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    if bytes.len() < CRC_HEADER_LEN {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: "truncated frame".to_string(),
        });
    }
    let (header, body) = bytes.split_at(CRC_HEADER_LEN);
    let expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let actual = crc32c::crc32c(body);
    if expected != actual {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("crc mismatch: expected {expected} got {actual}"),
        });
    }
    Ok(from_canon_json_bytes(body)?)
}

fn stamp_key(stamp: &WriteStamp) -> String {
    // Zero-padded so lexicographic key order equals stamp order.
    format!("{:020}-{:010}", stamp.wall_ms, stamp.counter)
}

#[derive(Clone, Copy, Debug)]
pub struct PersisterConfig {
    /// Snapshot after this many recorded ops.
    pub interval_ops: u64,
    /// Snapshot after this much time, ops or not.
    pub interval: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            interval_ops: 1_000,
            interval: Duration::from_secs(300),
        }
    }
}

/// Writes ops and snapshots through the sink; never propagates store
/// failures into the write path.
pub struct Persister {
    sink: Arc<dyn StoreSink>,
    peer: PeerId,
    config: PersisterConfig,
    ops_since_snapshot: AtomicU64,
    last_snapshot: std::sync::Mutex<Instant>,
    pending_retry: std::sync::Mutex<VecDeque<Op>>,
    failed_puts: AtomicU64,
    failed_snapshots: AtomicU64,
}

impl Persister {
    pub fn new(sink: Arc<dyn StoreSink>, peer: PeerId, config: PersisterConfig) -> Self {
        Self {
            sink,
            peer,
            config,
            ops_since_snapshot: AtomicU64::new(0),
            last_snapshot: std::sync::Mutex::new(Instant::now()),
            pending_retry: std::sync::Mutex::new(VecDeque::new()),
            failed_puts: AtomicU64::new(0),
            failed_snapshots: AtomicU64::new(0),
        }
    }

    /// Append one op to the delta log. Failures keep the op queued for
    /// retry and raise the health counter; the write path continues.
    pub fn record_op(&self, op: &Op) {
        self.retry_pending();
        if let Err(err) = self.put_op(op) {
            tracing::warn!(stamp = %op.stamp, "delta log append failed: {err}");
            self.failed_puts.fetch_add(1, Ordering::Relaxed);
            let mut pending = self.pending_retry.lock().unwrap_or_else(|e| e.into_inner());
            if pending.len() < MAX_PENDING_RETRY {
                pending.push_back(op.clone());
            }
        }
        self.ops_since_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    fn put_op(&self, op: &Op) -> Result<(), StoreError> {
        let key = format!("delta/{}/{}", op.stamp.by, stamp_key(&op.stamp.at));
        self.sink.put(&key, &encode_framed(op)?)
    }

    fn retry_pending(&self) {
        let mut pending = self.pending_retry.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(op) = pending.front() {
            if self.put_op(op).is_err() {
                return;
            }
            pending.pop_front();
        }
    }

    /// True when either snapshot threshold has tripped.
    pub fn snapshot_due(&self) -> bool {
        if self.ops_since_snapshot.load(Ordering::Relaxed) >= self.config.interval_ops {
            return true;
        }
        let last = *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed() >= self.config.interval
    }

    /// Write a full snapshot and reset both cadence counters.
    pub fn snapshot(&self, state: &Infrastructure, high_water: WriteStamp) -> Result<(), StoreError> {
        let snapshot = Snapshot {
            schema_version: SCHEMA_VERSION,
            taken_at: high_water,
            state: state.clone(),
        };
        let key = format!("snapshot/{SCHEMA_VERSION}/{}", stamp_key(&high_water));
        let result = self
            .sink
            .put(&key, &encode_framed(&snapshot)?)
            .and_then(|()| {
                let meta = SelfMeta {
                    peer_id: self.peer.clone(),
                    schema_version: SCHEMA_VERSION,
                    last_snapshot: high_water,
                };
                self.sink.put("meta/self", &encode_framed(&meta)?)
            });
        match result {
            Ok(()) => {
                self.ops_since_snapshot.store(0, Ordering::Relaxed);
                *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
                Ok(())
            }
            Err(err) => {
                self.failed_snapshots.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Repeated store failures surface as a health signal, not a stop.
    pub fn degraded(&self) -> bool {
        self.failed_puts.load(Ordering::Relaxed) > 0
            || self.failed_snapshots.load(Ordering::Relaxed) > 0
    }

    /// Load the newest snapshot and replay the delta tail.
    ///
    /// Returns the recovered state and the clock floor: at least the
    /// snapshot's high-water mark and every replayed op stamp.
    pub fn load(&self) -> Result<(Infrastructure, WriteStamp), StoreError> {
        let mut state = Infrastructure::new();
        let mut floor = WriteStamp::ZERO;

        let snapshots = self.sink.scan(&format!("snapshot/{SCHEMA_VERSION}/"))?;
        if let Some((key, bytes)) = snapshots.last() {
            let snapshot: Snapshot = decode_framed(key, bytes)?;
            floor = snapshot.taken_at;
            state = snapshot.state;
        }

        for (key, bytes) in self.sink.scan("delta/")? {
            let op: Op = match decode_framed::<Op>(&key, &bytes) {
                Ok(op) => op,
                Err(err) => {
                    tracing::warn!(key, "skipping corrupt delta record: {err}");
                    continue;
                }
            };
            if op.stamp.at > floor {
                state.apply(&op);
            }
        }

        let floor = floor.max(state.high_water());
        Ok((state, floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::Clock;
    use crate::model::resource::{Capacity, ResourceKind};
    use crate::store::MemorySink;
    use std::collections::BTreeMap;

    fn capacity() -> Capacity {
        Capacity {
            cpu: 8,
            memory_gb: 32,
            ..Capacity::default()
        }
    }

    fn persister(sink: Arc<dyn StoreSink>) -> Persister {
        Persister::new(sink, PeerId::new("p1").unwrap(), PersisterConfig::default())
    }

    #[test]
    fn snapshot_round_trip_is_identical() {
        let clock = Clock::new(PeerId::new("p1").unwrap());
        let mut state = Infrastructure::new();
        state
            .upsert_resource(
                &clock,
                &crate::core::identity::ResourceId::new("r1").unwrap(),
                ResourceKind::Compute,
                capacity(),
                BTreeMap::new(),
            )
            .unwrap();

        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let persister = persister(Arc::clone(&sink));
        persister.snapshot(&state, clock.high_water()).unwrap();

        let (loaded, floor) = persister.load().unwrap();
        assert_eq!(loaded, state);
        assert!(floor >= state.high_water());
    }

    #[test]
    fn load_replays_delta_tail_after_snapshot() {
        let clock = Clock::new(PeerId::new("p1").unwrap());
        let mut state = Infrastructure::new();
        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let persister = persister(Arc::clone(&sink));

        let ops = state
            .upsert_resource(
                &clock,
                &crate::core::identity::ResourceId::new("r1").unwrap(),
                ResourceKind::Compute,
                capacity(),
                BTreeMap::new(),
            )
            .unwrap();
        for op in &ops {
            persister.record_op(op);
        }
        persister.snapshot(&state, clock.high_water()).unwrap();

        // Ops after the snapshot live only in the delta log.
        let ops = state
            .upsert_resource(
                &clock,
                &crate::core::identity::ResourceId::new("r2").unwrap(),
                ResourceKind::Compute,
                capacity(),
                BTreeMap::new(),
            )
            .unwrap();
        for op in &ops {
            persister.record_op(op);
        }

        let (loaded, floor) = persister.load().unwrap();
        assert_eq!(loaded, state);
        assert!(floor >= state.high_water());
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let persister = persister(Arc::clone(&sink));
        let state = Infrastructure::new();
        persister.snapshot(&state, WriteStamp::new(10, 0)).unwrap();

        let (key, mut bytes) = sink.scan("snapshot/").unwrap().remove(0);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        sink.put(&key, &bytes).unwrap();

        assert!(matches!(
            persister.load(),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn snapshot_cadence_trips_on_op_count() {
        let sink: Arc<dyn StoreSink> = Arc::new(MemorySink::new());
        let persister = Persister::new(
            sink,
            PeerId::new("p1").unwrap(),
            PersisterConfig {
                interval_ops: 2,
                interval: Duration::from_secs(3600),
            },
        );
        assert!(!persister.snapshot_due());

        let clock = Clock::new(PeerId::new("p1").unwrap());
        let mut state = Infrastructure::new();
        let ops = state
            .upsert_resource(
                &clock,
                &crate::core::identity::ResourceId::new("r1").unwrap(),
                ResourceKind::Compute,
                capacity(),
                BTreeMap::new(),
            )
            .unwrap();
        for op in &ops {
            persister.record_op(op);
        }
        // An upsert with no attrs is a single op, still below two.
        assert!(!persister.snapshot_due());

        let ops = state
            .upsert_resource(
                &clock,
                &crate::core::identity::ResourceId::new("r2").unwrap(),
                ResourceKind::Compute,
                capacity(),
                BTreeMap::new(),
            )
            .unwrap();
        for op in &ops {
            persister.record_op(op);
        }
        assert!(persister.snapshot_due());

        persister.snapshot(&state, state.high_water()).unwrap();
        assert!(!persister.snapshot_due());
    }
}
