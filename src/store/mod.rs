//! Persistence through an opaque key-value sink.
//!
//! The core persists snapshots and an operation-log tail; what the
//! bytes land on is the sink's business. `MemorySink` backs tests,
//! `DirSink` maps keys onto files with atomic replace.

mod snapshot;

pub use snapshot::{Persister, PersisterConfig, SCHEMA_VERSION, Snapshot};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::core::json_canon::CanonJsonError;
use crate::error::Transience;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value at `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Canon(#[from] CanonJsonError),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Io(_) => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// The opaque sink contract: put, get, prefix scan.
pub trait StoreSink: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// In-memory sink for tests and ephemeral peers.
#[derive(Default)]
pub struct MemorySink {
    inner: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreSink for MemorySink {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get(key).cloned())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Directory-backed sink: one file per key, atomic replace via a
/// temporary sibling.
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(escape_segment(segment));
        }
        path
    }

    fn collect(
        &self,
        dir: &Path,
        key_prefix: &str,
        prefix: &str,
        out: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(".tmp") {
                // In-flight atomic replace; the rename target is the
                // real record.
                continue;
            }
            let segment = unescape_segment(&name.to_string_lossy());
            let key = if key_prefix.is_empty() {
                segment
            } else {
                format!("{key_prefix}/{segment}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &key, prefix, out)?;
            } else if key.starts_with(prefix) {
                out.push((key, fs::read(entry.path())?));
            }
        }
        Ok(())
    }
}

impl StoreSink for DirSink {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        self.collect(&self.root.clone(), "", prefix, &mut out)?;
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(out)
    }
}

/// Keep path segments filesystem-safe; ids are already conservative,
/// anything else percent-escapes.
fn escape_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02x}")),
        }
    }
    out
}

fn unescape_segment(segment: &str) -> String {
    let mut out = Vec::with_capacity(segment.len());
    let bytes = segment.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 3 <= bytes.len()
            && let Some(hex) = segment.get(i + 1..i + 3)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_round_trip_and_scan() {
        let sink = MemorySink::new();
        sink.put("a/1", b"one").unwrap();
        sink.put("a/2", b"two").unwrap();
        sink.put("b/1", b"other").unwrap();

        assert_eq!(sink.get("a/1").unwrap().unwrap(), b"one");
        assert_eq!(sink.get("missing").unwrap(), None);

        let scanned = sink.scan("a/").unwrap();
        assert_eq!(scanned.len(), 2);
        assert!(scanned[0].0 < scanned[1].0);
    }

    #[test]
    fn dir_sink_round_trip_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::open(dir.path()).unwrap();
        sink.put("snapshot/1/100", b"snap").unwrap();
        sink.put("delta/p1/100", b"op1").unwrap();
        sink.put("delta/p1/200", b"op2").unwrap();

        assert_eq!(sink.get("snapshot/1/100").unwrap().unwrap(), b"snap");
        assert_eq!(sink.get("snapshot/1/999").unwrap(), None);

        let deltas = sink.scan("delta/p1/").unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].0, "delta/p1/100");
    }

    #[test]
    fn dir_sink_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::open(dir.path()).unwrap();
        sink.put("meta/self", b"v1").unwrap();
        sink.put("meta/self", b"v2").unwrap();
        assert_eq!(sink.get("meta/self").unwrap().unwrap(), b"v2");
    }

    #[test]
    fn segment_escaping_round_trips() {
        for raw in ["plain", "with:colon", "pct%40sign", "uni\u{00e9}"] {
            assert_eq!(unescape_segment(&escape_segment(raw)), raw);
        }
    }
}
