//! Peer wire protocol: versioned envelopes over websocket frames.
//!
//! Every message is one canonical-JSON envelope. The HMAC covers the
//! canonical serialization of every field but itself, so any mutation
//! of version, sender, timestamp or body invalidates the signature.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::identity::PeerId;
use crate::core::json_canon::{CanonJsonError, from_canon_json_bytes, to_canon_json_bytes};
use crate::core::time::WriteStamp;
use crate::model::infra::Infrastructure;
use crate::model::op::Op;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("envelope encode failed: {0}")]
    Encode(#[source] CanonJsonError),
    #[error("envelope decode failed: {0}")]
    Decode(#[source] CanonJsonError),
    #[error("unsupported protocol version {got}")]
    Version { got: u32 },
}

/// Kind-specific payload, adjacently tagged so the envelope carries a
/// top-level `kind` plus a `body`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Connect handshake: what the sender has already seen, per origin.
    Hello {
        last_seen: BTreeMap<PeerId, WriteStamp>,
    },
    /// A batch of stamped CRDT operations.
    Delta { ops: Vec<Op> },
    /// Ask for a full state transfer.
    SnapshotReq,
    /// Full state transfer, for peers whose delta window was pruned or
    /// whose queue overflowed.
    Snapshot {
        state: Box<Infrastructure>,
        high_water: WriteStamp,
    },
}

impl Message {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::Delta { .. } => "DELTA",
            Message::SnapshotReq => "SNAPSHOT_REQ",
            Message::Snapshot { .. } => "SNAPSHOT",
        }
    }
}

/// The self-describing envelope around every peer message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub sender: PeerId,
    pub host_id: String,
    /// Sender clock reading at send time; checked against the
    /// receiver's clock offset bound.
    pub ts: WriteStamp,
    /// Hex HMAC-SHA256; empty while signing.
    pub hmac: String,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn unsigned(sender: PeerId, host_id: String, ts: WriteStamp, message: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            sender,
            host_id,
            ts,
            hmac: String::new(),
            message,
        }
    }

    /// The bytes the HMAC is computed over: the canonical envelope with
    /// an empty hmac field.
    pub fn signable_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let mut unsigned = self.clone();
        unsigned.hmac = String::new();
        to_canon_json_bytes(&unsigned).map_err(ProtoError::Encode)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        to_canon_json_bytes(self).map_err(ProtoError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        let envelope: Envelope = from_canon_json_bytes(bytes).map_err(ProtoError::Decode)?;
        if envelope.v != PROTOCOL_VERSION {
            return Err(ProtoError::Version { got: envelope.v });
        }
        Ok(envelope)
    }
}
