//! Peer message authentication.
//!
//! HMAC-SHA256 keyed by the shared cluster secret, verified in
//! constant time, plus the wall-clock skew check and the strict-mode
//! peer allowlist. Every accepted message passed all three.

use std::collections::BTreeSet;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::core::clock::Clock;
use crate::core::identity::PeerId;
use crate::error::Transience;
use crate::sync::proto::{Envelope, ProtoError};

type HmacSha256 = Hmac<Sha256>;

/// Authentication failures; connection-dropping, counted, never fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncAuthError {
    #[error("hmac mismatch from {sender}")]
    HmacMismatch { sender: PeerId },
    #[error("clock skew {skew_ms}ms from {sender} exceeds offset bound")]
    SkewExceeded { sender: PeerId, skew_ms: u64 },
    #[error("sender {sender} is not a configured peer")]
    UnknownPeer { sender: PeerId },
}

impl SyncAuthError {
    pub fn transience(&self) -> Transience {
        // Skew may heal; wrong secrets and unknown peers will not.
        match self {
            SyncAuthError::SkewExceeded { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}

/// Shared-secret signing and verification context.
#[derive(Clone)]
pub struct AuthContext {
    key: Vec<u8>,
    clock_offset_secs: f64,
    strict: bool,
    allowed: BTreeSet<PeerId>,
}

impl AuthContext {
    pub fn new(
        secret: &str,
        clock_offset_secs: f64,
        strict: bool,
        allowed: BTreeSet<PeerId>,
    ) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
            clock_offset_secs,
            strict,
            allowed,
        }
    }

    /// Fill in the envelope's hmac over its canonical bytes.
    pub fn sign(&self, envelope: &mut Envelope) -> Result<(), ProtoError> {
        let bytes = envelope.signable_bytes()?;
        envelope.hmac = hex_encode(&self.compute(&bytes));
        Ok(())
    }

    /// HMAC first, then skew, then the strict-mode allowlist. The order
    /// keeps unauthenticated input from influencing anything else.
    pub fn verify(&self, envelope: &Envelope, clock: &Clock) -> Result<(), SyncAuthError> {
        let Ok(bytes) = envelope.signable_bytes() else {
            return Err(SyncAuthError::HmacMismatch {
                sender: envelope.sender.clone(),
            });
        };
        let expected = self.compute(&bytes);
        let presented = hex_decode(&envelope.hmac).unwrap_or_default();
        if !constant_time_eq(&expected, &presented) {
            return Err(SyncAuthError::HmacMismatch {
                sender: envelope.sender.clone(),
            });
        }

        if clock.skew_exceeded(envelope.ts.wall_ms, self.clock_offset_secs) {
            return Err(SyncAuthError::SkewExceeded {
                sender: envelope.sender.clone(),
                skew_ms: clock.skew_ms(envelope.ts.wall_ms),
            });
        }

        if self.strict && !self.allowed.contains(&envelope.sender) {
            return Err(SyncAuthError::UnknownPeer {
                sender: envelope.sender.clone(),
            });
        }
        Ok(())
    }

    fn compute(&self, bytes: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .expect("HMAC accepts any key size per RFC 2104");
        mac.update(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("key", &"[redacted]")
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
