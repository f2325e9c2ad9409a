//! Core capability errors (parsing, validation, model preconditions).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details.

use thiserror::Error;

use crate::error::Transience;

/// Invalid identifier.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("peer id `{raw}` is invalid: {reason}")]
    Peer { raw: String, reason: String },
    #[error("tenant id `{raw}` is invalid: {reason}")]
    Tenant { raw: String, reason: String },
    #[error("resource id `{raw}` is invalid: {reason}")]
    Resource { raw: String, reason: String },
    #[error("claim id `{raw}` is invalid: {reason}")]
    Claim { raw: String, reason: String },
    #[error("datacenter id `{raw}` is invalid: {reason}")]
    Datacenter { raw: String, reason: String },
    #[error("group id `{raw}` is invalid: {reason}")]
    Group { raw: String, reason: String },
    #[error("profile id `{raw}` is invalid: {reason}")]
    Profile { raw: String, reason: String },
}

/// Canonical error enum for the core model.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("resource kind `{raw}` is not one of compute, network, storage")]
    InvalidKind { raw: String },

    #[error("capacity vector for {kind} resource is missing {missing}")]
    CapacityShape {
        kind: &'static str,
        missing: &'static str,
    },

    /// Reference to an id with no creation observed, after one retry
    /// against a fresh merge.
    #[error("unknown {entity} `{id}`")]
    UnknownEntity { entity: &'static str, id: String },

    #[error("validation failed: {reason}")]
    Validation { reason: String },
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        match self {
            // A create may arrive on a later merge.
            CoreError::UnknownEntity { .. } => Transience::Retryable,
            _ => Transience::Permanent,
        }
    }
}
