use thiserror::Error;

use crate::controller::ControllerError;
use crate::core::CoreError;
use crate::sched::CapacityError;
use crate::store::StoreError;
use crate::sync::SyncError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability
/// errors. Local errors are returned to the caller; remote errors are
/// logged and counted by the sync engine, and nothing in the CRDT
/// layer ever aborts the process.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Unrecoverable configuration problem at startup; the only fatal
    /// class.
    #[error("configuration invalid: {reason}")]
    Config { reason: String },
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Core(e) => e.transience(),
            Error::Capacity(_) => Transience::Permanent,
            Error::Store(e) => e.transience(),
            Error::Sync(e) => match e {
                SyncError::Auth(auth) => auth.transience(),
                SyncError::Transport(_) => Transience::Retryable,
                SyncError::Proto(_) => Transience::Permanent,
            },
            Error::Controller(e) => e.transience(),
            Error::Config { .. } => Transience::Permanent,
        }
    }
}
