//! Peer synchronization: batched delta gossip over websockets with
//! shared-secret authentication and backpressure.

pub mod auth;
pub mod engine;
pub mod proto;
pub mod queue;

pub use auth::{AuthContext, SyncAuthError};
pub use engine::{
    Flush, PeerEndpoint, SyncConfig, SyncCore, SyncEngine, SyncError, SyncHandle, SyncMetrics,
};
pub use proto::{Envelope, Message, PROTOCOL_VERSION, ProtoError};
pub use queue::PendingQueue;
