//! Config loading.
//!
//! TOML with serde defaults; every recognized option carries the
//! documented default so a partial file is always usable. Loading is a
//! pure function of the path; nothing here reads the environment.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::identity::PeerId;
use crate::error::Error;
use crate::sched::SchedulerConfig;
use crate::store::PersisterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable self identity; generated and persisted when absent.
    pub peer_id: Option<String>,
    /// Advertised hostname; auto-detected when absent.
    pub host_id: Option<String>,
    /// Shared HMAC key for peer messages.
    pub peer_secret: String,
    pub peers: Vec<PeerConfig>,
    /// When true, senders must be configured peers.
    pub peer_strict: bool,
    /// Acceptable wall-clock skew, in seconds.
    pub clock_offset: f64,
    /// Backpressure time threshold, in seconds.
    pub sync_delta: u64,
    /// Backpressure count threshold, in operations.
    pub sync_max: usize,
    /// Default per-tenant share weight.
    pub shares: u64,
    /// Per-tenant share overrides.
    pub shares_overrides: BTreeMap<String, u64>,
    /// Bind address for inbound peer connections; None disables.
    pub listen_addr: Option<String>,
    pub snapshot: SnapshotConfig,
    pub reconnect: ReconnectConfig,
    pub controllers: ControllerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: None,
            host_id: None,
            peer_secret: String::new(),
            peers: Vec::new(),
            peer_strict: false,
            clock_offset: crate::core::DEFAULT_CLOCK_OFFSET_SECS,
            sync_delta: 180,
            sync_max: 1000,
            shares: 1,
            shares_overrides: BTreeMap::new(),
            listen_addr: None,
            snapshot: SnapshotConfig::default(),
            reconnect: ReconnectConfig::default(),
            controllers: ControllerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub peer_id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_ops: u64,
    pub interval_seconds: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_ops: 1_000,
            interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Consecutive absent pushes before a resource is tombstoned.
    pub grace_interval: u32,
    /// Seconds a degraded resource sits out after a failed hook.
    pub cooloff_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            grace_interval: 3,
            cooloff_seconds: 300,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| Error::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.peers.is_empty() && self.peer_secret.is_empty() {
            return Err(Error::Config {
                reason: "peers configured without a peer_secret".to_string(),
            });
        }
        if self.clock_offset <= 0.0 {
            return Err(Error::Config {
                reason: "clock_offset must be positive".to_string(),
            });
        }
        if self.sync_max == 0 {
            return Err(Error::Config {
                reason: "sync_max must be at least 1".to_string(),
            });
        }
        for peer in &self.peers {
            PeerId::new(peer.peer_id.clone()).map_err(|e| Error::Config {
                reason: format!("invalid peer entry: {e}"),
            })?;
        }
        Ok(())
    }

    /// Resolved self identity: configured or freshly generated.
    pub fn resolve_peer_id(&self) -> Result<PeerId, Error> {
        match &self.peer_id {
            Some(raw) => PeerId::new(raw.clone()).map_err(|e| Error::Config {
                reason: format!("invalid peer_id: {e}"),
            }),
            None => Ok(PeerId::generate()),
        }
    }

    /// Advertised hostname: configured or detected.
    pub fn resolve_host_id(&self) -> String {
        if let Some(host) = &self.host_id {
            return host.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    pub fn sync_delta_duration(&self) -> Duration {
        Duration::from_secs(self.sync_delta)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let mut overrides = BTreeMap::new();
        for (tenant, share) in &self.shares_overrides {
            if let Ok(tenant) = crate::core::identity::TenantId::new(tenant.clone()) {
                overrides.insert(tenant, *share);
            }
        }
        SchedulerConfig {
            default_share: self.shares.max(1),
            share_overrides: overrides,
            ..SchedulerConfig::default()
        }
    }

    pub fn persister_config(&self) -> PersisterConfig {
        PersisterConfig {
            interval_ops: self.snapshot.interval_ops,
            interval: Duration::from_secs(self.snapshot.interval_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.sync_delta, 180);
        assert_eq!(config.sync_max, 1000);
        assert_eq!(config.shares, 1);
        assert!(!config.peer_strict);
        assert_eq!(config.snapshot.interval_ops, 1_000);
        assert_eq!(config.reconnect.backoff_base_ms, 250);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            peer_id = "p1"
            peer_secret = "shh"
            sync_max = 64

            [[peers]]
            peer_id = "p2"
            url = "ws://10.0.0.2:7700"
            "#,
        )
        .unwrap();
        assert_eq!(config.peer_id.as_deref(), Some("p1"));
        assert_eq!(config.sync_max, 64);
        assert_eq!(config.sync_delta, 180);
        assert_eq!(config.peers.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn peers_without_secret_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[peers]]
            peer_id = "p2"
            url = "ws://10.0.0.2:7700"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn share_overrides_reach_scheduler_config() {
        let config: Config = toml::from_str(
            r#"
            shares = 2

            [shares_overrides]
            "big-tenant" = 8
            "#,
        )
        .unwrap();
        let sched = config.scheduler_config();
        assert_eq!(sched.default_share, 2);
        assert_eq!(
            sched
                .share_overrides
                .get(&crate::core::identity::TenantId::new("big-tenant").unwrap()),
            Some(&8)
        );
    }

    #[test]
    fn generated_peer_id_when_unset() {
        let config = Config::default();
        let a = config.resolve_peer_id().unwrap();
        let b = config.resolve_peer_id().unwrap();
        assert_ne!(a, b);
    }
}
