//! Runtime settings read from `KEEL_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use keel_core::{WireVersion, DEFAULT_HISTORY_CAP};
use keel_feedback::{Backoff, DEFAULT_FIRST_PAUSE, DEFAULT_TABLE_MS};
use keel_xds::ServerConfig;
use serde::Serialize;
use tracing::warn;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:18000";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub wire: WireVersion,
    pub history_cap: usize,
    pub listen_addr: SocketAddr,
    pub nonce_ttl: Duration,
    pub shutdown_grace: Duration,
    pub resync: Duration,
    pub queue_cap: usize,
    pub metrics_addr: Option<String>,
    pub db_path: Option<String>,
    pub namespace: Option<String>,
    pub backoff_table_ms: Vec<u64>,
}

impl Default for Settings {
    fn default() -> Self { Self::from_lookup(|_| None) }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let num = |k: &str, d: u64| get(k).and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(d);
        let wire = match get("KEEL_WIRE_VERSION") {
            Some(s) => s.parse().unwrap_or_else(|e| {
                warn!(value = %s, error = %e, "settings: bad KEEL_WIRE_VERSION, using v3");
                WireVersion::V3
            }),
            None => WireVersion::V3,
        };
        let listen_addr = get("KEEL_LISTEN_ADDR")
            .and_then(|s| s.parse().ok())
            .or_else(|| DEFAULT_LISTEN_ADDR.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 18000)));
        let backoff_table_ms = get("KEEL_BACKOFF_TABLE_MS")
            .map(|s| s.split(',').filter_map(|p| p.trim().parse::<u64>().ok()).collect::<Vec<_>>())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TABLE_MS.to_vec());
        let non_empty = |k: &str| get(k).filter(|s| !s.trim().is_empty());
        Self {
            wire,
            history_cap: num("KEEL_HISTORY_CAP", DEFAULT_HISTORY_CAP as u64).max(1) as usize,
            listen_addr,
            nonce_ttl: Duration::from_secs(num("KEEL_NONCE_TTL_SECS", 30)),
            shutdown_grace: Duration::from_secs(num("KEEL_SHUTDOWN_GRACE_SECS", 5)),
            resync: Duration::from_secs(num("KEEL_RESYNC_SECS", 300).max(1)),
            queue_cap: num("KEEL_QUEUE_CAP", 1024).max(1) as usize,
            metrics_addr: non_empty("KEEL_METRICS_ADDR"),
            db_path: non_empty("KEEL_DB_PATH"),
            namespace: non_empty("KEEL_NAMESPACE"),
            backoff_table_ms,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_table_ms.clone(), DEFAULT_FIRST_PAUSE)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig { nonce_ttl: self.nonce_ttl, backoff: self.backoff(), ..ServerConfig::default() }
    }
}
