//! Keel feedback: request/ACK/NACK counters per subscriber, pending-nonce markers and the
//! failure ratio the external taint policy reads.
//!
//! Counters exist in two series per observation: one keyed by the concrete version and one
//! keyed by [`ANY_VERSION`] that aggregates all versions.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_core::ResourceType;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

mod backoff;

pub use backoff::{Backoff, DEFAULT_FIRST_PAUSE, DEFAULT_TABLE_MS};

/// Version component of the aggregate series.
pub const ANY_VERSION: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    Requests,
    Acks,
    Nacks,
    /// Marker; the key's version component holds the nonce, the value the pushed version.
    PendingNonce,
    /// Marker holding the last version the subscriber ACKed.
    AckedVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedbackKey {
    pub node_id: String,
    pub resource_type: ResourceType,
    pub version: String,
    pub subscriber_id: String,
    pub stat: Stat,
}

impl FeedbackKey {
    pub fn new(node_id: &str, rt: ResourceType, version: &str, subscriber_id: &str, stat: Stat) -> Self {
        Self {
            node_id: node_id.to_string(),
            resource_type: rt,
            version: version.to_string(),
            subscriber_id: subscriber_id.to_string(),
            stat,
        }
    }
}

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Marker { value: String, expires_at: Option<Instant> },
}

impl Value {
    fn expired(&self, now: Instant) -> bool {
        matches!(self, Value::Marker { expires_at: Some(at), .. } if *at <= now)
    }
}

/// Subscriber liveness notifications from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Gone(String),
}

/// Concurrency-safe feedback store. Process lifetime, advisory only.
#[derive(Default)]
pub struct FeedbackStore {
    entries: DashMap<FeedbackKey, Value>,
}

impl FeedbackStore {
    pub fn new() -> Self { Self::default() }

    fn incr(&self, key: FeedbackKey) -> u64 {
        let mut slot = self.entries.entry(key).or_insert(Value::Counter(0));
        match slot.value_mut() {
            Value::Counter(n) => {
                *n += 1;
                *n
            }
            other => {
                *other = Value::Counter(1);
                1
            }
        }
    }

    fn incr_both(&self, node_id: &str, rt: ResourceType, version: &str, sub: &str, stat: Stat) -> u64 {
        self.incr(FeedbackKey::new(node_id, rt, ANY_VERSION, sub, stat));
        if version.is_empty() || version == ANY_VERSION {
            return 0;
        }
        self.incr(FeedbackKey::new(node_id, rt, version, sub, stat))
    }

    pub fn report_request(&self, node_id: &str, rt: ResourceType, version: &str, sub: &str) {
        self.incr_both(node_id, rt, version, sub, Stat::Requests);
        counter!("xds_requests_total", 1u64, "node" => node_id.to_string(), "type" => rt.as_str(), "subscriber" => sub.to_string());
    }

    pub fn report_ack(&self, node_id: &str, rt: ResourceType, version: &str, sub: &str) {
        self.incr_both(node_id, rt, version, sub, Stat::Acks);
        counter!("xds_acks_total", 1u64, "node" => node_id.to_string(), "type" => rt.as_str(), "subscriber" => sub.to_string());
        let key = FeedbackKey::new(node_id, rt, ANY_VERSION, sub, Stat::AckedVersion);
        let prev = self.entries.insert(key, Value::Marker { value: version.to_string(), expires_at: None });
        if let Some(Value::Marker { value: old, .. }) = prev {
            if old != version {
                gauge!("xds_acked_version_info", 0.0, "node" => node_id.to_string(), "type" => rt.as_str(), "subscriber" => sub.to_string(), "version" => old);
            }
        }
        gauge!("xds_acked_version_info", 1.0, "node" => node_id.to_string(), "type" => rt.as_str(), "subscriber" => sub.to_string(), "version" => version.to_string());
    }

    /// Returns the subscriber's NACK count for `version` after this observation.
    pub fn report_nack(&self, node_id: &str, rt: ResourceType, version: &str, sub: &str) -> u64 {
        let n = self.incr_both(node_id, rt, version, sub, Stat::Nacks);
        counter!("xds_nacks_total", 1u64, "node" => node_id.to_string(), "type" => rt.as_str(), "subscriber" => sub.to_string());
        n
    }

    /// Remember which version a pushed nonce carried, for `ttl`.
    pub fn record_pending_nonce(&self, node_id: &str, rt: ResourceType, sub: &str, nonce: &str, version: &str, ttl: Duration) {
        let key = FeedbackKey::new(node_id, rt, nonce, sub, Stat::PendingNonce);
        self.entries.insert(key, Value::Marker { value: version.to_string(), expires_at: Some(Instant::now() + ttl) });
    }

    /// Consume a pending-nonce marker, returning the version it was recorded with.
    pub fn take_pending_nonce(&self, node_id: &str, rt: ResourceType, sub: &str, nonce: &str) -> Option<String> {
        let key = FeedbackKey::new(node_id, rt, nonce, sub, Stat::PendingNonce);
        let now = Instant::now();
        match self.entries.remove(&key) {
            Some((_, v)) if v.expired(now) => None,
            Some((_, Value::Marker { value, .. })) => Some(value),
            _ => None,
        }
    }

    /// Drop a pending-nonce marker without reading it (stream closed or push superseded).
    pub fn abandon_pending_nonce(&self, node_id: &str, rt: ResourceType, sub: &str, nonce: &str) {
        self.entries.remove(&FeedbackKey::new(node_id, rt, nonce, sub, Stat::PendingNonce));
    }

    pub fn counter(&self, key: &FeedbackKey) -> u64 {
        match self.entries.get(key).map(|v| v.value().clone()) {
            Some(Value::Counter(n)) => n,
            _ => 0,
        }
    }

    pub fn failure_count(&self, node_id: &str, rt: ResourceType, version: &str, sub: &str) -> u64 {
        self.counter(&FeedbackKey::new(node_id, rt, version, sub, Stat::Nacks))
    }

    pub fn acked_version(&self, node_id: &str, rt: ResourceType, sub: &str) -> Option<String> {
        match self.entries.get(&FeedbackKey::new(node_id, rt, ANY_VERSION, sub, Stat::AckedVersion)).map(|v| v.value().clone()) {
            Some(Value::Marker { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Subscribers that have sent at least one request for `(node, type)`.
    pub fn subscribers(&self, node_id: &str, rt: ResourceType) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|e| {
                let k = e.key();
                k.stat == Stat::Requests && k.version == ANY_VERSION && k.resource_type == rt && k.node_id == node_id
            })
            .filter(|e| matches!(e.value(), Value::Counter(n) if *n > 0))
            .map(|e| e.key().subscriber_id.clone())
            .collect()
    }

    /// Share of the type's subscribers that NACKed `version`. Zero subscribers yield 0.
    pub fn percent_failing(&self, node_id: &str, rt: ResourceType, version: &str) -> f64 {
        let subscribed = self.subscribers(node_id, rt);
        if subscribed.is_empty() {
            return 0.0;
        }
        let nacking = subscribed
            .iter()
            .filter(|sub| self.failure_count(node_id, rt, version, sub) > 0)
            .count();
        nacking as f64 / subscribed.len() as f64
    }

    /// Remove every key belonging to `subscriber_id`. Returns the number removed.
    pub fn garbage_collect(&self, subscriber_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| {
            if k.subscriber_id != subscriber_id {
                return true;
            }
            if let (Stat::AckedVersion, Value::Marker { value, .. }) = (k.stat, &*v) {
                gauge!("xds_acked_version_info", 0.0, "node" => k.node_id.clone(), "type" => k.resource_type.as_str(), "subscriber" => k.subscriber_id.clone(), "version" => value.clone());
            }
            false
        });
        let removed = before.saturating_sub(self.entries.len());
        counter!("feedback_gc_keys_total", removed as u64);
        debug!(subscriber = %subscriber_id, removed, "feedback: garbage collected");
        removed
    }

    /// Drop markers whose TTL elapsed. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

/// Consume liveness events and collect keys of subscribers reported gone.
pub fn spawn_gc(store: Arc<FeedbackStore>, mut rx: mpsc::Receiver<LivenessEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                LivenessEvent::Gone(sub) => {
                    let removed = store.garbage_collect(&sub);
                    let expired = store.purge_expired();
                    debug!(subscriber = %sub, removed, expired, "feedback: subscriber gone");
                }
            }
        }
        info!("feedback gc loop stopped");
    })
}
