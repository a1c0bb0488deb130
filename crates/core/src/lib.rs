//! Keel core types: resource bundles, revision records, proxy state and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod hash;
pub mod wire;

pub use hash::{hash_bundle, hash_items};

/// Default bound for a node's revision history.
pub const DEFAULT_HISTORY_CAP: usize = 10;

/// Label used when a subscriber does not present identity metadata.
pub const UNKNOWN: &str = "unknown";

/// Resource type tags. Declaration order is the canonical order used when hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Endpoint,
    Cluster,
    Route,
    ScopedRoute,
    VirtualHost,
    Listener,
    Secret,
    Runtime,
    ExtensionConfig,
}

impl ResourceType {
    pub const ALL: [ResourceType; 9] = [
        ResourceType::Endpoint,
        ResourceType::Cluster,
        ResourceType::Route,
        ResourceType::ScopedRoute,
        ResourceType::VirtualHost,
        ResourceType::Listener,
        ResourceType::Secret,
        ResourceType::Runtime,
        ResourceType::ExtensionConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Endpoint => "endpoint",
            ResourceType::Cluster => "cluster",
            ResourceType::Route => "route",
            ResourceType::ScopedRoute => "scoped_route",
            ResourceType::VirtualHost => "virtual_host",
            ResourceType::Listener => "listener",
            ResourceType::Secret => "secret",
            ResourceType::Runtime => "runtime",
            ResourceType::ExtensionConfig => "extension_config",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| KeelError::UnsupportedType(s.to_string()))
    }
}

/// Discovery protocol major version. Decides the slot table and the per-type version rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    V2,
    #[default]
    V3,
}

const V2_SLOTS: [ResourceType; 6] = [
    ResourceType::Endpoint,
    ResourceType::Cluster,
    ResourceType::Route,
    ResourceType::Listener,
    ResourceType::Secret,
    ResourceType::Runtime,
];

impl WireVersion {
    /// Resource types with a slot in snapshots of this version.
    pub fn slots(&self) -> &'static [ResourceType] {
        match self {
            WireVersion::V2 => &V2_SLOTS,
            WireVersion::V3 => &ResourceType::ALL,
        }
    }

    /// Slot index for a type, `None` when the version has no slot for it.
    pub fn slot_index(&self, rt: ResourceType) -> Option<usize> {
        self.slots().iter().position(|t| *t == rt)
    }

    /// V3 derives a type's version from its items; V2 takes the caller's string.
    pub fn recomputes_versions(&self) -> bool {
        matches!(self, WireVersion::V3)
    }

    pub fn type_url(&self, rt: ResourceType) -> Option<&'static str> {
        let url = match (self, rt) {
            (WireVersion::V2, ResourceType::Endpoint) => "type.googleapis.com/envoy.api.v2.ClusterLoadAssignment",
            (WireVersion::V2, ResourceType::Cluster) => "type.googleapis.com/envoy.api.v2.Cluster",
            (WireVersion::V2, ResourceType::Route) => "type.googleapis.com/envoy.api.v2.RouteConfiguration",
            (WireVersion::V2, ResourceType::Listener) => "type.googleapis.com/envoy.api.v2.Listener",
            (WireVersion::V2, ResourceType::Secret) => "type.googleapis.com/envoy.api.v2.auth.Secret",
            (WireVersion::V2, ResourceType::Runtime) => "type.googleapis.com/envoy.service.discovery.v2.Runtime",
            (WireVersion::V2, _) => return None,
            (WireVersion::V3, ResourceType::Endpoint) => "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
            (WireVersion::V3, ResourceType::Cluster) => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            (WireVersion::V3, ResourceType::Route) => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            (WireVersion::V3, ResourceType::ScopedRoute) => "type.googleapis.com/envoy.config.route.v3.ScopedRouteConfiguration",
            (WireVersion::V3, ResourceType::VirtualHost) => "type.googleapis.com/envoy.config.route.v3.VirtualHost",
            (WireVersion::V3, ResourceType::Listener) => "type.googleapis.com/envoy.config.listener.v3.Listener",
            (WireVersion::V3, ResourceType::Secret) => "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
            (WireVersion::V3, ResourceType::Runtime) => "type.googleapis.com/envoy.service.runtime.v3.Runtime",
            (WireVersion::V3, ResourceType::ExtensionConfig) => "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig",
        };
        Some(url)
    }

    /// Inverse of [`WireVersion::type_url`].
    pub fn resource_type(&self, type_url: &str) -> Option<ResourceType> {
        self.slots().iter().copied().find(|rt| self.type_url(*rt) == Some(type_url))
    }
}

impl std::str::FromStr for WireVersion {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v2" | "2" => Ok(WireVersion::V2),
            "v3" | "3" => Ok(WireVersion::V3),
            other => Err(KeelError::Invalid(format!("unknown wire version: {}", other))),
        }
    }
}

/// Named, opaque resource payloads keyed by type. Treated as immutable once hashed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceBundle(BTreeMap<ResourceType, BTreeMap<String, serde_json::Value>>);

impl ResourceBundle {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, rt: ResourceType, name: impl Into<String>, payload: serde_json::Value) -> Self {
        self.insert(rt, name, payload);
        self
    }

    pub fn insert(&mut self, rt: ResourceType, name: impl Into<String>, payload: serde_json::Value) {
        self.0.entry(rt).or_default().insert(name.into(), payload);
    }

    pub fn items(&self, rt: ResourceType) -> Option<&BTreeMap<String, serde_json::Value>> { self.0.get(&rt) }

    pub fn types(&self) -> impl Iterator<Item = ResourceType> + '_ { self.0.keys().copied() }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceType, &BTreeMap<String, serde_json::Value>)> { self.0.iter() }

    pub fn is_empty(&self) -> bool { self.0.values().all(|m| m.is_empty()) }

    /// Total number of named resources across all types.
    pub fn len(&self) -> usize { self.0.values().map(|m| m.len()).sum() }
}

/// How a revision's bundle is serialized in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    Yaml,
}

/// One content-addressed configuration bundle and its taint/publish status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    /// Store-level name; used as the opaque reference in histories.
    pub name: String,
    pub node_id: String,
    pub version: String,
    #[serde(default)]
    pub serialization_format: SerializationFormat,
    pub bundle: ResourceBundle,
    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub published: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_published_at: Option<DateTime<Utc>>,
}

impl RevisionRecord {
    pub fn new(node_id: &str, version: &str, bundle: ResourceBundle) -> Self {
        Self {
            name: revision_name(node_id, version),
            node_id: node_id.to_string(),
            version: version.to_string(),
            serialization_format: SerializationFormat::Json,
            bundle,
            tainted: false,
            published: false,
            created_at: Utc::now(),
            last_published_at: None,
        }
    }
}

/// Store-safe record name for `(node, version)`: lowercase alnum and '-', at most 63 chars.
pub fn revision_name(node_id: &str, version: &str) -> String {
    let mut node: String = node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let ver: String = version
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    node.truncate(63usize.saturating_sub(ver.len() + 1));
    let node = node.trim_matches('-');
    format!("{}-{}", if node.is_empty() { "node" } else { node }, ver.trim_matches('-'))
}

/// Field changes applied to a revision record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionPatch {
    pub tainted: Option<bool>,
    pub published: Option<bool>,
    pub last_published_at: Option<DateTime<Utc>>,
}

impl RevisionPatch {
    pub fn apply(&self, rec: &mut RevisionRecord) {
        if let Some(t) = self.tainted { rec.tainted = t; }
        if let Some(p) = self.published { rec.published = p; }
        if let Some(ts) = self.last_published_at { rec.last_published_at = Some(ts); }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub version: String,
    pub revision_ref: String,
}

/// Served-versus-desired status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CacheState {
    #[default]
    InSync,
    Rollback,
    RollbackFailed,
}

/// Desired-state record for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyState {
    pub node_id: String,
    pub bundle: ResourceBundle,
    #[serde(default)]
    pub desired_version: Option<String>,
    #[serde(default)]
    pub published_version: Option<String>,
    #[serde(default)]
    pub cache_state: CacheState,
    #[serde(default)]
    pub revision_history: Vec<HistoryEntry>,
}

impl ProxyState {
    pub fn new(node_id: &str, bundle: ResourceBundle) -> Self {
        Self { node_id: node_id.to_string(), bundle, ..Default::default() }
    }

    pub fn history_versions(&self) -> Vec<&str> {
        self.revision_history.iter().map(|e| e.version.as_str()).collect()
    }
}

/// Errors surfaced by the control-plane core.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("duplicate revision: {count} records for node {node_id} version {version}")]
    DuplicateRevision { node_id: String, version: String, count: usize },
    #[error("all revisions tainted for node {0}")]
    AllRevisionsTainted(String),
    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),
    #[error("unsupported resource type: {0}")]
    UnsupportedType(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl KeelError {
    pub fn backend(e: impl std::fmt::Display) -> Self { KeelError::Backend(e.to_string()) }
}

pub type KeelResult<T> = Result<T, KeelError>;

pub mod prelude {
    pub use super::{
        CacheState, HistoryEntry, KeelError, KeelResult, ProxyState, ResourceBundle, ResourceType,
        RevisionPatch, RevisionRecord, SerializationFormat, WireVersion,
    };
}
