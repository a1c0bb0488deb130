//! Discovery protocol messages exchanged on a subscriber stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identity a proxy presents when subscribing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Rejection detail attached to a NACK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Last version the subscriber accepted ("" before the first ACK).
    #[serde(default)]
    pub version_info: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    pub type_url: String,
    /// Nonce of the response this request answers ("" on a fresh subscription).
    #[serde(default)]
    pub response_nonce: String,
    #[serde(default)]
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedResource {
    pub name: String,
    pub resource: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<NamedResource>,
    pub type_url: String,
    pub nonce: String,
}
