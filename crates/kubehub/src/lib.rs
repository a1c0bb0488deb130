//! Keel kubehub: revision and desired-state records kept as custom resources, and the
//! watchers that feed the reconciler and the feedback GC.
//!
//! Both kinds live in `keel.dev/v1alpha1` and are handled as `DynamicObject`s; the record
//! itself is the object's `spec`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use keel_core::{ProxyState, RevisionPatch, RevisionRecord};
use keel_revision::RevisionBackend;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

mod watch;

pub use watch::{start_watcher, watch_pods, ConfigEvent};

pub const GROUP: &str = "keel.dev";
pub const VERSION: &str = "v1alpha1";
pub const REVISION_KIND: &str = "ProxyRevision";
pub const CONFIG_KIND: &str = "ProxyConfig";
pub const FIELD_MANAGER: &str = "keel";
/// Label on `ProxyRevision` objects carrying the owning node's [`config_name`].
pub const NODE_LABEL: &str = "keel.dev/node";

pub fn revision_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, REVISION_KIND), "proxyrevisions")
}

pub fn config_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, CONFIG_KIND), "proxyconfigs")
}

/// Object name of a node's desired-state record (DNS-1123 label).
pub fn config_name(node_id: &str) -> String {
    let mut name: String = node_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    name.truncate(63);
    let name = name.trim_matches('-');
    if name.is_empty() { "node".to_string() } else { name.to_string() }
}

pub(crate) fn spec_of<T: DeserializeOwned>(obj: &DynamicObject) -> Result<T> {
    let spec = obj
        .data
        .get("spec")
        .ok_or_else(|| anyhow!("object {} has no spec", obj.metadata.name.as_deref().unwrap_or("?")))?;
    serde_json::from_value(spec.clone()).context("decoding spec")
}

fn object_with_spec<T: Serialize>(ar: &ApiResource, namespace: &str, name: &str, spec: &T) -> Result<DynamicObject> {
    let mut obj = DynamicObject::new(name, ar).within(namespace);
    obj.data = serde_json::json!({ "spec": serde_json::to_value(spec)? });
    Ok(obj)
}

fn revision_object(namespace: &str, rec: &RevisionRecord) -> Result<DynamicObject> {
    let mut obj = object_with_spec(&revision_resource(), namespace, &rec.name, rec)?;
    obj.metadata.labels = Some(BTreeMap::from([(NODE_LABEL.to_string(), config_name(&rec.node_id))]));
    Ok(obj)
}

/// Label selector for one node's revisions. Sanitized names can collide, so callers still
/// check `spec.nodeId`.
fn node_selector(node_id: &str) -> ListParams {
    ListParams::default().labels(&format!("{}={}", NODE_LABEL, config_name(node_id)))
}

/// Merge-patch body carrying only the fields the patch sets.
fn revision_patch_body(patch: &RevisionPatch) -> Result<serde_json::Value> {
    let mut spec = serde_json::Map::new();
    if let Some(t) = patch.tainted {
        spec.insert("tainted".into(), t.into());
    }
    if let Some(p) = patch.published {
        spec.insert("published".into(), p.into());
    }
    if let Some(ts) = patch.last_published_at {
        spec.insert("lastPublishedAt".into(), serde_json::to_value(ts)?);
    }
    Ok(serde_json::json!({ "spec": spec }))
}

/// Merge-patch body for the control-plane-owned part of a desired-state record. The bundle is
/// authored elsewhere and left alone.
fn state_patch_body(state: &ProxyState) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "spec": {
            "desiredVersion": state.desired_version,
            "publishedVersion": state.published_version,
            "cacheState": state.cache_state,
            "revisionHistory": serde_json::to_value(&state.revision_history)?,
        }
    }))
}

fn manager_params() -> PatchParams {
    PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() }
}

async fn delete_ignoring_missing(api: &Api<DynamicObject>, name: &str) -> Result<()> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e).with_context(|| format!("deleting {}", name)),
    }
}

/// Revision backend over `ProxyRevision` and `ProxyConfig` objects in one namespace.
pub struct KubeBackend {
    namespace: String,
    revisions: Api<DynamicObject>,
    configs: Api<DynamicObject>,
    config_ar: ApiResource,
}

impl KubeBackend {
    pub fn new(client: Client, namespace: &str) -> Self {
        let config_ar = config_resource();
        Self {
            namespace: namespace.to_string(),
            revisions: Api::namespaced_with(client.clone(), namespace, &revision_resource()),
            configs: Api::namespaced_with(client, namespace, &config_ar),
            config_ar,
        }
    }

    pub async fn try_default(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    async fn node_revisions(&self, node_id: &str) -> Result<Vec<RevisionRecord>> {
        let list = self.revisions.list(&node_selector(node_id)).await.context("listing revisions")?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            match spec_of::<RevisionRecord>(obj) {
                Ok(rec) => out.push(rec),
                Err(e) => {
                    counter!("kubehub_decode_errors_total", 1u64, "kind" => REVISION_KIND);
                    warn!(name = ?obj.metadata.name, error = %e, "kubehub: skipping malformed revision");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl RevisionBackend for KubeBackend {
    async fn list_revisions(&self, node_id: &str) -> Result<Vec<RevisionRecord>> {
        let mut out: Vec<RevisionRecord> = self.node_revisions(node_id).await?.into_iter().filter(|r| r.node_id == node_id).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create_revision(&self, rec: &RevisionRecord) -> Result<()> {
        let obj = revision_object(&self.namespace, rec)?;
        self.revisions
            .create(&PostParams::default(), &obj)
            .await
            .with_context(|| format!("creating revision {}", rec.name))?;
        counter!("kubehub_writes_total", 1u64, "kind" => REVISION_KIND);
        Ok(())
    }

    async fn patch_revision(&self, name: &str, patch: &RevisionPatch) -> Result<()> {
        let body = revision_patch_body(patch)?;
        self.revisions
            .patch(name, &manager_params(), &Patch::Merge(&body))
            .await
            .with_context(|| format!("patching revision {}", name))?;
        counter!("kubehub_writes_total", 1u64, "kind" => REVISION_KIND);
        Ok(())
    }

    async fn delete_revision(&self, name: &str) -> Result<()> {
        delete_ignoring_missing(&self.revisions, name).await
    }

    async fn get_state(&self, node_id: &str) -> Result<Option<ProxyState>> {
        let Some(obj) = self.configs.get_opt(&config_name(node_id)).await? else { return Ok(None) };
        let state: ProxyState = spec_of(&obj)?;
        Ok((state.node_id == node_id).then_some(state))
    }

    async fn put_state(&self, state: &ProxyState) -> Result<()> {
        let name = config_name(&state.node_id);
        match self.configs.get_opt(&name).await? {
            Some(existing) => {
                let current: ProxyState = spec_of(&existing)?;
                if current.node_id != state.node_id {
                    bail!("object {} belongs to node {}, not {}", name, current.node_id, state.node_id);
                }
                let body = state_patch_body(state)?;
                self.configs
                    .patch(&name, &manager_params(), &Patch::Merge(&body))
                    .await
                    .with_context(|| format!("patching {}", name))?;
            }
            None => {
                let obj = object_with_spec(&self.config_ar, &self.namespace, &name, state)?;
                self.configs.create(&PostParams::default(), &obj).await.with_context(|| format!("creating {}", name))?;
            }
        }
        counter!("kubehub_writes_total", 1u64, "kind" => CONFIG_KIND);
        Ok(())
    }

    async fn delete_state(&self, node_id: &str) -> Result<()> {
        delete_ignoring_missing(&self.configs, &config_name(node_id)).await
    }

    async fn list_states(&self) -> Result<Vec<ProxyState>> {
        let list = self.configs.list(&ListParams::default()).await.context("listing proxy configs")?;
        Ok(list.items.iter().filter_map(|o| spec_of(o).ok()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{CacheState, HistoryEntry, ResourceBundle, ResourceType};
    use serde_json::json;

    #[test]
    fn config_names_are_dns_labels() {
        assert_eq!(config_name("sidecar~10.0.0.1~web.default"), "sidecar-10-0-0-1-web-default");
        assert_eq!(config_name("~~"), "node");
        let long = "x".repeat(100);
        assert_eq!(config_name(&long).len(), 63);
    }

    #[test]
    fn records_travel_in_spec() {
        let bundle = ResourceBundle::new().with(ResourceType::Cluster, "c1", json!({ "lb": "rr" }));
        let rec = RevisionRecord::new("n1", "abc", bundle);
        let obj = object_with_spec(&revision_resource(), "keel", &rec.name, &rec).unwrap();
        assert_eq!(obj.metadata.namespace.as_deref(), Some("keel"));
        assert_eq!(obj.types.as_ref().map(|t| t.kind.as_str()), Some(REVISION_KIND));
        assert_eq!(obj.data["spec"]["nodeId"], "n1");
        let back: RevisionRecord = spec_of(&obj).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn revisions_are_labelled_with_their_node() {
        let rec = RevisionRecord::new("sidecar~10.0.0.1", "abc", ResourceBundle::new());
        let obj = revision_object("keel", &rec).unwrap();
        let labels = obj.metadata.labels.unwrap();
        assert_eq!(labels.get(NODE_LABEL).map(String::as_str), Some("sidecar-10-0-0-1"));
        assert_eq!(node_selector("sidecar~10.0.0.1").label_selector.as_deref(), Some("keel.dev/node=sidecar-10-0-0-1"));
    }

    #[test]
    fn revision_patch_only_sets_given_fields() {
        let body = revision_patch_body(&RevisionPatch { tainted: Some(true), ..Default::default() }).unwrap();
        assert_eq!(body, json!({ "spec": { "tainted": true } }));
    }

    #[test]
    fn state_patch_leaves_bundle_alone() {
        let mut st = ProxyState::new("n1", ResourceBundle::new().with(ResourceType::Listener, "l1", json!({})));
        st.desired_version = Some("v2".into());
        st.published_version = Some("v1".into());
        st.cache_state = CacheState::Rollback;
        st.revision_history.push(HistoryEntry { version: "v1".into(), revision_ref: "n1-v1".into() });
        let body = state_patch_body(&st).unwrap();
        assert!(body["spec"].get("bundle").is_none());
        assert_eq!(body["spec"]["cacheState"], "Rollback");
        assert_eq!(body["spec"]["revisionHistory"][0]["revisionRef"], "n1-v1");
    }
}
