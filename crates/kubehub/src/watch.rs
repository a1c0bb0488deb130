//! List+watch loops for desired-state records and proxy pods.

use std::collections::HashSet;

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use keel_core::ProxyState;
use keel_feedback::LivenessEvent;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{config_resource, spec_of, CONFIG_KIND};

/// Desired-state change observed in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    Applied(ProxyState),
    /// Node ID whose record went away.
    Deleted(String),
}

fn config_event(obj: &DynamicObject, deleted: bool) -> Option<ConfigEvent> {
    match spec_of::<ProxyState>(obj) {
        Ok(state) if deleted => Some(ConfigEvent::Deleted(state.node_id)),
        Ok(state) => Some(ConfigEvent::Applied(state)),
        Err(e) => {
            counter!("kubehub_decode_errors_total", 1u64, "kind" => CONFIG_KIND);
            warn!(name = ?obj.metadata.name, error = %e, "kubehub: skipping malformed proxy config");
            None
        }
    }
}

/// Stream `ProxyConfig` changes into `tx` until the receiver goes away or the watch fails.
pub async fn start_watcher(client: Client, namespace: Option<&str>, tx: mpsc::Sender<ConfigEvent>) -> Result<()> {
    let ar = config_resource();
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(kind = CONFIG_KIND, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let events: Vec<ConfigEvent> = match ev {
            Event::Applied(o) => config_event(&o, false).into_iter().collect(),
            Event::Deleted(o) => config_event(&o, true).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                list.iter().filter_map(|o| config_event(o, false)).collect()
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                info!("config receiver gone; watcher stopping");
                return Ok(());
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}

fn pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Report pods that were deleted or finished as [`LivenessEvent::Gone`], by pod name.
pub async fn watch_pods(client: Client, namespace: Option<&str>, tx: mpsc::Sender<LivenessEvent>) -> Result<()> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    let mut live: HashSet<String> = HashSet::new();
    info!(ns = ?namespace, "pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        let mut gone = Vec::new();
        match ev {
            Event::Applied(p) => {
                let Some(name) = p.metadata.name.clone() else { continue };
                if pod_finished(&p) {
                    live.remove(&name);
                    gone.push(name);
                } else {
                    live.insert(name);
                }
            }
            Event::Deleted(p) => {
                if let Some(name) = p.metadata.name.clone() {
                    live.remove(&name);
                    gone.push(name);
                }
            }
            Event::Restarted(list) => {
                let now: HashSet<String> = list
                    .iter()
                    .filter(|p| !pod_finished(p))
                    .filter_map(|p| p.metadata.name.clone())
                    .collect();
                gone.extend(live.difference(&now).cloned());
                live = now;
            }
        }
        for name in gone {
            debug!(pod = %name, "pod gone");
            if tx.send(LivenessEvent::Gone(name)).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use keel_core::ResourceBundle;

    #[test]
    fn finished_pods_count_as_gone() {
        let mut pod = Pod::default();
        assert!(!pod_finished(&pod));
        pod.status = Some(PodStatus { phase: Some("Running".into()), ..Default::default() });
        assert!(!pod_finished(&pod));
        pod.status = Some(PodStatus { phase: Some("Failed".into()), ..Default::default() });
        assert!(pod_finished(&pod));
    }

    #[test]
    fn config_events_carry_node_ids() {
        let mut obj = DynamicObject::new("n1", &config_resource());
        obj.data = serde_json::json!({ "spec": ProxyState::new("n1", ResourceBundle::new()) });
        assert_eq!(config_event(&obj, true), Some(ConfigEvent::Deleted("n1".into())));
        assert!(matches!(config_event(&obj, false), Some(ConfigEvent::Applied(s)) if s.node_id == "n1"));

        obj.data = serde_json::json!({ "spec": { "unexpected": 1 } });
        assert_eq!(config_event(&obj, false), None);
    }
}
