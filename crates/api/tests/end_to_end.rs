#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_api::{ControlPlane, Settings};
use keel_core::{CacheState, KeelError, ProxyState, ResourceBundle, ResourceType};
use keel_kubehub::ConfigEvent;
use keel_revision::{MemoryBackend, RevisionBackend};
use serde_json::json;
use tokio::sync::{mpsc, watch};

fn endpoints(names: &[&str]) -> ResourceBundle {
    let mut b = ResourceBundle::new();
    for n in names {
        b.insert(ResourceType::Endpoint, *n, json!({ "cluster_name": n, "endpoints": [] }));
    }
    b
}

fn plane() -> (Arc<ControlPlane>, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let cp = Arc::new(ControlPlane::new(backend.clone(), &Settings::default()));
    (cp, backend)
}

fn served_names(cp: &ControlPlane, node: &str) -> Vec<String> {
    let snap = cp.cache().get_snapshot(node).unwrap();
    snap.items(ResourceType::Endpoint).map(|m| m.keys().cloned().collect()).unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_dedupes_and_appends_revisions() {
    let (cp, backend) = plane();

    let first = cp.publish("n1", endpoints(&["e1"])).await.unwrap();
    let ver1 = first.desired_version.clone();
    assert_eq!(first.published_version, ver1);
    assert_eq!(first.cache_state, CacheState::InSync);
    assert_eq!(backend.list_revisions("n1").await.unwrap().len(), 1);

    let again = cp.publish("n1", endpoints(&["e1"])).await.unwrap();
    assert_eq!(again.desired_version, ver1);
    assert!(!again.snapshot_replaced);
    assert_eq!(backend.list_revisions("n1").await.unwrap().len(), 1);
    let st = cp.status("n1").await.unwrap();
    assert_eq!(st.history, vec![ver1.clone()]);

    let second = cp.publish("n1", endpoints(&["e1", "e2"])).await.unwrap();
    let ver2 = second.desired_version.clone();
    assert_ne!(ver2, ver1);
    assert_eq!(second.published_version, ver2);
    let st = cp.status("n1").await.unwrap();
    assert_eq!(st.history, vec![ver1.clone(), ver2.clone()]);
    assert_eq!(st.published_version.as_deref(), Some(ver2.as_str()));
    assert_eq!(served_names(&cp, "n1"), vec!["e1", "e2"]);

    let published: Vec<String> = backend
        .list_revisions("n1")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.published)
        .map(|r| r.version)
        .collect();
    assert_eq!(published, vec![ver2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn taint_rolls_back_then_exhausts() {
    let (cp, _backend) = plane();
    let ver1 = cp.publish("n1", endpoints(&["e1"])).await.unwrap().desired_version;
    let ver2 = cp.publish("n1", endpoints(&["e1", "e2"])).await.unwrap().desired_version;

    let rolled = cp.taint("n1", &ver2, true).await.unwrap();
    assert_eq!(rolled.published_version, ver1);
    assert_eq!(rolled.desired_version, ver2);
    assert_eq!(rolled.cache_state, CacheState::Rollback);
    assert!(rolled.snapshot_replaced);
    assert_eq!(served_names(&cp, "n1"), vec!["e1"]);

    let hist = cp.history("n1").await.unwrap();
    assert_eq!(hist.iter().map(|h| (h.tainted, h.published)).collect::<Vec<_>>(), vec![(false, true), (true, false)]);

    let err = cp.taint("n1", &ver1, true).await.unwrap_err();
    assert_eq!(err, KeelError::AllRevisionsTainted("n1".into()));
    let st = cp.status("n1").await.unwrap();
    assert_eq!(st.cache_state, CacheState::RollbackFailed);
    assert_eq!(st.published_version.as_deref(), Some(ver1.as_str()));
    assert_eq!(served_names(&cp, "n1"), vec!["e1"], "last good snapshot stays served");

    let back = cp.taint("n1", &ver2, false).await.unwrap();
    assert_eq!(back.cache_state, CacheState::InSync);
    assert_eq!(served_names(&cp, "n1"), vec!["e1", "e2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inconsistent_bundle_is_not_served() {
    let (cp, _backend) = plane();
    let good = ResourceBundle::new()
        .with(ResourceType::Route, "r1", json!({ "name": "r1" }))
        .with(ResourceType::Listener, "l1", json!({ "rds": { "route_config_name": "r1" } }));
    let v1 = cp.publish("n1", good).await.unwrap().published_version;

    let bad = ResourceBundle::new().with(ResourceType::Listener, "l1", json!({ "rds": { "route_config_name": "missing" } }));
    let err = cp.publish("n1", bad).await.unwrap_err();
    assert!(matches!(err, KeelError::Inconsistent(_)), "{err:?}");

    let snap = cp.cache().get_snapshot("n1").unwrap();
    assert!(snap.items(ResourceType::Route).map(|m| m.contains_key("r1")).unwrap_or(false));
    assert_eq!(cp.status("n1").await.unwrap().published_version, Some(v1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn history_cap_collects_old_revisions() {
    let backend = Arc::new(MemoryBackend::new());
    let settings = Settings { history_cap: 3, ..Settings::default() };
    let cp = ControlPlane::new(backend.clone(), &settings);
    let mut versions = Vec::new();
    for i in 0..5 {
        let name = format!("e{}", i);
        versions.push(cp.publish("n1", endpoints(&[name.as_str()])).await.unwrap().desired_version);
    }
    let st = cp.status("n1").await.unwrap();
    assert_eq!(st.history, versions[2..].to_vec());
    let mut kept: Vec<String> = backend.list_revisions("n1").await.unwrap().into_iter().map(|r| r.version).collect();
    kept.sort();
    let mut want = versions[2..].to_vec();
    want.sort();
    assert_eq!(kept, want);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_publishes_for_one_node_serialize() {
    let (cp, backend) = plane();
    let mut tasks = Vec::new();
    for i in 0..8 {
        let cp = Arc::clone(&cp);
        tasks.push(tokio::spawn(async move { cp.publish("n1", endpoints(&[if i % 2 == 0 { "a" } else { "b" }])).await }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }
    assert_eq!(backend.list_revisions("n1").await.unwrap().len(), 2);
    assert_eq!(cp.status("n1").await.unwrap().history.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_events_drive_serving_and_teardown() {
    let (cp, backend) = plane();
    let (tx, rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = watch::channel(false);
    let loop_task = tokio::spawn(Arc::clone(&cp).drive(rx, Duration::from_secs(3600), stop_rx));

    tx.send(ConfigEvent::Applied(ProxyState::new("n7", endpoints(&["e1"])))).await.unwrap();
    for _ in 0..200 {
        if cp.cache().get_snapshot("n7").is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(served_names(&cp, "n7"), vec!["e1"]);

    tx.send(ConfigEvent::Deleted("n7".into())).await.unwrap();
    for _ in 0..200 {
        if cp.cache().get_snapshot("n7").is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cp.cache().get_snapshot("n7").is_err());
    assert!(backend.list_revisions("n7").await.unwrap().is_empty());
    assert_eq!(backend.get_state("n7").await.unwrap(), None);

    stop_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(2), loop_task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_restores_served_state() {
    let backend = Arc::new(MemoryBackend::new());
    let first = ControlPlane::new(backend.clone(), &Settings::default());
    first.publish("n1", endpoints(&["e1"])).await.unwrap();
    first.publish("n2", endpoints(&["e2"])).await.unwrap();

    let restarted = ControlPlane::new(backend, &Settings::default());
    assert!(restarted.cache().get_snapshot("n1").is_err());
    assert_eq!(restarted.resync_all().await.unwrap(), 0);
    assert_eq!(served_names(&restarted, "n1"), vec!["e1"]);
    assert_eq!(served_names(&restarted, "n2"), vec!["e2"]);
    assert_eq!(restarted.stats().served_nodes, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_drops_the_node_lock() {
    let (cp, _backend) = plane();
    for i in 0..10 {
        let node = format!("n{}", i);
        cp.publish(&node, endpoints(&["e1"])).await.unwrap();
    }
    assert_eq!(cp.locked_nodes(), 10);
    for i in 0..10 {
        cp.teardown(&format!("n{}", i)).await.unwrap();
    }
    assert_eq!(cp.locked_nodes(), 0);
    assert_eq!(cp.stats().served_nodes, 0);

    // a node published again after teardown gets a fresh lock
    cp.publish("n1", endpoints(&["e2"])).await.unwrap();
    assert_eq!(cp.locked_nodes(), 1);
}
