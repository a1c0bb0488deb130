//! Keel control-plane facade (in-process).
//!
//! [`ControlPlane`] owns the revision store, the snapshot cache and the feedback store, and
//! runs reconciliation passes: desired bundle in, served snapshot and desired-state record out.
//! Frontends (the CLI, the desired-state watcher) only talk to this type.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use keel_core::{CacheState, KeelError, KeelResult, ProxyState, ResourceBundle, ResourceType, WireVersion};
use keel_feedback::FeedbackStore;
use keel_kubehub::ConfigEvent;
use keel_revision::{select_publishable, RevisionBackend, RevisionStore};
use keel_snapshot::{consistent, Snapshot, SnapshotCache};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

mod settings;

pub use settings::{Settings, DEFAULT_LISTEN_ADDR};

/// Result of one successful reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub node_id: String,
    pub desired_version: String,
    pub published_version: String,
    pub cache_state: CacheState,
    /// Whether the served snapshot was replaced by this pass.
    pub snapshot_replaced: bool,
}

/// One history entry with the flags of its revision record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    pub version: String,
    pub revision_ref: String,
    pub tainted: bool,
    pub published: bool,
    pub resources: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedType {
    pub version: String,
    pub items: usize,
    pub subscribers: usize,
    pub percent_failing: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub desired_version: Option<String>,
    pub published_version: Option<String>,
    pub cache_state: CacheState,
    pub history: Vec<String>,
    /// Per-type versions currently in the snapshot cache; empty when nothing is served.
    pub served: BTreeMap<ResourceType, ServedType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub wire: WireVersion,
    pub history_cap: usize,
    pub served_nodes: usize,
    pub feedback_keys: usize,
}

pub struct ControlPlane {
    store: RevisionStore,
    cache: Arc<SnapshotCache>,
    feedback: Arc<FeedbackStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ControlPlane {
    pub fn new(backend: Arc<dyn RevisionBackend>, settings: &Settings) -> Self {
        Self::with_parts(
            RevisionStore::new(backend, settings.history_cap),
            Arc::new(SnapshotCache::new(settings.wire)),
            Arc::new(FeedbackStore::new()),
        )
    }

    pub fn with_parts(store: RevisionStore, cache: Arc<SnapshotCache>, feedback: Arc<FeedbackStore>) -> Self {
        Self { store, cache, feedback, locks: DashMap::new() }
    }

    pub fn store(&self) -> &RevisionStore { &self.store }
    pub fn cache(&self) -> &Arc<SnapshotCache> { &self.cache }
    pub fn feedback(&self) -> &Arc<FeedbackStore> { &self.feedback }

    /// Number of nodes with a reconcile lock allocated.
    pub fn locked_nodes(&self) -> usize { self.locks.len() }

    fn node_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(node_id.to_string()).or_default().clone()
    }

    async fn load_state(&self, node_id: &str) -> KeelResult<Option<ProxyState>> {
        self.store.backend().get_state(node_id).await.map_err(KeelError::backend)
    }

    async fn save_state(&self, state: &ProxyState) -> KeelResult<()> {
        self.store.backend().put_state(state).await.map_err(KeelError::backend)
    }

    /// Replace the desired bundle of a node and reconcile it.
    pub async fn publish(&self, node_id: &str, bundle: ResourceBundle) -> KeelResult<ReconcileOutcome> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        let stored = self.load_state(node_id).await?;
        self.reconcile_locked(node_id, stored, Some(bundle)).await
    }

    /// Reconcile a desired-state record as observed in the store. Only its bundle is taken;
    /// history and publish status come from the stored record.
    pub async fn reconcile(&self, observed: ProxyState) -> KeelResult<ReconcileOutcome> {
        let ProxyState { node_id, bundle, .. } = observed;
        self.publish(&node_id, bundle).await
    }

    /// Reconcile the stored record of a node again, e.g. after a taint change.
    pub async fn reconcile_node(&self, node_id: &str) -> KeelResult<ReconcileOutcome> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        let stored = self
            .load_state(node_id)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("desired state for node {}", node_id)))?;
        self.reconcile_locked(node_id, Some(stored), None).await
    }

    /// One pass: ensure the revision, consolidate history, collect unreferenced revisions,
    /// select, check consistency, mark published, swap the snapshot, record the outcome.
    async fn reconcile_locked(
        &self,
        node_id: &str,
        stored: Option<ProxyState>,
        bundle: Option<ResourceBundle>,
    ) -> KeelResult<ReconcileOutcome> {
        let started = Instant::now();
        let node_id = node_id.to_string();
        let before = stored.clone();
        let mut state = stored.unwrap_or_else(|| ProxyState::new(&node_id, ResourceBundle::new()));
        if let Some(b) = bundle {
            state.bundle = b;
        }

        let desired = self.store.ensure_revision(&node_id, &state.bundle).await?;
        self.store.consolidate_history(&mut state, &desired).await?;
        state.desired_version = Some(desired.clone());
        self.store.delete_unreferenced(&node_id, &state.revision_history).await;

        let records = self.store.revisions(&node_id).await?;
        let selected = match select_publishable(&node_id, &state.revision_history, &records) {
            Ok(v) => v,
            Err(e @ KeelError::AllRevisionsTainted(_)) => {
                state.cache_state = CacheState::RollbackFailed;
                self.save_if_changed(&before, &state).await?;
                counter!("reconcile_total", 1u64, "outcome" => "rollback_failed");
                error!(node = %node_id, desired = %desired, served = ?state.published_version, "reconcile: every revision is tainted");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let record = records
            .iter()
            .find(|r| r.version == selected)
            .ok_or_else(|| KeelError::NotFound(format!("revision {} for node {}", selected, node_id)))?;
        let snapshot = Snapshot::from_bundle(self.cache.wire_version(), &record.bundle, &selected)?;
        if let Err(e) = consistent(&snapshot) {
            self.save_if_changed(&before, &state).await?;
            counter!("reconcile_total", 1u64, "outcome" => "inconsistent");
            warn!(node = %node_id, version = %selected, error = %e, "reconcile: snapshot rejected");
            return Err(e);
        }

        self.store.mark_published(&node_id, &selected).await?;
        let replace = match self.cache.get_snapshot(&node_id) {
            Ok(cur) => state.published_version.as_deref() != Some(selected.as_str()) || !same_slots(&cur, &snapshot),
            Err(_) => true,
        };
        if replace {
            self.cache.set_snapshot(&node_id, snapshot)?;
        }

        state.published_version = Some(selected.clone());
        state.cache_state = if selected == desired { CacheState::InSync } else { CacheState::Rollback };
        self.save_if_changed(&before, &state).await?;

        let outcome = match state.cache_state {
            CacheState::InSync => "in_sync",
            _ => "rollback",
        };
        counter!("reconcile_total", 1u64, "outcome" => outcome);
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        if state.cache_state == CacheState::Rollback {
            warn!(node = %node_id, desired = %desired, published = %selected, "reconcile: serving older revision");
        } else {
            info!(node = %node_id, version = %selected, replaced = replace, "reconcile: in sync");
        }
        Ok(ReconcileOutcome {
            node_id,
            desired_version: desired,
            published_version: selected,
            cache_state: state.cache_state,
            snapshot_replaced: replace,
        })
    }

    async fn save_if_changed(&self, before: &Option<ProxyState>, after: &ProxyState) -> KeelResult<()> {
        if before.as_ref() != Some(after) {
            self.save_state(after).await?;
        }
        Ok(())
    }

    /// Stop serving a node: drop its snapshot, desired-state record and revisions.
    pub async fn teardown(&self, node_id: &str) -> KeelResult<()> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;
        self.cache.clear_snapshot(node_id);
        let deleted = self.store.delete_unreferenced(node_id, &[]).await;
        self.store.backend().delete_state(node_id).await.map_err(KeelError::backend)?;
        counter!("teardown_total", 1u64);
        info!(node = %node_id, deleted, "teardown: node removed");
        // Dropped only while no other task holds a clone of the lock.
        self.locks.remove_if(node_id, |_, l| Arc::strong_count(l) == 2);
        Ok(())
    }

    /// Set or clear the taint flag of a revision, then reconcile the node.
    pub async fn taint(&self, node_id: &str, version: &str, tainted: bool) -> KeelResult<ReconcileOutcome> {
        self.store.set_tainted(node_id, version, tainted).await?;
        self.reconcile_node(node_id).await
    }

    pub async fn history(&self, node_id: &str) -> KeelResult<Vec<HistoryItem>> {
        let state = self
            .load_state(node_id)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("desired state for node {}", node_id)))?;
        let records = self.store.revisions(node_id).await?;
        Ok(state
            .revision_history
            .iter()
            .map(|e| {
                let rec = records.iter().find(|r| r.name == e.revision_ref || r.version == e.version);
                HistoryItem {
                    version: e.version.clone(),
                    revision_ref: e.revision_ref.clone(),
                    tainted: rec.map(|r| r.tainted).unwrap_or(false),
                    published: rec.map(|r| r.published).unwrap_or(false),
                    resources: rec.map(|r| r.bundle.len()).unwrap_or(0),
                }
            })
            .collect())
    }

    pub async fn status(&self, node_id: &str) -> KeelResult<NodeStatus> {
        let state = self
            .load_state(node_id)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("desired state for node {}", node_id)))?;
        let mut served = BTreeMap::new();
        if let Ok(snap) = self.cache.get_snapshot(node_id) {
            for (rt, slot) in snap.iter() {
                if slot.items.is_empty() {
                    continue;
                }
                served.insert(
                    rt,
                    ServedType {
                        version: slot.version.clone(),
                        items: slot.items.len(),
                        subscribers: self.feedback.subscribers(node_id, rt).len(),
                        percent_failing: self.feedback.percent_failing(node_id, rt, &slot.version),
                    },
                );
            }
        }
        Ok(NodeStatus {
            node_id: state.node_id.clone(),
            desired_version: state.desired_version.clone(),
            published_version: state.published_version.clone(),
            cache_state: state.cache_state,
            history: state.history_versions().into_iter().map(String::from).collect(),
            served,
        })
    }

    pub fn stats(&self) -> Stats {
        Stats {
            wire: self.cache.wire_version(),
            history_cap: self.store.cap(),
            served_nodes: self.cache.nodes().len(),
            feedback_keys: self.feedback.len(),
        }
    }

    /// Reconcile every stored desired-state record. Returns how many passes failed.
    pub async fn resync_all(&self) -> KeelResult<usize> {
        let states = self.store.backend().list_states().await.map_err(KeelError::backend)?;
        let mut failed = 0usize;
        for st in states {
            let node = st.node_id.clone();
            if let Err(e) = self.reconcile(st).await {
                failed += 1;
                warn!(node = %node, error = %e, "resync: reconcile failed");
            }
        }
        debug!(failed, "resync: done");
        Ok(failed)
    }

    /// Apply desired-state events until the channel closes or `shutdown` flips, resyncing
    /// every `resync`.
    pub async fn drive(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ConfigEvent>,
        resync: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(resync.max(Duration::from_millis(10)));
        tick.tick().await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ConfigEvent::Applied(state)) => {
                        let node = state.node_id.clone();
                        if let Err(e) = self.reconcile(state).await {
                            warn!(node = %node, error = %e, "reconcile failed; retrying on next event or resync");
                        }
                    }
                    Some(ConfigEvent::Deleted(node)) => {
                        if let Err(e) = self.teardown(&node).await {
                            warn!(node = %node, error = %e, "teardown failed");
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(e) = self.resync_all().await {
                        warn!(error = %e, "resync: listing desired state failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("reconcile loop stopped");
    }
}

fn same_slots(a: &Snapshot, b: &Snapshot) -> bool {
    a.iter().zip(b.iter()).all(|((_, x), (_, y))| x == y)
}
