//! Keel revisions: per-node content-addressed history and the choice of what to serve.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use keel_core::{
    hash_bundle, HistoryEntry, KeelError, KeelResult, ProxyState, ResourceBundle, RevisionPatch,
    RevisionRecord,
};
use metrics::counter;
use tracing::{debug, info, warn};

mod backend;

pub use backend::{MemoryBackend, RevisionBackend};

/// Move `entry` to the tail of `history` (or append it) and trim from the head to `cap`.
/// Returns whether the history changed.
pub fn consolidate(history: &mut Vec<HistoryEntry>, entry: HistoryEntry, cap: usize) -> bool {
    let cap = cap.max(1);
    if let Some(pos) = history.iter().position(|e| e.version == entry.version) {
        if pos + 1 == history.len() {
            return false;
        }
        let existing = history.remove(pos);
        history.push(existing);
        return true;
    }
    history.push(entry);
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
    true
}

/// Newest untainted entry of `history`, scanning tail to head.
///
/// An entry whose record is missing from `records` is skipped like a tainted one.
pub fn select_publishable(node_id: &str, history: &[HistoryEntry], records: &[RevisionRecord]) -> KeelResult<String> {
    for entry in history.iter().rev() {
        let rec = records
            .iter()
            .find(|r| r.name == entry.revision_ref)
            .or_else(|| records.iter().find(|r| r.version == entry.version));
        match rec {
            Some(r) if !r.tainted => return Ok(entry.version.clone()),
            Some(_) => debug!(node = %node_id, version = %entry.version, "select: skipping tainted revision"),
            None => warn!(node = %node_id, version = %entry.version, "select: history entry without record"),
        }
    }
    Err(KeelError::AllRevisionsTainted(node_id.to_string()))
}

/// Revision bookkeeping on top of a [`RevisionBackend`].
#[derive(Clone)]
pub struct RevisionStore {
    backend: Arc<dyn RevisionBackend>,
    cap: usize,
}

impl RevisionStore {
    pub fn new(backend: Arc<dyn RevisionBackend>, cap: usize) -> Self {
        Self { backend, cap: cap.max(1) }
    }

    pub fn backend(&self) -> &Arc<dyn RevisionBackend> { &self.backend }
    pub fn cap(&self) -> usize { self.cap }

    async fn single(&self, node_id: &str, version: &str) -> KeelResult<Option<RevisionRecord>> {
        let mut found = self.backend.find_revisions(node_id, version).await.map_err(KeelError::backend)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            count => {
                counter!("revision_duplicates_total", 1u64);
                Err(KeelError::DuplicateRevision { node_id: node_id.to_string(), version: version.to_string(), count })
            }
        }
    }

    /// Version of `bundle`, creating its revision record when none exists yet.
    pub async fn ensure_revision(&self, node_id: &str, bundle: &ResourceBundle) -> KeelResult<String> {
        let version = hash_bundle(bundle);
        if self.single(node_id, &version).await?.is_none() {
            let rec = RevisionRecord::new(node_id, &version, bundle.clone());
            self.backend.create_revision(&rec).await.map_err(KeelError::backend)?;
            counter!("revisions_created_total", 1u64);
            info!(node = %node_id, version = %version, name = %rec.name, "revision: created");
        }
        Ok(version)
    }

    /// Put `version` at the tail of the node's history. Idempotent when it already is.
    pub async fn consolidate_history(&self, state: &mut ProxyState, version: &str) -> KeelResult<bool> {
        let revision_ref = match state.revision_history.iter().find(|e| e.version == version) {
            Some(e) => e.revision_ref.clone(),
            None => self
                .single(&state.node_id, version)
                .await?
                .map(|r| r.name)
                .ok_or_else(|| KeelError::NotFound(format!("revision {} for node {}", version, state.node_id)))?,
        };
        let changed = consolidate(
            &mut state.revision_history,
            HistoryEntry { version: version.to_string(), revision_ref },
            self.cap,
        );
        if changed {
            debug!(node = %state.node_id, history = ?state.history_versions(), "revision: history consolidated");
        }
        Ok(changed)
    }

    /// Delete the node's records that the history no longer references. Failures are logged
    /// and left for a later pass. Returns the number deleted.
    pub async fn delete_unreferenced(&self, node_id: &str, history: &[HistoryEntry]) -> usize {
        let records = match self.backend.list_revisions(node_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(node = %node_id, error = %e, "revision gc: list failed");
                return 0;
            }
        };
        let mut deleted = 0usize;
        for rec in records {
            if history.iter().any(|e| e.revision_ref == rec.name || e.version == rec.version) {
                continue;
            }
            match self.backend.delete_revision(&rec.name).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(node = %node_id, version = %rec.version, "revision gc: deleted");
                }
                Err(e) => {
                    counter!("revision_gc_failures_total", 1u64);
                    warn!(node = %node_id, version = %rec.version, error = %e, "revision gc: delete failed");
                }
            }
        }
        deleted
    }

    /// Flag `version` as the single published revision of the node: clear every other
    /// record first, then set the selected one.
    pub async fn mark_published(&self, node_id: &str, version: &str) -> KeelResult<()> {
        let records = self.backend.list_revisions(node_id).await.map_err(KeelError::backend)?;
        let selected = records
            .iter()
            .find(|r| r.version == version)
            .ok_or_else(|| KeelError::NotFound(format!("revision {} for node {}", version, node_id)))?;
        let clear = RevisionPatch { published: Some(false), ..Default::default() };
        for rec in records.iter().filter(|r| r.published && r.version != version) {
            self.backend.patch_revision(&rec.name, &clear).await.map_err(KeelError::backend)?;
        }
        if !selected.published {
            let set = RevisionPatch { published: Some(true), last_published_at: Some(Utc::now()), ..Default::default() };
            self.backend.patch_revision(&selected.name, &set).await.map_err(KeelError::backend)?;
            info!(node = %node_id, version = %version, "revision: marked published");
        }
        Ok(())
    }

    pub async fn set_tainted(&self, node_id: &str, version: &str, tainted: bool) -> KeelResult<()> {
        let rec = self
            .single(node_id, version)
            .await?
            .ok_or_else(|| KeelError::NotFound(format!("revision {} for node {}", version, node_id)))?;
        let patch = RevisionPatch { tainted: Some(tainted), ..Default::default() };
        self.backend.patch_revision(&rec.name, &patch).await.map_err(KeelError::backend)?;
        info!(node = %node_id, version = %version, tainted, "revision: taint updated");
        Ok(())
    }

    pub async fn revisions(&self, node_id: &str) -> KeelResult<Vec<RevisionRecord>> {
        self.backend.list_revisions(node_id).await.map_err(KeelError::backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(v: &str) -> HistoryEntry { HistoryEntry { version: v.to_string(), revision_ref: format!("ref-{}", v) } }

    fn versions(h: &[HistoryEntry]) -> Vec<&str> { h.iter().map(|e| e.version.as_str()).collect() }

    #[test]
    fn existing_version_moves_to_tail_keeping_order() {
        let mut h = vec![e("a"), e("b"), e("c"), e("d")];
        assert!(consolidate(&mut h, e("b"), 10));
        assert_eq!(versions(&h), vec!["a", "c", "d", "b"]);
        assert!(!consolidate(&mut h, e("b"), 10));
        assert_eq!(versions(&h), vec!["a", "c", "d", "b"]);
    }

    #[test]
    fn cap_keeps_most_recent_in_order() {
        let mut h = Vec::new();
        for i in 0..15 { consolidate(&mut h, e(&format!("v{}", i)), 10); }
        assert_eq!(h.len(), 10);
        let want: Vec<String> = (5..15).map(|i| format!("v{}", i)).collect();
        assert_eq!(versions(&h), want.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }

    fn rec(v: &str, tainted: bool) -> RevisionRecord {
        let mut r = RevisionRecord::new("n1", v, ResourceBundle::new());
        r.name = format!("ref-{}", v);
        r.tainted = tainted;
        r
    }

    #[test]
    fn most_recent_untainted_wins() {
        let h = vec![e("v1"), e("v2"), e("v3")];
        let recs = vec![rec("v1", true), rec("v2", true), rec("v3", false)];
        assert_eq!(select_publishable("n1", &h, &recs).unwrap(), "v3");

        let recs = vec![rec("v1", false), rec("v2", false), rec("v3", true)];
        assert_eq!(select_publishable("n1", &h, &recs).unwrap(), "v2");
    }

    #[test]
    fn all_tainted_or_empty_is_exhaustion() {
        let h = vec![e("v1"), e("v2")];
        let recs = vec![rec("v1", true), rec("v2", true)];
        assert_eq!(select_publishable("n1", &h, &recs), Err(KeelError::AllRevisionsTainted("n1".into())));
        assert_eq!(select_publishable("n1", &[], &[]), Err(KeelError::AllRevisionsTainted("n1".into())));
    }
}
