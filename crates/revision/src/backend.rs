//! Seam to the external configuration store that persists revision and desired-state records.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use keel_core::{ProxyState, RevisionPatch, RevisionRecord};
use tokio::sync::RwLock;

/// Revision and desired-state persistence. Implementations may block on I/O and fail;
/// callers retry on their own cadence.
#[async_trait::async_trait]
pub trait RevisionBackend: Send + Sync {
    async fn list_revisions(&self, node_id: &str) -> Result<Vec<RevisionRecord>>;

    async fn find_revisions(&self, node_id: &str, version: &str) -> Result<Vec<RevisionRecord>> {
        let all = self.list_revisions(node_id).await?;
        Ok(all.into_iter().filter(|r| r.version == version).collect())
    }

    async fn create_revision(&self, rec: &RevisionRecord) -> Result<()>;
    async fn patch_revision(&self, name: &str, patch: &RevisionPatch) -> Result<()>;
    async fn delete_revision(&self, name: &str) -> Result<()>;

    async fn get_state(&self, node_id: &str) -> Result<Option<ProxyState>>;
    async fn put_state(&self, state: &ProxyState) -> Result<()>;
    async fn delete_state(&self, node_id: &str) -> Result<()>;
    async fn list_states(&self) -> Result<Vec<ProxyState>>;
}

/// In-process backend. Used for tests and standalone demos.
#[derive(Default)]
pub struct MemoryBackend {
    revisions: RwLock<BTreeMap<String, RevisionRecord>>,
    states: RwLock<BTreeMap<String, ProxyState>>,
}

impl MemoryBackend {
    pub fn new() -> Self { Self::default() }
}

#[async_trait::async_trait]
impl RevisionBackend for MemoryBackend {
    async fn list_revisions(&self, node_id: &str) -> Result<Vec<RevisionRecord>> {
        let revs = self.revisions.read().await;
        let mut out: Vec<RevisionRecord> = revs.values().filter(|r| r.node_id == node_id).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }

    async fn create_revision(&self, rec: &RevisionRecord) -> Result<()> {
        let mut revs = self.revisions.write().await;
        if revs.contains_key(&rec.name) {
            return Err(anyhow!("revision {} already exists", rec.name));
        }
        revs.insert(rec.name.clone(), rec.clone());
        Ok(())
    }

    async fn patch_revision(&self, name: &str, patch: &RevisionPatch) -> Result<()> {
        let mut revs = self.revisions.write().await;
        let rec = revs.get_mut(name).ok_or_else(|| anyhow!("revision {} not found", name))?;
        patch.apply(rec);
        Ok(())
    }

    async fn delete_revision(&self, name: &str) -> Result<()> {
        self.revisions.write().await.remove(name);
        Ok(())
    }

    async fn get_state(&self, node_id: &str) -> Result<Option<ProxyState>> {
        Ok(self.states.read().await.get(node_id).cloned())
    }

    async fn put_state(&self, state: &ProxyState) -> Result<()> {
        self.states.write().await.insert(state.node_id.clone(), state.clone());
        Ok(())
    }

    async fn delete_state(&self, node_id: &str) -> Result<()> {
        self.states.write().await.remove(node_id);
        Ok(())
    }

    async fn list_states(&self) -> Result<Vec<ProxyState>> {
        Ok(self.states.read().await.values().cloned().collect())
    }
}
