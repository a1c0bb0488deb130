//! Keel snapshot cache: the resource set currently served to each node.
//!
//! One [`SnapshotCache`] serves one wire version. The wire version decides how many type
//! slots a snapshot has and whether a slot's version is taken from the caller (V2) or
//! recomputed from the slot's items on every write (V3).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use arc_swap::ArcSwapOption;
use keel_core::{hash_items, KeelError, KeelResult, ResourceBundle, ResourceType, WireVersion};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

mod consistency;

pub use consistency::consistent;

pub type Items = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeSlot {
    pub version: String,
    pub items: Items,
}

/// Per-type resources for one node. Immutable once stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    wire: WireVersion,
    slots: Vec<TypeSlot>,
    epoch: u64,
}

impl Snapshot {
    pub fn new(wire: WireVersion) -> Self {
        let mut s = Self { wire, slots: vec![TypeSlot::default(); wire.slots().len()], epoch: 0 };
        if wire.recomputes_versions() {
            let empty = hash_items(&Items::new());
            for slot in s.slots.iter_mut() { slot.version = empty.clone(); }
        }
        s
    }

    /// Build a snapshot holding every type of `bundle`. Under V2 all slots carry `version`.
    pub fn from_bundle(wire: WireVersion, bundle: &ResourceBundle, version: &str) -> KeelResult<Self> {
        let mut s = Self::new(wire);
        for rt in wire.slots() {
            let items = bundle.items(*rt).cloned().unwrap_or_default();
            s.set_slot(*rt, version, items)?;
        }
        for (rt, items) in bundle.iter() {
            if !items.is_empty() && wire.slot_index(*rt).is_none() {
                return Err(KeelError::UnsupportedType(format!("{} under wire {:?}", rt, wire)));
            }
        }
        Ok(s)
    }

    /// Replace all items of a type, applying the wire version's version rule.
    pub fn set_slot(&mut self, rt: ResourceType, version: &str, items: Items) -> KeelResult<()> {
        let idx = self
            .wire
            .slot_index(rt)
            .ok_or_else(|| KeelError::UnsupportedType(format!("{} under wire {:?}", rt, self.wire)))?;
        let version = if self.wire.recomputes_versions() { hash_items(&items) } else { version.to_string() };
        self.slots[idx] = TypeSlot { version, items };
        Ok(())
    }

    pub fn wire_version(&self) -> WireVersion { self.wire }
    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn slot(&self, rt: ResourceType) -> Option<&TypeSlot> {
        self.wire.slot_index(rt).map(|i| &self.slots[i])
    }

    pub fn version(&self, rt: ResourceType) -> Option<&str> { self.slot(rt).map(|s| s.version.as_str()) }

    pub fn items(&self, rt: ResourceType) -> Option<&Items> { self.slot(rt).map(|s| &s.items) }

    /// `(type, slot)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &TypeSlot)> {
        self.wire.slots().iter().copied().zip(self.slots.iter())
    }
}

struct NodeEntry {
    current: ArcSwapOption<Snapshot>,
    writer: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
}

impl NodeEntry {
    fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { current: ArcSwapOption::empty(), writer: Mutex::new(()), epoch_tx }
    }

    fn next_epoch(&self) -> u64 { self.epoch_tx.borrow().saturating_add(1) }
}

/// Process-lifetime cache of served snapshots keyed by node ID.
pub struct SnapshotCache {
    wire: WireVersion,
    nodes: RwLock<FxHashMap<String, Arc<NodeEntry>>>,
}

impl SnapshotCache {
    pub fn new(wire: WireVersion) -> Self {
        Self { wire, nodes: RwLock::new(FxHashMap::default()) }
    }

    pub fn wire_version(&self) -> WireVersion { self.wire }

    /// Run `f` on the node's entry, creating it if needed. The map lock is held for the
    /// duration, so [`SnapshotCache::release`] cannot drop an entry mid-write.
    fn with_entry<R>(&self, node_id: &str, f: impl FnOnce(&NodeEntry) -> R) -> R {
        {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(e) = nodes.get(node_id) {
                return f(e);
            }
        }
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let e = Arc::clone(nodes.entry(node_id.to_string()).or_insert_with(|| Arc::new(NodeEntry::new())));
        metrics::gauge!("snapshot_nodes", nodes.len() as f64);
        f(&e)
    }

    fn existing(&self, node_id: &str) -> Option<Arc<NodeEntry>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(node_id).cloned()
    }

    fn store(entry: &NodeEntry, mut next: Snapshot) -> Arc<Snapshot> {
        next.epoch = entry.next_epoch();
        let next = Arc::new(next);
        entry.current.store(Some(Arc::clone(&next)));
        entry.epoch_tx.send_replace(next.epoch);
        next
    }

    /// Replace all items of one type for a node, creating the snapshot on first write.
    pub fn set_resources(&self, node_id: &str, rt: ResourceType, version: &str, items: Items) -> KeelResult<Arc<Snapshot>> {
        let stored = self.with_entry(node_id, |entry| {
            let _guard = entry.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let mut next = match entry.current.load_full() {
                Some(cur) => (*cur).clone(),
                None => Snapshot::new(self.wire),
            };
            next.set_slot(rt, version, items)?;
            Ok::<_, KeelError>(Self::store(entry, next))
        })?;
        metrics::counter!("snapshot_writes_total", 1u64, "type" => rt.as_str());
        debug!(node = %node_id, rtype = %rt, version = ?stored.version(rt), epoch = stored.epoch, "snapshot: set resources");
        Ok(stored)
    }

    /// Atomically replace every slot of a node's snapshot.
    pub fn set_snapshot(&self, node_id: &str, snapshot: Snapshot) -> KeelResult<Arc<Snapshot>> {
        if snapshot.wire != self.wire {
            return Err(KeelError::Invalid(format!("snapshot wire {:?} does not match cache wire {:?}", snapshot.wire, self.wire)));
        }
        let stored = self.with_entry(node_id, |entry| {
            let _guard = entry.writer.lock().unwrap_or_else(PoisonError::into_inner);
            Self::store(entry, snapshot)
        });
        metrics::counter!("snapshot_writes_total", 1u64, "type" => "*");
        info!(node = %node_id, epoch = stored.epoch, "snapshot: replaced");
        Ok(stored)
    }

    pub fn get_snapshot(&self, node_id: &str) -> KeelResult<Arc<Snapshot>> {
        self.existing(node_id)
            .and_then(|e| e.current.load_full())
            .ok_or_else(|| KeelError::NotFound(format!("snapshot for node {}", node_id)))
    }

    /// Drop all state for a node. Subscribers are woken and observe `NotFound`.
    pub fn clear_snapshot(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = nodes.get(node_id).cloned() {
            {
                let _guard = entry.writer.lock().unwrap_or_else(PoisonError::into_inner);
                entry.current.store(None);
                let next = entry.next_epoch();
                entry.epoch_tx.send_replace(next);
            }
            if entry.epoch_tx.receiver_count() == 0 {
                nodes.remove(node_id);
            }
            info!(node = %node_id, "snapshot: cleared");
        }
        metrics::gauge!("snapshot_nodes", nodes.len() as f64);
    }

    /// Epoch receiver for a node; changes whenever its snapshot is replaced or cleared.
    pub fn subscribe(&self, node_id: &str) -> watch::Receiver<u64> {
        self.with_entry(node_id, |e| e.epoch_tx.subscribe())
    }

    /// Forget a node that holds no snapshot and has no live subscribers. Streams call this
    /// after dropping their receiver.
    pub fn release(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let idle = nodes
            .get(node_id)
            .map(|e| e.current.load().is_none() && e.epoch_tx.receiver_count() == 0)
            .unwrap_or(false);
        if idle {
            nodes.remove(node_id);
            debug!(node = %node_id, "snapshot: idle entry dropped");
            metrics::gauge!("snapshot_nodes", nodes.len() as f64);
        }
    }

    /// Node entries held, including subscribed nodes without a snapshot.
    pub fn entry_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Node IDs that currently hold a snapshot, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<String> = nodes
            .iter()
            .filter(|(_, e)| e.current.load().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items(pairs: &[(&str, serde_json::Value)]) -> Items {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn v3_recomputes_version_from_items() {
        let cache = SnapshotCache::new(WireVersion::V3);
        let a = cache.set_resources("n1", ResourceType::Endpoint, "ignored", items(&[("a", json!({"x": 1}))])).unwrap();
        let v1 = a.version(ResourceType::Endpoint).unwrap().to_string();
        assert_ne!(v1, "ignored");
        let b = cache.set_resources("n1", ResourceType::Endpoint, "other", items(&[("a", json!({"x": 1}))])).unwrap();
        assert_eq!(b.version(ResourceType::Endpoint).unwrap(), v1);
        let c = cache
            .set_resources("n1", ResourceType::Endpoint, "", items(&[("a", json!({"x": 1})), ("b", json!({"y": 2}))]))
            .unwrap();
        assert_ne!(c.version(ResourceType::Endpoint).unwrap(), v1);
        assert!(c.epoch() > b.epoch());
    }

    #[test]
    fn v2_keeps_external_version_and_rejects_v3_only_types() {
        let cache = SnapshotCache::new(WireVersion::V2);
        let s = cache.set_resources("n1", ResourceType::Cluster, "ext-7", items(&[("c", json!({}))])).unwrap();
        assert_eq!(s.version(ResourceType::Cluster), Some("ext-7"));
        let err = cache.set_resources("n1", ResourceType::ScopedRoute, "v", Items::new()).unwrap_err();
        assert!(matches!(err, KeelError::UnsupportedType(_)));
        assert_eq!(s.iter().count(), 6);
    }

    #[test]
    fn get_and_clear() {
        let cache = SnapshotCache::new(WireVersion::V3);
        assert!(matches!(cache.get_snapshot("n1"), Err(KeelError::NotFound(_))));
        cache.set_resources("n1", ResourceType::Route, "", Items::new()).unwrap();
        assert!(cache.get_snapshot("n1").is_ok());
        assert_eq!(cache.nodes(), vec!["n1".to_string()]);
        cache.clear_snapshot("n1");
        assert!(matches!(cache.get_snapshot("n1"), Err(KeelError::NotFound(_))));
        assert!(cache.nodes().is_empty());
    }

    #[test]
    fn idle_subscriptions_are_released() {
        let cache = SnapshotCache::new(WireVersion::V3);
        for i in 0..100 {
            let node = format!("ghost-{}", i);
            let rx = cache.subscribe(&node);
            drop(rx);
            cache.release(&node);
        }
        assert_eq!(cache.entry_count(), 0);

        let held = cache.subscribe("n1");
        cache.release("n1");
        assert_eq!(cache.entry_count(), 1, "live receiver keeps the entry");
        drop(held);
        cache.set_resources("n1", ResourceType::Route, "", Items::new()).unwrap();
        cache.release("n1");
        assert_eq!(cache.nodes(), vec!["n1".to_string()], "served nodes are never released");
    }

    #[test]
    fn from_bundle_fills_every_slot() {
        let bundle = ResourceBundle::new().with(ResourceType::Endpoint, "e1", json!({}));
        let s = Snapshot::from_bundle(WireVersion::V2, &bundle, "ver1").unwrap();
        assert!(s.iter().all(|(_, slot)| slot.version == "ver1"));
        assert_eq!(s.items(ResourceType::Endpoint).map(|m| m.len()), Some(1));

        let scoped = ResourceBundle::new().with(ResourceType::ScopedRoute, "s", json!({}));
        assert!(Snapshot::from_bundle(WireVersion::V2, &scoped, "v").is_err());
        assert!(Snapshot::from_bundle(WireVersion::V3, &scoped, "v").is_ok());
    }

    #[test]
    fn set_snapshot_requires_matching_wire() {
        let cache = SnapshotCache::new(WireVersion::V3);
        assert!(cache.set_snapshot("n1", Snapshot::new(WireVersion::V2)).is_err());
        assert!(cache.set_snapshot("n1", Snapshot::new(WireVersion::V3)).is_ok());
    }
}
