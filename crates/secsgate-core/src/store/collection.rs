// ── Reactive aggregate collection ──
//
// Lock-free concurrent storage with O(1) lookups by equipment id and by
// endpoint, plus push-based change notification via `watch` channels.

use std::sync::Arc;

use dashmap::DashMap;
use secsgate_hsms::Endpoint;
use tokio::sync::watch;

use crate::model::{Equipment, EquipmentId};

/// Every mutation bumps a version counter and rebuilds the snapshot that
/// subscribers receive.
pub(crate) struct EquipmentCollection {
    /// Primary storage.
    by_id: DashMap<EquipmentId, Arc<Equipment>>,

    /// Secondary index: endpoint -> equipment id.
    by_endpoint: DashMap<Endpoint, EquipmentId>,

    /// Version counter, bumped on every mutation.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on mutation.
    snapshot: watch::Sender<Arc<Vec<Arc<Equipment>>>>,
}

impl EquipmentCollection {
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_id: DashMap::new(),
            by_endpoint: DashMap::new(),
            version,
            snapshot,
        }
    }

    /// Insert or replace an aggregate. Returns `true` if the id was new.
    pub(crate) fn upsert(&self, equipment: Equipment) -> bool {
        let id = equipment.id().clone();
        let endpoint = equipment.endpoint();

        // A re-addressed tool must not stay reachable under its old endpoint.
        if let Some(previous) = self.by_id.get(&id) {
            let old = previous.endpoint();
            drop(previous);
            if old != endpoint {
                self.by_endpoint.remove_if(&old, |_, owner| *owner == id);
            }
        }

        let is_new = self
            .by_id
            .insert(id.clone(), Arc::new(equipment))
            .is_none();
        self.by_endpoint.insert(endpoint, id);

        self.rebuild_snapshot();
        self.bump_version();

        is_new
    }

    pub(crate) fn remove(&self, id: &EquipmentId) -> Option<Arc<Equipment>> {
        let (_, removed) = self.by_id.remove(id)?;
        self.by_endpoint
            .remove_if(&removed.endpoint(), |_, owner| owner == id);
        self.rebuild_snapshot();
        self.bump_version();
        Some(removed)
    }

    pub(crate) fn get(&self, id: &EquipmentId) -> Option<Arc<Equipment>> {
        self.by_id.get(id).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn get_by_endpoint(&self, endpoint: &Endpoint) -> Option<Arc<Equipment>> {
        let id = self.by_endpoint.get(endpoint)?;
        self.by_id.get(id.value()).map(|r| Arc::clone(r.value()))
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<Equipment>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<Equipment>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn rebuild_snapshot(&self) {
        let mut values: Vec<Arc<Equipment>> =
            self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        values.sort_by(|a, b| a.id().cmp(b.id()));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }

    fn bump_version(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn equipment(id: &str, endpoint: &str) -> Equipment {
        Equipment::register(
            EquipmentId::new(id).unwrap(),
            id,
            endpoint.parse().unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn upsert_and_lookup_both_ways() {
        let col = EquipmentCollection::new();
        assert!(col.upsert(equipment("ETCH-01", "10.0.0.1:5000")));
        assert!(!col.upsert(equipment("ETCH-01", "10.0.0.1:5000")));

        let id = EquipmentId::new("ETCH-01").unwrap();
        assert_eq!(col.get(&id).unwrap().name(), "ETCH-01");
        let ep: Endpoint = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(col.get_by_endpoint(&ep).unwrap().id(), &id);
        assert_eq!(col.len(), 1);
        assert_eq!(col.version(), 2);
    }

    #[test]
    fn readdressing_drops_the_old_endpoint() {
        let col = EquipmentCollection::new();
        col.upsert(equipment("ETCH-01", "10.0.0.1:5000"));
        col.upsert(equipment("ETCH-01", "10.0.0.2:5000"));

        assert!(col.get_by_endpoint(&"10.0.0.1:5000".parse().unwrap()).is_none());
        assert!(col.get_by_endpoint(&"10.0.0.2:5000".parse().unwrap()).is_some());
    }

    #[test]
    fn remove_clears_indexes_and_notifies() {
        let col = EquipmentCollection::new();
        let mut rx = col.subscribe();
        col.upsert(equipment("ETCH-01", "10.0.0.1:5000"));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);

        let id = EquipmentId::new("ETCH-01").unwrap();
        assert!(col.remove(&id).is_some());
        assert!(col.remove(&id).is_none());
        assert!(col.get_by_endpoint(&"10.0.0.1:5000".parse().unwrap()).is_none());
        assert!(col.snapshot().is_empty());
    }
}
