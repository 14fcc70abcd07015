use ahash::AHashMap as HashMap;
use kato_xds_controller_core::{NodeIdentity, PublishError, Snapshot, SnapshotSink};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Observes the current snapshot of a single node.
///
/// A node that has never been published is forgotten once its last
/// receiver is dropped.
#[derive(Debug)]
pub struct SnapshotRx {
    rx: watch::Receiver<Option<Arc<Snapshot>>>,
    node: String,
    cache: SnapshotCache,
}

/// Holds the latest snapshot published for each node.
///
/// Nodes are keyed by the string sidecars report as `node.cluster`, so a
/// sidecar that reports an unknown identity simply never observes a snapshot.
#[derive(Clone, Debug, Default)]
pub struct SnapshotCache(Arc<RwLock<HashMap<String, Entry>>>);

#[derive(Debug)]
struct Entry {
    tx: watch::Sender<Option<Arc<Snapshot>>>,

    /// The highest version ever published for the node.
    version: u64,
}

// === impl SnapshotCache ===

impl SnapshotCache {
    pub fn get(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.0.read().get(node)?.tx.borrow().clone()
    }

    /// Subscribes to a node's snapshots. The node need not have been
    /// published yet.
    pub fn watch(&self, node: &str) -> SnapshotRx {
        let rx = self.0.read().get(node).map(|e| e.tx.subscribe());
        let rx = rx.unwrap_or_else(|| {
            self.0
                .write()
                .entry(node.to_string())
                .or_default()
                .tx
                .subscribe()
        });
        SnapshotRx {
            rx,
            node: node.to_string(),
            cache: self.clone(),
        }
    }

    /// The number of nodes with a current snapshot.
    pub fn len(&self) -> usize {
        self.0
            .read()
            .values()
            .filter(|e| e.tx.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears every snapshot. Version history is retained.
    pub fn clear(&self) {
        for entry in self.0.read().values() {
            entry.tx.send_replace(None);
        }
    }
}

// === impl SnapshotRx ===

impl SnapshotRx {
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }

    pub fn borrow(&self) -> watch::Ref<'_, Option<Arc<Snapshot>>> {
        self.rx.borrow()
    }

    pub fn borrow_and_update(&mut self) -> watch::Ref<'_, Option<Arc<Snapshot>>> {
        self.rx.borrow_and_update()
    }
}

impl Drop for SnapshotRx {
    fn drop(&mut self) {
        let mut nodes = self.cache.0.write();
        // The receiver is released under the lock so concurrent drops see
        // each other.
        drop(std::mem::replace(&mut self.rx, watch::channel(None).1));
        let unused = nodes
            .get(&self.node)
            .is_some_and(|e| e.version == 0 && e.tx.receiver_count() == 0);
        if unused {
            nodes.remove(&self.node);
        }
    }
}

impl SnapshotSink for SnapshotCache {
    fn last_version(&self, node: &NodeIdentity) -> u64 {
        self.0
            .read()
            .get(&node.to_string())
            .map(|e| e.version)
            .unwrap_or_default()
    }

    fn set_snapshot(&self, node: &NodeIdentity, snapshot: Snapshot) -> Result<(), PublishError> {
        let mut nodes = self.0.write();
        let entry = nodes.entry(node.to_string()).or_default();
        if snapshot.version() <= entry.version {
            return Err(PublishError::StaleVersion {
                version: snapshot.version(),
                published: entry.version,
            });
        }

        entry.version = snapshot.version();
        entry.tx.send_replace(Some(Arc::new(snapshot)));
        Ok(())
    }

    fn clear_snapshot(&self, node: &NodeIdentity) {
        if let Some(entry) = self.0.read().get(&node.to_string()) {
            entry.tx.send_replace(None);
        }
    }
}

// === impl Entry ===

impl Default for Entry {
    fn default() -> Self {
        Self {
            tx: watch::channel(None).0,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot::new(version, vec![], vec![], vec![], vec![])
    }

    #[test]
    fn rejects_stale_versions() {
        let cache = SnapshotCache::default();
        let node = NodeIdentity::new("ns", "p1", "web");
        cache.set_snapshot(&node, snapshot(3)).expect("first version");
        assert_eq!(
            cache.set_snapshot(&node, snapshot(3)),
            Err(PublishError::StaleVersion {
                version: 3,
                published: 3
            })
        );
        cache.set_snapshot(&node, snapshot(4)).expect("newer version");
        assert_eq!(cache.get("ns_p1_web").map(|s| s.version()), Some(4));
    }

    #[test]
    fn clearing_retains_history() {
        let cache = SnapshotCache::default();
        let node = NodeIdentity::new("ns", "p1", "web");
        cache.set_snapshot(&node, snapshot(7)).expect("publish");
        cache.clear_snapshot(&node);

        assert!(cache.get("ns_p1_web").is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.last_version(&node), 7);
        assert!(cache.set_snapshot(&node, snapshot(7)).is_err());
    }

    #[test]
    fn unpublished_nodes_are_forgotten() {
        let cache = SnapshotCache::default();
        let rx0 = cache.watch("ns_p1_unknown");
        let rx1 = cache.watch("ns_p1_unknown");
        assert_eq!(cache.0.read().len(), 1);
        drop(rx0);
        assert_eq!(cache.0.read().len(), 1);
        drop(rx1);
        assert!(cache.0.read().is_empty());

        // Published nodes retain their version history.
        let node = NodeIdentity::new("ns", "p1", "web");
        let rx = cache.watch("ns_p1_web");
        cache.set_snapshot(&node, snapshot(2)).expect("publish");
        drop(rx);
        assert_eq!(cache.last_version(&node), 2);
    }

    #[tokio::test]
    async fn watchers_observe_publishes() {
        let cache = SnapshotCache::default();
        let mut rx = cache.watch("ns_p1_web");
        assert!(rx.borrow_and_update().is_none());

        let node = NodeIdentity::new("ns", "p1", "web");
        cache.set_snapshot(&node, snapshot(1)).expect("publish");
        rx.changed().await.expect("cache must not be dropped");
        assert_eq!(rx.borrow_and_update().as_ref().map(|s| s.version()), Some(1));

        cache.clear();
        rx.changed().await.expect("cache must not be dropped");
        assert!(rx.borrow().is_none());
    }
}
