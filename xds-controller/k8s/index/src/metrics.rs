use std::sync::Arc;

use kube::ResourceExt;
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Wraps an index to record the resources it observes.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<NamespacedIndexLabels, Gauge>,
    index_applies: Family<NamespacedIndexLabels, Counter>,
    index_deletes: Family<NamespacedIndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

/// Work queue counters, shared by every handle to a queue.
#[derive(Clone, Debug, Default)]
pub struct QueueMetrics {
    pub(crate) queued: Counter,
    pub(crate) processed: Counter,
    pub(crate) retried: Counter,
    pub(crate) dropped: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct RegistryMetrics {
    pub(crate) node_configs: Gauge,
    pub(crate) published: Counter,
    pub(crate) held_back: Counter,
    pub(crate) cleared: Counter,
    pub(crate) rebuild_errors: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedIndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&NamespacedIndexLabels {
                namespace: namespace.clone(),
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().apply(resource);
        self.set_size::<R>(namespace, &kind);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let kind = R::kind(&());
        self.index_deletes
            .get_or_create(&NamespacedIndexLabels {
                namespace: namespace.clone(),
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().delete(namespace.clone(), name);
        self.set_size::<R>(namespace, &kind);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let kind = R::kind(&());
        let mut namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        self.index_resets
            .get_or_create(&IndexLabels {
                kind: kind.to_string(),
            })
            .inc();
        self.inner.write().reset(resources, removed);
        for ns in namespaces {
            self.set_size::<R>(ns, &kind);
        }
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn set_size<R>(&self, namespace: String, kind: &str)
    where
        T: SizedIndex<R>,
    {
        let size = SizedIndex::<R>::size(&self.inner, &namespace);
        self.index_size
            .get_or_create(&NamespacedIndexLabels {
                namespace,
                kind: kind.to_string(),
            })
            .set(size as i64);
    }
}

// === impl QueueMetrics ===

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "queue_pushes",
            "Count of tasks enqueued",
            metrics.queued.clone(),
        );
        prom.register(
            "queue_processed",
            "Count of tasks handled successfully",
            metrics.processed.clone(),
        );
        prom.register(
            "queue_retries",
            "Count of failed tasks scheduled for retry",
            metrics.retried.clone(),
        );
        prom.register(
            "queue_dropped",
            "Count of tasks dropped because the queue was shut down",
            metrics.dropped.clone(),
        );
        metrics
    }
}

// === impl RegistryMetrics ===

impl RegistryMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "node_configs",
            "Gauge of the number of sidecars with a plugin configuration",
            metrics.node_configs.clone(),
        );
        prom.register(
            "snapshots_published",
            "Count of snapshots published to the snapshot cache",
            metrics.published.clone(),
        );
        prom.register(
            "snapshots_held",
            "Count of rebuilds that produced no clusters or no listeners",
            metrics.held_back.clone(),
        );
        prom.register(
            "snapshots_cleared",
            "Count of snapshots cleared because a plugin configuration was removed",
            metrics.cleared.clone(),
        );
        prom.register(
            "rebuild_errors",
            "Count of rebuilds aborted by an invalid plugin configuration or a failed publish",
            metrics.rebuild_errors.clone(),
        );
        metrics
    }
}
