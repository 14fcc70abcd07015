//! Caches the Services, Endpoints, and plugin ConfigMaps visible to the
//! controller.
//!
//! The index is updated by `kubert::index::namespaced` watch loops. Updates
//! that change nothing the mesh consumes are suppressed; every other change is
//! enqueued for the node config registry.

use crate::{
    metrics::SizedIndex,
    queue::Queue,
    task::{EventKind, Resource, Task},
};
use ahash::AHashMap as HashMap;
use futures::prelude::*;
use kato_xds_controller_k8s_api::{
    self as k8s, watcher, ConfigMap, Endpoints, ResourceExt, Selector, Service,
};
use kube::Resource as KubeResource;
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    services: Store<Service>,
    endpoints: Store<Endpoints>,
    config_maps: Store<ConfigMap>,
    queue: Queue<Task>,

    /// Handed to the registry with the first ConfigMap list.
    initial_build: Option<watch::Sender<bool>>,
}

#[derive(Debug)]
pub struct Store<T> {
    by_ns: HashMap<String, HashMap<String, Arc<T>>>,
    synced: watch::Sender<bool>,
}

/// Resources tracked by the index.
pub trait Kind: KubeResource<DynamicType = ()> + Sized {
    fn store(index: &Index) -> &Store<Self>;

    fn store_mut(index: &mut Index) -> &mut Store<Self>;

    fn changed(old: &Self, new: &Self) -> bool;

    fn resource(obj: Arc<Self>) -> Resource;

    /// Invoked after the first list of this kind completes.
    fn on_synced(_index: &mut Index) {}
}

// === impl Index ===

impl Index {
    /// Returns a new index and a receiver that is set once the registry has
    /// processed every resource from the initial lists.
    pub fn shared(queue: Queue<Task>) -> (SharedIndex, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let index = Self {
            services: Store::default(),
            endpoints: Store::default(),
            config_maps: Store::default(),
            queue,
            initial_build: Some(tx),
        };
        (Arc::new(RwLock::new(index)), rx)
    }

    /// True once Services and Endpoints have both been listed.
    pub fn is_synced(&self) -> bool {
        *self.services.synced.borrow() && *self.endpoints.synced.borrow()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.services.get(namespace, name)
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Arc<Endpoints>> {
        self.endpoints.get(namespace, name)
    }

    /// Services in a namespace whose labels match the selector, ordered by
    /// name.
    pub fn services_matching(&self, namespace: &str, selector: &Selector) -> Vec<Arc<Service>> {
        self.services.matching(namespace, selector)
    }

    fn apply_kind<K: Kind>(&mut self, obj: K) {
        let Some(namespace) = obj.namespace() else {
            tracing::debug!(name = %obj.name_unchecked(), "Ignoring cluster-scoped resource");
            return;
        };
        let name = obj.name_unchecked();
        let obj = Arc::new(obj);

        let kind = match K::store_mut(self).insert(namespace.clone(), name.clone(), obj.clone()) {
            None => EventKind::Add,
            Some(old) if K::changed(&old, &obj) => EventKind::Update,
            Some(_) => {
                tracing::trace!(%namespace, %name, kind = %K::kind(&()), "Unchanged");
                return;
            }
        };
        tracing::debug!(%namespace, %name, kind = %K::kind(&()), event = ?kind, "Enqueuing");
        self.queue.push(Task::event(kind, K::resource(obj)));
    }

    fn delete_kind<K: Kind>(&mut self, namespace: String, name: String) {
        if let Some(old) = K::store_mut(self).remove(&namespace, &name) {
            tracing::debug!(%namespace, %name, kind = %K::kind(&()), "Enqueuing delete");
            self.queue
                .push(Task::event(EventKind::Delete, K::resource(old)));
        }
    }

    fn reset_kind<K: Kind>(&mut self, objs: Vec<K>, removed: NamespacedRemoved) {
        for obj in objs {
            self.apply_kind(obj);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_kind::<K>(namespace.clone(), name);
            }
        }

        if !*K::store(self).synced.borrow() {
            tracing::info!(kind = %K::kind(&()), "Initial list complete");
            K::store(self).synced.send_replace(true);
            K::on_synced(self);
        }
    }
}

impl<K> IndexNamespacedResource<K> for Index
where
    K: Kind,
{
    fn apply(&mut self, obj: K) {
        self.apply_kind(obj)
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_kind::<K>(namespace, name)
    }

    fn reset(&mut self, objs: Vec<K>, removed: NamespacedRemoved) {
        self.reset_kind(objs, removed)
    }
}

impl<K: Kind> SizedIndex<K> for Index {
    fn size(&self, namespace: &str) -> usize {
        K::store(self)
            .by_ns
            .get(namespace)
            .map(|objs| objs.len())
            .unwrap_or_default()
    }
}

/// Indexes plugin ConfigMaps once Services and Endpoints have been listed,
/// so that the first build of each node sees its dependencies.
pub async fn index_config_maps<T, S>(index: SharedIndex, target: Arc<RwLock<T>>, events: S)
where
    T: IndexNamespacedResource<ConfigMap>,
    S: Stream<Item = watcher::Event<ConfigMap>>,
{
    let (mut services, mut endpoints) = {
        let index = index.read();
        (
            index.services.synced.subscribe(),
            index.endpoints.synced.subscribe(),
        )
    };
    if services.wait_for(|synced| *synced).await.is_err()
        || endpoints.wait_for(|synced| *synced).await.is_err()
    {
        return;
    }
    tracing::debug!("Services and Endpoints synced; watching plugin configurations");
    kubert::index::namespaced(target, events).await
}

// === impl Store ===

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            by_ns: HashMap::default(),
            synced: watch::channel(false).0,
        }
    }
}

impl<T: ResourceExt> Store<T> {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<T>> {
        self.by_ns.get(namespace)?.get(name).cloned()
    }

    fn insert(&mut self, namespace: String, name: String, obj: Arc<T>) -> Option<Arc<T>> {
        self.by_ns.entry(namespace).or_default().insert(name, obj)
    }

    fn remove(&mut self, namespace: &str, name: &str) -> Option<Arc<T>> {
        let objs = self.by_ns.get_mut(namespace)?;
        let old = objs.remove(name);
        if objs.is_empty() {
            self.by_ns.remove(namespace);
        }
        old
    }

    fn matching(&self, namespace: &str, selector: &Selector) -> Vec<Arc<T>> {
        let mut objs = self
            .by_ns
            .get(namespace)
            .into_iter()
            .flat_map(|objs| objs.values())
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect::<Vec<_>>();
        objs.sort_by_key(|obj| obj.name_unchecked());
        objs
    }
}

// === impl Kind ===

impl Kind for Service {
    fn store(index: &Index) -> &Store<Self> {
        &index.services
    }

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.services
    }

    fn changed(old: &Self, new: &Self) -> bool {
        k8s::service_changed(old, new)
    }

    fn resource(obj: Arc<Self>) -> Resource {
        Resource::Service(obj)
    }
}

impl Kind for Endpoints {
    fn store(index: &Index) -> &Store<Self> {
        &index.endpoints
    }

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.endpoints
    }

    fn changed(old: &Self, new: &Self) -> bool {
        k8s::endpoints_changed(old, new)
    }

    fn resource(obj: Arc<Self>) -> Resource {
        Resource::Endpoints(obj)
    }
}

impl Kind for ConfigMap {
    fn store(index: &Index) -> &Store<Self> {
        &index.config_maps
    }

    fn store_mut(index: &mut Index) -> &mut Store<Self> {
        &mut index.config_maps
    }

    fn changed(old: &Self, new: &Self) -> bool {
        k8s::config_map_changed(old, new)
    }

    fn resource(obj: Arc<Self>) -> Resource {
        Resource::ConfigMap(obj)
    }

    /// Once plugin configurations have been listed, the registry reports
    /// when it has caught up.
    fn on_synced(index: &mut Index) {
        if let Some(tx) = index.initial_build.take() {
            index.queue.push(Task::Synced(tx));
        }
    }
}
