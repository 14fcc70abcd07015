//! Tracks the desired configuration of every sidecar and publishes a new
//! snapshot whenever a change affects one.

use crate::{
    index::SharedIndex,
    metrics::RegistryMetrics,
    node_config::NodeConfig,
    queue::Handler,
    task::{EventKind, Resource, Task},
};
use anyhow::{bail, Result};
use kato_xds_controller_core::{NodeIdentity, SnapshotSink};
use kato_xds_controller_k8s_api::{labels, ConfigMap, PluginConfigMap, ResourceExt};

pub struct Registry<S> {
    index: SharedIndex,
    sink: S,
    nodes: Vec<NodeConfig>,
    metrics: RegistryMetrics,
}

// === impl Registry ===

impl<S: SnapshotSink> Registry<S> {
    pub fn new(index: SharedIndex, sink: S, metrics: RegistryMetrics) -> Self {
        Self {
            index,
            sink,
            nodes: Vec::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.identity() == identity)
    }

    /// Records a plugin ConfigMap and rebuilds its node.
    ///
    /// A malformed configuration is logged and leaves any existing entry
    /// untouched.
    fn add_or_replace(&mut self, cm: &ConfigMap) -> Result<()> {
        let pcm = match PluginConfigMap::from_config_map(cm) {
            Ok(pcm) => pcm,
            Err(error) => {
                tracing::debug!(
                    ns = %cm.namespace().unwrap_or_default(),
                    name = %cm.name_unchecked(),
                    %error,
                    "Ignoring ConfigMap",
                );
                return Ok(());
            }
        };
        let config = match pcm.plugin_config() {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(node = %pcm.identity, %error, "Invalid plugin configuration");
                self.metrics.rebuild_errors.inc();
                return Ok(());
            }
        };

        if !self.index.read().is_synced() {
            bail!("resource index has not synced");
        }

        let idx = match self.position(&pcm.identity) {
            Some(idx) => {
                self.nodes[idx].update(pcm.model, config);
                idx
            }
            None => {
                let version = self.sink.last_version(&pcm.identity);
                tracing::info!(node = %pcm.identity, model = %pcm.model, "Adding node");
                self.nodes
                    .push(NodeConfig::new(pcm.identity, pcm.model, config, version));
                self.metrics.node_configs.set(self.nodes.len() as i64);
                self.nodes.len() - 1
            }
        };
        self.rebuild(idx);
        Ok(())
    }

    fn delete(&mut self, cm: &ConfigMap) {
        let Ok(identity) = PluginConfigMap::identity(cm) else {
            return;
        };
        let Some(idx) = self.position(&identity) else {
            return;
        };

        tracing::info!(node = %identity, "Removing node");
        self.nodes.remove(idx);
        self.sink.clear_snapshot(&identity);
        self.metrics.cleared.inc();
        self.metrics.node_configs.set(self.nodes.len() as i64);
    }

    /// Rebuilds every node that depends on the service a changed object
    /// belongs to.
    fn dispatch(&mut self, resource: &Resource) -> Result<()> {
        let service_id = match resource.service_id() {
            Some(id) => Some(id.to_string()),
            // Endpoints are not always labeled; fall back to the Service of
            // the same name.
            None => match (resource, resource.namespace()) {
                (Resource::Endpoints(_), Some(ns)) => self
                    .index
                    .read()
                    .service(&ns, &resource.name())
                    .and_then(|svc| svc.labels().get(labels::SERVICE_ID).cloned()),
                _ => None,
            },
        };
        let Some(service_id) = service_id else {
            tracing::trace!(name = %resource.name(), "Ignoring resource without service id");
            return Ok(());
        };

        let affected = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.depends_on(&service_id))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        if affected.is_empty() {
            return Ok(());
        }

        if !self.index.read().is_synced() {
            bail!("resource index has not synced");
        }
        tracing::debug!(%service_id, nodes = affected.len(), "Rebuilding dependents");
        for idx in affected {
            self.rebuild(idx);
        }
        Ok(())
    }

    /// Builds a node's resources and publishes them if they changed.
    ///
    /// Resources without clusters or without listeners are never published.
    /// A publish failure is logged and retried on the next change affecting
    /// the node.
    fn rebuild(&mut self, idx: usize) {
        let resources = {
            let index = self.index.read();
            self.nodes[idx].build(&index)
        };
        let node = &mut self.nodes[idx];

        if !resources.is_publishable() {
            tracing::debug!(
                node = %node.identity(),
                clusters = resources.clusters.len(),
                listeners = resources.listeners.len(),
                "Holding back incomplete configuration",
            );
            self.metrics.held_back.inc();
            return;
        }
        if !node.is_changed(&resources) {
            tracing::trace!(node = %node.identity(), "Configuration unchanged");
            return;
        }

        let version = node.version().max(self.sink.last_version(node.identity())) + 1;
        match self
            .sink
            .set_snapshot(node.identity(), resources.to_snapshot(version))
        {
            Ok(()) => {
                tracing::info!(
                    node = %node.identity(),
                    version,
                    clusters = resources.clusters.len(),
                    listeners = resources.listeners.len(),
                    endpoints = resources.endpoints.len(),
                    "Published snapshot",
                );
                node.published(version, resources);
                self.metrics.published.inc();
            }
            Err(error) => {
                tracing::warn!(node = %node.identity(), version, %error, "Failed to publish snapshot");
                self.metrics.rebuild_errors.inc();
            }
        }
    }

    fn position(&self, identity: &NodeIdentity) -> Option<usize> {
        self.nodes.iter().position(|n| n.identity() == identity)
    }
}

impl<S: SnapshotSink> Handler<Task> for Registry<S> {
    fn handle(&mut self, task: &Task) -> Result<()> {
        match task {
            Task::Event {
                kind,
                resource: Resource::ConfigMap(cm),
            } => match kind {
                EventKind::Delete => {
                    self.delete(cm);
                    Ok(())
                }
                EventKind::Add | EventKind::Update => self.add_or_replace(cm),
            },
            Task::Event { resource, .. } => self.dispatch(resource),
            Task::Synced(tx) => {
                tracing::info!(nodes = self.nodes.len(), "Initial build complete");
                tx.send_replace(true);
                Ok(())
            }
        }
    }
}
