use crate::index::Index;
use ahash::AHashSet as HashSet;
use kato_xds_controller_core::{NodeIdentity, PluginConfig, PluginModel};
use kato_xds_controller_envoy::{self as envoy, Resources};
use kato_xds_controller_k8s_api::{labels, MeshEndpoints, MeshService, Selector};

/// The desired configuration of one sidecar.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    identity: NodeIdentity,
    model: PluginModel,
    config: PluginConfig,
    depend_service_ids: HashSet<String>,

    /// The last version published for this node.
    version: u64,

    /// The resources last published, if any.
    published: Option<Resources>,
}

// === impl NodeConfig ===

impl NodeConfig {
    pub fn new(identity: NodeIdentity, model: PluginModel, config: PluginConfig, version: u64) -> Self {
        let depend_service_ids = Self::depend_service_ids(&config);
        Self {
            identity,
            model,
            config,
            depend_service_ids,
            version,
            published: None,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Replaces the plugin configuration, retaining the published version.
    pub fn update(&mut self, model: PluginModel, config: PluginConfig) {
        self.depend_service_ids = Self::depend_service_ids(&config);
        self.model = model;
        self.config = config;
    }

    pub fn depends_on(&self, service_id: &str) -> bool {
        self.depend_service_ids.contains(service_id)
    }

    /// Builds the node's resources from the current index contents.
    pub fn build(&self, index: &Index) -> Resources {
        let (services, endpoints) = self.select(index);
        envoy::build(&envoy::Input {
            identity: &self.identity,
            model: self.model,
            config: &self.config,
            services: &services,
            endpoints: &endpoints,
        })
    }

    /// Returns true if `resources` differ from what was last published.
    pub fn is_changed(&self, resources: &Resources) -> bool {
        self.published.as_ref() != Some(resources)
    }

    pub(crate) fn published(&mut self, version: u64, resources: Resources) {
        self.version = version;
        self.published = Some(resources);
    }

    /// Selects the Services and Endpoints for each dependency by alias in the
    /// node's namespace.
    fn select(&self, index: &Index) -> (Vec<MeshService>, Vec<MeshEndpoints>) {
        let ns = &self.identity.namespace;

        let mut aliases = self
            .config
            .base_services
            .iter()
            .map(|dep| dep.depend_service_alias.as_str())
            .filter(|alias| !alias.is_empty())
            .collect::<Vec<_>>();
        aliases.sort_unstable();
        aliases.dedup();

        let mut services = Vec::new();
        let mut endpoints = Vec::new();
        for alias in aliases {
            let selector = Selector::from_iter(Some((
                labels::SERVICE_ALIAS.to_string(),
                alias.to_string(),
            )));
            for svc in index.services_matching(ns, &selector) {
                let Some(svc) = MeshService::from_service(&svc) else {
                    continue;
                };
                if let Some(ep) = index
                    .endpoints(ns, &svc.name)
                    .and_then(|ep| MeshEndpoints::from_endpoints(&ep))
                {
                    endpoints.push(ep);
                }
                services.push(svc);
            }
        }

        (services, endpoints)
    }

    fn depend_service_ids(config: &PluginConfig) -> HashSet<String> {
        config.depend_service_ids().map(ToString::to_string).collect()
    }
}
