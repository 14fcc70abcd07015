//! Label and annotation keys consumed by the mesh, and label selection.

use std::collections::BTreeMap;

pub const CREATOR: &str = "creator";
pub const SERVICE_ALIAS: &str = "service_alias";
pub const SERVICE_ID: &str = "service_id";
pub const SERVICE_TYPE: &str = "service_type";
pub const PORT_PROTOCOL: &str = "port_protocol";
pub const ORIGIN_PORT: &str = "origin_port";
pub const PLUGIN_ID: &str = "plugin_id";
pub const PLUGIN_MODEL: &str = "plugin-model";

/// Annotates a Service that resolves to a third-party host via DNS.
pub const DOMAIN_ANNOTATION: &str = "domain";

/// The ConfigMap data key holding the JSON plugin configuration.
pub const PLUGIN_CONFIG_KEY: &str = "plugin-config";

pub type Map = BTreeMap<String, String>;

/// Selects resources whose labels include every listed key/value pair.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
}

// === Selector ===

impl Selector {
    pub fn from_map(match_labels: Map) -> Self {
        Self { match_labels }
    }

    pub fn matches(&self, labels: &Map) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}
