//! Typed views over the Kubernetes objects that describe the mesh.

use crate::labels;
use k8s_openapi::api::core::v1::{ConfigMap, EndpointAddress, Endpoints, Service};
use kato_xds_controller_core::{NodeIdentity, PluginConfig, PluginConfigError, PluginModel};
use kube::ResourceExt;
use std::{fmt, str::FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Inner,
    Outer,
}

/// The application protocol of a port. Unknown protocols are proxied as TCP.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Http,
    Grpc,
    #[default]
    Tcp,
    Udp,
}

/// A Service that participates in the mesh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshService {
    pub name: String,
    pub namespace: String,
    pub service_alias: String,
    pub service_id: Option<String>,
    pub service_type: ServiceType,
    pub protocol: Protocol,
    pub port: u16,
    pub origin_port: Option<u16>,
    pub domain: Option<String>,
}

/// The addresses backing a mesh Service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshEndpoints {
    pub name: String,
    pub namespace: String,
    pub subsets: Vec<EndpointGroup>,
}

/// A single Endpoints subset. Only the first port of a subset is used.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointGroup {
    pub port: Option<u16>,
    pub ready: Vec<String>,
    pub not_ready: Vec<String>,
}

/// The identifying fields of a plugin ConfigMap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginConfigMap {
    pub identity: NodeIdentity,
    pub model: PluginModel,
    config: Option<String>,
}

// === impl ServiceType ===

impl FromStr for ServiceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inner" => Ok(Self::Inner),
            "outer" => Ok(Self::Outer),
            _ => Err(()),
        }
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Self::Http,
            "grpc" => Self::Grpc,
            "udp" => Self::Udp,
            _ => Self::Tcp,
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Grpc)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => "http".fmt(f),
            Self::Grpc => "grpc".fmt(f),
            Self::Tcp => "tcp".fmt(f),
            Self::Udp => "udp".fmt(f),
        }
    }
}

// === impl MeshService ===

impl MeshService {
    /// Extracts the mesh view of a Service, returning `None` if it lacks the
    /// labels or ports the mesh requires.
    pub fn from_service(svc: &Service) -> Option<Self> {
        let name = svc.name_unchecked();
        let namespace = svc.namespace()?;
        let labels = svc.labels();

        let Some(service_alias) = labels.get(labels::SERVICE_ALIAS).cloned() else {
            tracing::debug!(%namespace, service = %name, "Service has no alias");
            return None;
        };
        let Some(service_type) = labels
            .get(labels::SERVICE_TYPE)
            .and_then(|t| t.parse().ok())
        else {
            tracing::debug!(%namespace, service = %name, "Service has no valid service type");
            return None;
        };

        let ports = svc.spec.as_ref().and_then(|spec| spec.ports.as_deref());
        let Some(port) = ports
            .and_then(|ports| ports.first())
            .and_then(|p| u16::try_from(p.port).ok())
        else {
            tracing::debug!(%namespace, service = %name, "Service has no ports");
            return None;
        };
        if ports.map(|p| p.len()).unwrap_or_default() > 1 {
            tracing::debug!(%namespace, service = %name, %port, "Only the first service port is used");
        }

        let origin_port = labels.get(labels::ORIGIN_PORT).and_then(|p| p.parse().ok());
        let protocol = labels
            .get(labels::PORT_PROTOCOL)
            .map(|p| Protocol::parse(p))
            .unwrap_or_default();
        let domain = svc
            .annotations()
            .get(labels::DOMAIN_ANNOTATION)
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        Some(Self {
            name,
            namespace,
            service_id: labels.get(labels::SERVICE_ID).cloned(),
            service_alias,
            service_type,
            protocol,
            port,
            origin_port,
            domain,
        })
    }

    pub fn is_inner(&self) -> bool {
        self.service_type == ServiceType::Inner
    }
}

// === impl MeshEndpoints ===

impl MeshEndpoints {
    pub fn from_endpoints(ep: &Endpoints) -> Option<Self> {
        let subsets = ep
            .subsets
            .iter()
            .flatten()
            .map(|subset| {
                let ips = |addrs: &Option<Vec<EndpointAddress>>| {
                    addrs
                        .iter()
                        .flatten()
                        .map(|a| a.ip.clone())
                        .collect::<Vec<_>>()
                };
                EndpointGroup {
                    port: subset
                        .ports
                        .as_ref()
                        .and_then(|ports| ports.first())
                        .and_then(|p| u16::try_from(p.port).ok()),
                    ready: ips(&subset.addresses),
                    not_ready: ips(&subset.not_ready_addresses),
                }
            })
            .collect();

        Some(Self {
            name: ep.name_unchecked(),
            namespace: ep.namespace()?,
            subsets,
        })
    }
}

// === impl PluginConfigMap ===

impl PluginConfigMap {
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, PluginConfigError> {
        let identity = Self::identity(cm)?;
        let model = cm
            .labels()
            .get(labels::PLUGIN_MODEL)
            .ok_or(PluginConfigError::MissingLabel(labels::PLUGIN_MODEL))?
            .parse()?;
        let config = cm
            .data
            .as_ref()
            .and_then(|data| data.get(labels::PLUGIN_CONFIG_KEY))
            .cloned();
        Ok(Self {
            identity,
            model,
            config,
        })
    }

    /// Derives the node identity from a ConfigMap's namespace and labels.
    pub fn identity(cm: &ConfigMap) -> Result<NodeIdentity, PluginConfigError> {
        let namespace = cm
            .namespace()
            .ok_or(PluginConfigError::MissingLabel("namespace"))?;
        let labels = cm.labels();
        let plugin_id = labels
            .get(labels::PLUGIN_ID)
            .ok_or(PluginConfigError::MissingLabel(labels::PLUGIN_ID))?;
        let alias = labels
            .get(labels::SERVICE_ALIAS)
            .ok_or(PluginConfigError::MissingLabel(labels::SERVICE_ALIAS))?;
        Ok(NodeIdentity::new(namespace, plugin_id, alias))
    }

    /// Decodes the plugin configuration.
    pub fn plugin_config(&self) -> Result<PluginConfig, PluginConfigError> {
        let json = self
            .config
            .as_deref()
            .ok_or(PluginConfigError::MissingData(labels::PLUGIN_CONFIG_KEY))?;
        PluginConfig::from_json(json)
    }
}
