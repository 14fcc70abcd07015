use kato_xds_controller_k8s_api::{labels, ConfigMap, Endpoints, ResourceExt, Service};
use std::sync::Arc;
use tokio::sync::watch;

/// A unit of work for the node config registry.
#[derive(Debug)]
pub enum Task {
    Event { kind: EventKind, resource: Resource },

    /// Enqueued once every watch has completed its initial list; the sender
    /// is set once all earlier tasks have been handled.
    Synced(watch::Sender<bool>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

/// A snapshot of a changed object.
#[derive(Clone, Debug)]
pub enum Resource {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    ConfigMap(Arc<ConfigMap>),
}

// === impl Task ===

impl Task {
    pub fn event(kind: EventKind, resource: Resource) -> Self {
        Self::Event { kind, resource }
    }
}

// === impl Resource ===

impl Resource {
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Service(svc) => svc.namespace(),
            Self::Endpoints(ep) => ep.namespace(),
            Self::ConfigMap(cm) => cm.namespace(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Service(svc) => svc.name_unchecked(),
            Self::Endpoints(ep) => ep.name_unchecked(),
            Self::ConfigMap(cm) => cm.name_unchecked(),
        }
    }

    /// The platform service id the object belongs to, if it is labeled.
    pub fn service_id(&self) -> Option<&str> {
        let meta = match self {
            Self::Service(svc) => svc.labels(),
            Self::Endpoints(ep) => ep.labels(),
            Self::ConfigMap(cm) => cm.labels(),
        };
        meta.get(labels::SERVICE_ID).map(String::as_str)
    }
}
