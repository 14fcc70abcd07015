use crate::identity::NodeIdentity;
use ahash::AHashSet as HashSet;
use envoy_types::pb::{
    envoy::config::{
        cluster::v3::Cluster, endpoint::v3::ClusterLoadAssignment, listener::v3::Listener,
        route::v3::RouteConfiguration,
    },
    google::protobuf::Any,
};
use prost::Message;

/// The xDS resource types served to sidecars.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Listener,
    Route,
    Cluster,
    Endpoint,
    Secret,
}

/// An immutable set of resources published to a single node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    version: u64,
    listeners: Vec<Listener>,
    clusters: Vec<Cluster>,
    endpoints: Vec<ClusterLoadAssignment>,
    routes: Vec<RouteConfiguration>,
}

/// Publishes snapshots to sidecars.
///
/// Implementations must reject versions that do not exceed every version
/// previously published for the same node.
pub trait SnapshotSink {
    /// The highest version ever published for the node, including snapshots
    /// that have since been cleared.
    fn last_version(&self, node: &NodeIdentity) -> u64;

    fn set_snapshot(&self, node: &NodeIdentity, snapshot: Snapshot) -> Result<(), PublishError>;

    fn clear_snapshot(&self, node: &NodeIdentity);
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("snapshot version {version} does not exceed published version {published}")]
    StaleVersion { version: u64, published: u64 },

    #[error("snapshot cache is closed")]
    Closed,
}

// === impl ResourceType ===

impl ResourceType {
    pub const ALL: [Self; 5] = [
        Self::Listener,
        Self::Route,
        Self::Cluster,
        Self::Endpoint,
        Self::Secret,
    ];

    pub const fn type_url(&self) -> &'static str {
        match self {
            Self::Listener => "type.googleapis.com/envoy.config.listener.v3.Listener",
            Self::Route => "type.googleapis.com/envoy.config.route.v3.RouteConfiguration",
            Self::Cluster => "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Self::Endpoint => "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment",
            Self::Secret => "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret",
        }
    }

    pub fn from_type_url(url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_url() == url)
    }

    /// Returns true for types that are requested by name rather than as a
    /// wildcard.
    pub fn is_named(&self) -> bool {
        matches!(self, Self::Endpoint | Self::Route | Self::Secret)
    }
}

// === impl Snapshot ===

impl Snapshot {
    /// Builds a snapshot, dropping any load assignment that does not refer to
    /// a cluster in the same snapshot.
    pub fn new(
        version: u64,
        listeners: Vec<Listener>,
        clusters: Vec<Cluster>,
        endpoints: Vec<ClusterLoadAssignment>,
        routes: Vec<RouteConfiguration>,
    ) -> Self {
        let names = clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect::<HashSet<_>>();
        let endpoints = endpoints
            .into_iter()
            .filter(|cla| {
                let known = names.contains(cla.cluster_name.as_str());
                if !known {
                    tracing::warn!(cluster = %cla.cluster_name, "Dropping load assignment for unknown cluster");
                }
                known
            })
            .collect();

        Self {
            version,
            listeners,
            clusters,
            endpoints,
            routes,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The `version_info` reported to sidecars.
    pub fn version_info(&self) -> String {
        format!("version_{}", self.version)
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    pub fn endpoints(&self) -> &[ClusterLoadAssignment] {
        &self.endpoints
    }

    pub fn routes(&self) -> &[RouteConfiguration] {
        &self.routes
    }

    /// Encodes the resources of the given type. When `names` is non-empty,
    /// only resources with those names are returned.
    pub fn resources(&self, ty: ResourceType, names: &[String]) -> Vec<Any> {
        fn select<'a, T: Message + 'a>(
            ty: ResourceType,
            names: &[String],
            items: impl Iterator<Item = (&'a str, &'a T)>,
        ) -> Vec<Any> {
            items
                .filter(|(name, _)| names.is_empty() || names.iter().any(|n| n == name))
                .map(|(_, msg)| to_any(ty.type_url(), msg))
                .collect()
        }

        match ty {
            ResourceType::Listener => select(
                ty,
                names,
                self.listeners.iter().map(|l| (l.name.as_str(), l)),
            ),
            ResourceType::Route => select(
                ty,
                names,
                self.routes.iter().map(|r| (r.name.as_str(), r)),
            ),
            ResourceType::Cluster => select(
                ty,
                names,
                self.clusters.iter().map(|c| (c.name.as_str(), c)),
            ),
            ResourceType::Endpoint => select(
                ty,
                names,
                self.endpoints.iter().map(|e| (e.cluster_name.as_str(), e)),
            ),
            // Secrets are never configured by this control plane.
            ResourceType::Secret => Vec::new(),
        }
    }
}

/// Packs a message into an `Any` with the given type URL.
pub fn to_any<M: Message>(type_url: &str, msg: &M) -> Any {
    Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn cla(name: &str) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn drops_orphaned_load_assignments() {
        let snapshot = Snapshot::new(
            3,
            vec![],
            vec![cluster("a"), cluster("b")],
            vec![cla("a"), cla("c")],
            vec![],
        );
        assert_eq!(snapshot.version_info(), "version_3");
        assert_eq!(snapshot.endpoints().len(), 1);
        assert_eq!(snapshot.endpoints()[0].cluster_name, "a");
    }

    #[test]
    fn filters_resources_by_name() {
        let snapshot = Snapshot::new(
            1,
            vec![],
            vec![cluster("a"), cluster("b")],
            vec![cla("a"), cla("b")],
            vec![],
        );

        let all = snapshot.resources(ResourceType::Endpoint, &[]);
        assert_eq!(all.len(), 2);

        let named = snapshot.resources(ResourceType::Endpoint, &["b".to_string()]);
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].type_url, ResourceType::Endpoint.type_url());
        let decoded = ClusterLoadAssignment::decode(named[0].value.as_slice()).unwrap();
        assert_eq!(decoded.cluster_name, "b");

        assert!(snapshot.resources(ResourceType::Secret, &[]).is_empty());
    }

    #[test]
    fn type_urls_round_trip() {
        for ty in ResourceType::ALL {
            assert_eq!(ResourceType::from_type_url(ty.type_url()), Some(ty));
        }
        assert_eq!(ResourceType::from_type_url("type.googleapis.com/nope"), None);
    }
}
