//! A minimal unary xDS client.

use anyhow::{bail, Context, Result};
use kato_xds_controller_core::{
    pb::{
        envoy::{
            config::{
                cluster::v3::Cluster, core::v3::Node, endpoint::v3::ClusterLoadAssignment,
                listener::v3::Listener,
            },
            service::{
                cluster::v3::cluster_discovery_service_client::ClusterDiscoveryServiceClient,
                discovery::v3::{DiscoveryRequest, DiscoveryResponse},
                endpoint::v3::endpoint_discovery_service_client::EndpointDiscoveryServiceClient,
                listener::v3::listener_discovery_service_client::ListenerDiscoveryServiceClient,
            },
        },
        google::protobuf::Any,
    },
    NodeIdentity, ResourceType,
};
use prost::Message;
use tonic::transport::{Channel, Endpoint};

#[derive(Clone, Debug, clap::Args)]
pub struct XdsArgs {
    /// The sidecar's node ID, `<namespace>_<plugin>_<alias>`.
    #[clap(long, env = "ENVOY_NODE_ID")]
    node_id: Option<String>,

    /// Used with `PLUGIN_ID` and `SERVICE_NAME` when no node ID is set.
    #[clap(long, env = "TENANT_ID")]
    tenant_id: Option<String>,

    #[clap(long, env = "PLUGIN_ID")]
    plugin_id: Option<String>,

    #[clap(long, env = "SERVICE_NAME")]
    service_name: Option<String>,

    #[clap(long, env = "XDS_HOST_IP")]
    xds_host_ip: String,

    #[clap(long, env = "XDS_HOST_PORT", default_value = "6101")]
    xds_host_port: u16,
}

/// Fetches a single sidecar's resources from the control plane.
#[derive(Clone, Debug)]
pub struct Client {
    node: String,
    channel: Channel,
}

// === impl XdsArgs ===

impl XdsArgs {
    pub fn node_id(&self) -> Result<String> {
        if let Some(id) = self.node_id.as_ref().filter(|id| !id.is_empty()) {
            return Ok(id.clone());
        }
        match (&self.tenant_id, &self.plugin_id, &self.service_name) {
            (Some(tenant), Some(plugin), Some(service)) => {
                Ok(NodeIdentity::new(tenant, plugin, service).to_string())
            }
            _ => bail!("ENVOY_NODE_ID or TENANT_ID, PLUGIN_ID, and SERVICE_NAME must be set"),
        }
    }

    /// Builds a client. The connection is established lazily, so an
    /// unavailable control plane only fails individual fetches.
    pub fn client(&self) -> Result<Client> {
        let node = self.node_id()?;
        let uri = format!("http://{}:{}", self.xds_host_ip, self.xds_host_port);
        let channel = Endpoint::from_shared(uri.clone())
            .with_context(|| format!("invalid control plane address {uri}"))?
            .connect_lazy();
        tracing::debug!(%node, %uri, "Built xDS client");
        Ok(Client::new(node, channel))
    }
}

// === impl Client ===

impl Client {
    pub(crate) fn new(node: String, channel: Channel) -> Self {
        Self { node, channel }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn clusters(&self) -> Result<Vec<Cluster>> {
        let rsp = ClusterDiscoveryServiceClient::new(self.channel.clone())
            .fetch_clusters(self.request(ResourceType::Cluster))
            .await?;
        decode_all(rsp.into_inner())
    }

    pub async fn endpoints(&self) -> Result<Vec<ClusterLoadAssignment>> {
        let rsp = EndpointDiscoveryServiceClient::new(self.channel.clone())
            .fetch_endpoints(self.request(ResourceType::Endpoint))
            .await?;
        decode_all(rsp.into_inner())
    }

    pub async fn listeners(&self) -> Result<Vec<Listener>> {
        let rsp = ListenerDiscoveryServiceClient::new(self.channel.clone())
            .fetch_listeners(self.request(ResourceType::Listener))
            .await?;
        decode_all(rsp.into_inner())
    }

    fn request(&self, ty: ResourceType) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(Node {
                id: self.node.clone(),
                cluster: self.node.clone(),
                ..Default::default()
            }),
            type_url: ty.type_url().to_string(),
            ..Default::default()
        }
    }
}

fn decode_all<M: Message + Default>(rsp: DiscoveryResponse) -> Result<Vec<M>> {
    rsp.resources.iter().map(decode).collect()
}

fn decode<M: Message + Default>(any: &Any) -> Result<M> {
    M::decode(any.value.as_slice()).with_context(|| format!("malformed {}", any.type_url))
}
