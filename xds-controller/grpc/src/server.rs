use crate::{
    metrics::GrpcServerMetricsFamily,
    sotw::{self, ResponseStream},
    SnapshotCache,
};
use futures::prelude::*;
use kato_xds_controller_core::{
    pb::envoy::service::{
        cluster::v3::cluster_discovery_service_server::{
            ClusterDiscoveryService, ClusterDiscoveryServiceServer,
        },
        discovery::v3::{
            aggregated_discovery_service_server::{
                AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
            },
            DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
        },
        endpoint::v3::endpoint_discovery_service_server::{
            EndpointDiscoveryService, EndpointDiscoveryServiceServer,
        },
        listener::v3::listener_discovery_service_server::{
            ListenerDiscoveryService, ListenerDiscoveryServiceServer,
        },
        route::v3::route_discovery_service_server::{
            RouteDiscoveryService, RouteDiscoveryServiceServer,
        },
        secret::v3::secret_discovery_service_server::{
            SecretDiscoveryService, SecretDiscoveryServiceServer,
        },
    },
    ResourceType,
};
use std::pin::Pin;
use tonic::{Request, Response, Status, Streaming};

/// Serves snapshots to sidecars over every state-of-the-world xDS service.
#[derive(Clone, Debug)]
pub struct XdsServer {
    cache: SnapshotCache,
    drain: drain::Watch,
    metrics: GrpcServerMetricsFamily,
}

type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

const ADS: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
const CDS: &str = "envoy.service.cluster.v3.ClusterDiscoveryService";
const EDS: &str = "envoy.service.endpoint.v3.EndpointDiscoveryService";
const LDS: &str = "envoy.service.listener.v3.ListenerDiscoveryService";
const RDS: &str = "envoy.service.route.v3.RouteDiscoveryService";
const SDS: &str = "envoy.service.secret.v3.SecretDiscoveryService";

// === impl XdsServer ===

impl XdsServer {
    pub fn new(cache: SnapshotCache, metrics: GrpcServerMetricsFamily, drain: drain::Watch) -> Self {
        Self {
            cache,
            drain,
            metrics,
        }
    }

    pub fn ads(&self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self.clone())
    }

    pub fn cds(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn eds(&self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self.clone())
    }

    pub fn lds(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    pub fn rds(&self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self.clone())
    }

    pub fn sds(&self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self.clone())
    }

    fn stream(
        &self,
        service: &'static str,
        method: &'static str,
        ty: Option<ResourceType>,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        let observer = self.metrics.start_stream(service, method);
        tracing::debug!(
            service,
            method,
            client = ?req.remote_addr(),
            "Stream opened",
        );
        Ok(Response::new(sotw::response_stream(
            self.cache.clone(),
            ty,
            req.into_inner(),
            self.drain.clone(),
            observer,
        )))
    }

    fn fetch(
        &self,
        service: &'static str,
        method: &'static str,
        ty: ResourceType,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let mut observer = self.metrics.start_unary(service, method);
        match sotw::fetch(&self.cache, ty, req.into_inner()) {
            Ok(rsp) => {
                observer.sent(ty);
                Ok(Response::new(rsp))
            }
            Err(status) => {
                observer.end(status.code());
                Err(status)
            }
        }
    }

    fn delta(
        &self,
        service: &'static str,
        method: &'static str,
    ) -> Result<Response<DeltaStream>, Status> {
        let status = Status::unimplemented("incremental xDS is not supported");
        self.metrics
            .start_stream(service, method)
            .end(status.code());
        Err(status)
    }
}

#[async_trait::async_trait]
impl AggregatedDiscoveryService for XdsServer {
    type StreamAggregatedResourcesStream = ResponseStream;

    async fn stream_aggregated_resources(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(ADS, "StreamAggregatedResources", None, req)
    }

    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn delta_aggregated_resources(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(ADS, "DeltaAggregatedResources")
    }
}

#[async_trait::async_trait]
impl ClusterDiscoveryService for XdsServer {
    type StreamClustersStream = ResponseStream;

    async fn stream_clusters(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(CDS, "StreamClusters", Some(ResourceType::Cluster), req)
    }

    type DeltaClustersStream = DeltaStream;

    async fn delta_clusters(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(CDS, "DeltaClusters")
    }

    async fn fetch_clusters(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(CDS, "FetchClusters", ResourceType::Cluster, req)
    }
}

#[async_trait::async_trait]
impl EndpointDiscoveryService for XdsServer {
    type StreamEndpointsStream = ResponseStream;

    async fn stream_endpoints(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(EDS, "StreamEndpoints", Some(ResourceType::Endpoint), req)
    }

    type DeltaEndpointsStream = DeltaStream;

    async fn delta_endpoints(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(EDS, "DeltaEndpoints")
    }

    async fn fetch_endpoints(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(EDS, "FetchEndpoints", ResourceType::Endpoint, req)
    }
}

#[async_trait::async_trait]
impl ListenerDiscoveryService for XdsServer {
    type StreamListenersStream = ResponseStream;

    async fn stream_listeners(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(LDS, "StreamListeners", Some(ResourceType::Listener), req)
    }

    type DeltaListenersStream = DeltaStream;

    async fn delta_listeners(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(LDS, "DeltaListeners")
    }

    async fn fetch_listeners(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(LDS, "FetchListeners", ResourceType::Listener, req)
    }
}

#[async_trait::async_trait]
impl RouteDiscoveryService for XdsServer {
    type StreamRoutesStream = ResponseStream;

    async fn stream_routes(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(RDS, "StreamRoutes", Some(ResourceType::Route), req)
    }

    type DeltaRoutesStream = DeltaStream;

    async fn delta_routes(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(RDS, "DeltaRoutes")
    }

    async fn fetch_routes(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(RDS, "FetchRoutes", ResourceType::Route, req)
    }
}

#[async_trait::async_trait]
impl SecretDiscoveryService for XdsServer {
    type StreamSecretsStream = ResponseStream;

    async fn stream_secrets(
        &self,
        req: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<ResponseStream>, Status> {
        self.stream(SDS, "StreamSecrets", Some(ResourceType::Secret), req)
    }

    type DeltaSecretsStream = DeltaStream;

    async fn delta_secrets(
        &self,
        _req: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<DeltaStream>, Status> {
        self.delta(SDS, "DeltaSecrets")
    }

    async fn fetch_secrets(
        &self,
        req: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        self.fetch(SDS, "FetchSecrets", ResourceType::Secret, req)
    }
}
