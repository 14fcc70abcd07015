use crate::{duration, route, socket_address, validate, RATE_LIMIT_CLUSTER};
use kato_xds_controller_core::{
    options::RateLimit,
    pb::envoy::{
        config::{
            core::v3::{grpc_service, ApiVersion, GrpcService},
            listener::v3::{filter, Filter, FilterChain, Listener},
            ratelimit::v3::RateLimitServiceConfig,
            route::v3::RouteConfiguration,
        },
        extensions::filters::{
            http::{ratelimit::v3::RateLimit as RateLimitFilter, router::v3::Router},
            network::{
                http_connection_manager::v3::{
                    http_connection_manager::{CodecType, RouteSpecifier},
                    http_filter, HttpConnectionManager, HttpFilter,
                },
                tcp_proxy::v3::{
                    tcp_proxy::{self, weighted_cluster::ClusterWeight},
                    TcpProxy,
                },
            },
        },
    },
    to_any, Options,
};
use kato_xds_controller_k8s_api::Protocol;
use prost::Message;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const HTTP_CONNECTION_MANAGER_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const TCP_PROXY: &str = "envoy.filters.network.tcp_proxy";
const TCP_PROXY_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const ROUTER: &str = "envoy.filters.http.router";
const ROUTER_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const RATE_LIMIT: &str = "envoy.filters.http.ratelimit";
const RATE_LIMIT_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.ratelimit.v3.RateLimit";

/// Upstreams that share a local port.
#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    pub(crate) port: u16,
    pub(crate) protocol: Protocol,
    upstreams: Vec<Upstream>,
}

#[derive(Clone, Debug)]
pub(crate) struct Upstream {
    pub(crate) cluster: String,
    pub(crate) options: Options,
}

// === impl Outbound ===

impl Outbound {
    pub(crate) fn new(port: u16, protocol: Protocol) -> Self {
        Self {
            port,
            protocol,
            upstreams: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, cluster: String, options: Options) {
        self.upstreams.push(Upstream { cluster, options });
    }
}

/// Builds the listener through which the workload reaches its upstreams on
/// `127.0.0.1:<port>`.
pub(crate) fn outbound(name: String, group: &Outbound) -> Option<Listener> {
    let filter = if group.protocol.is_http() {
        let routes = route::outbound(&name, group.port, group.protocol, &group.upstreams);
        if let Err(error) = validate::route_config(&routes) {
            tracing::error!(listener = %name, %error, "Dropping listener with invalid routes");
            return None;
        }
        http_connection_manager(&name, routes, Vec::new())
    } else {
        let first = group.upstreams.first()?;
        let cluster_specifier = match group.upstreams.as_slice() {
            [upstream] => tcp_proxy::ClusterSpecifier::Cluster(upstream.cluster.clone()),
            upstreams => tcp_proxy::ClusterSpecifier::WeightedClusters(tcp_proxy::WeightedCluster {
                clusters: upstreams
                    .iter()
                    .map(|u| ClusterWeight {
                        name: u.cluster.clone(),
                        weight: u.options.weight.max(1),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
        };
        tcp_proxy_filter(&name, cluster_specifier, &first.options)
    };

    Some(listener(name, "127.0.0.1", group.port, filter))
}

/// Builds the listener through which other workloads reach a local port.
pub(crate) fn inbound(
    name: String,
    listen_port: u16,
    cluster: &str,
    protocol: Protocol,
    opts: &Options,
) -> Option<Listener> {
    let filter = if protocol.is_http() {
        let routes = route::inbound(&name, cluster, opts);
        if let Err(error) = validate::route_config(&routes) {
            tracing::error!(listener = %name, %error, "Dropping listener with invalid routes");
            return None;
        }
        let filters = opts.rate_limit.iter().map(rate_limit_filter).collect();
        http_connection_manager(&name, routes, filters)
    } else {
        tcp_proxy_filter(
            &name,
            tcp_proxy::ClusterSpecifier::Cluster(cluster.to_string()),
            opts,
        )
    };

    Some(listener(name, "0.0.0.0", listen_port, filter))
}

/// Decodes the HTTP connection manager of a listener, if it has one.
pub fn http_connection_manager_of(listener: &Listener) -> Option<HttpConnectionManager> {
    listener
        .filter_chains
        .iter()
        .flat_map(|chain| chain.filters.iter())
        .find(|f| f.name == HTTP_CONNECTION_MANAGER)
        .and_then(|f| match &f.config_type {
            Some(filter::ConfigType::TypedConfig(any)) => {
                HttpConnectionManager::decode(any.value.as_slice()).ok()
            }
            _ => None,
        })
}

/// Returns the virtual host domains a listener routes, without ports or
/// wildcards.
pub fn virtual_host_domains(listener: &Listener) -> Vec<String> {
    let Some(hcm) = http_connection_manager_of(listener) else {
        return Vec::new();
    };
    let Some(RouteSpecifier::RouteConfig(routes)) = hcm.route_specifier else {
        return Vec::new();
    };
    routes
        .virtual_hosts
        .iter()
        .flat_map(|vh| vh.domains.iter())
        .map(|d| d.rsplit_once(':').map(|(host, _)| host).unwrap_or(d.as_str()))
        .filter(|d| !d.is_empty() && !d.contains('*'))
        .map(ToString::to_string)
        .collect()
}

fn listener(name: String, ip: &str, port: u16, filter: Filter) -> Listener {
    Listener {
        name,
        address: Some(socket_address(ip, port)),
        filter_chains: vec![FilterChain {
            filters: vec![filter],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn http_connection_manager(
    name: &str,
    routes: RouteConfiguration,
    mut http_filters: Vec<HttpFilter>,
) -> Filter {
    http_filters.push(HttpFilter {
        name: ROUTER.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
            ROUTER_URL,
            &Router::default(),
        ))),
        ..Default::default()
    });

    let hcm = HttpConnectionManager {
        stat_prefix: name.to_string(),
        codec_type: CodecType::Auto as i32,
        route_specifier: Some(RouteSpecifier::RouteConfig(routes)),
        http_filters,
        ..Default::default()
    };
    Filter {
        name: HTTP_CONNECTION_MANAGER.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(to_any(
            HTTP_CONNECTION_MANAGER_URL,
            &hcm,
        ))),
    }
}

fn tcp_proxy_filter(
    name: &str,
    cluster_specifier: tcp_proxy::ClusterSpecifier,
    opts: &Options,
) -> Filter {
    let proxy = TcpProxy {
        stat_prefix: name.to_string(),
        cluster_specifier: Some(cluster_specifier),
        idle_timeout: Some(duration(opts.tcp_idle_timeout)),
        ..Default::default()
    };
    Filter {
        name: TCP_PROXY.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(to_any(TCP_PROXY_URL, &proxy))),
    }
}

fn rate_limit_filter(rl: &RateLimit) -> HttpFilter {
    let config = RateLimitFilter {
        domain: rl.domain.clone(),
        rate_limit_service: Some(RateLimitServiceConfig {
            grpc_service: Some(GrpcService {
                target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                    grpc_service::EnvoyGrpc {
                        cluster_name: RATE_LIMIT_CLUSTER.to_string(),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            }),
            transport_api_version: ApiVersion::V3 as i32,
            ..Default::default()
        }),
        ..Default::default()
    };
    HttpFilter {
        name: RATE_LIMIT.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(to_any(
            RATE_LIMIT_URL,
            &config,
        ))),
        ..Default::default()
    }
}
