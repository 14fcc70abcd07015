use crate::{duration, endpoint, uint32, UpstreamDomain};
use kato_xds_controller_core::{
    options::RateLimit,
    pb::{
        envoy::{
            config::{
                cluster::v3::{
                    circuit_breakers::Thresholds,
                    cluster::{ClusterDiscoveryType, CommonLbConfig, DiscoveryType, EdsClusterConfig, LbPolicy},
                    CircuitBreakers, Cluster, OutlierDetection,
                },
                core::v3::{
                    config_source::ConfigSourceSpecifier,
                    health_check::{GrpcHealthCheck, HealthChecker},
                    transport_socket, AggregatedConfigSource, ApiVersion, ConfigSource, HealthCheck,
                    Http1ProtocolOptions, Http2ProtocolOptions, HttpProtocolOptions as CommonHttpProtocolOptions,
                    TransportSocket,
                },
            },
            extensions::{
                transport_sockets::tls::v3::UpstreamTlsContext,
                upstreams::http::v3::{
                    http_protocol_options::{
                        explicit_http_config::ProtocolConfig, ExplicitHttpConfig, UpstreamProtocolOptions,
                    },
                    HttpProtocolOptions,
                },
            },
            r#type::v3::Percent,
        },
        google::protobuf::Any,
    },
    to_any, Options,
};
use kato_xds_controller_k8s_api::Protocol;
use std::{collections::HashMap, time::Duration};

/// The cluster through which inbound listeners reach the rate limit service.
pub const RATE_LIMIT_CLUSTER: &str = "rate_limit_service_cluster";

const HTTP_PROTOCOL_OPTIONS: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";

const HEALTH_CHECK_UNHEALTHY_THRESHOLD: u32 = 2;
const HEALTH_CHECK_HEALTHY_THRESHOLD: u32 = 1;

/// A cluster whose endpoints are discovered over the ADS stream.
pub(crate) fn eds(name: &str, protocol: Protocol, opts: &Options) -> Cluster {
    Cluster {
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
        eds_cluster_config: Some(EdsClusterConfig {
            eds_config: Some(ConfigSource {
                resource_api_version: ApiVersion::V3 as i32,
                config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource {})),
                ..Default::default()
            }),
            service_name: String::new(),
        }),
        ..upstream(name, protocol, opts)
    }
}

/// A cluster that resolves a third-party host. It is never served over EDS.
pub(crate) fn logical_dns(
    name: &str,
    domain: &UpstreamDomain,
    protocol: Protocol,
    opts: &Options,
) -> Cluster {
    Cluster {
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::LogicalDns as i32)),
        load_assignment: Some(endpoint::static_assignment(name, &domain.host, domain.port)),
        transport_socket: domain.tls.then(|| upstream_tls(&domain.host)),
        ..upstream(name, protocol, opts)
    }
}

/// A cluster that forwards to a port on the workload itself.
pub(crate) fn local(name: &str, port: u16, protocol: Protocol, opts: &Options) -> Cluster {
    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32)),
        connect_timeout: Some(duration(opts.connection_timeout)),
        load_assignment: Some(endpoint::static_assignment(name, "127.0.0.1", port)),
        circuit_breakers: Some(circuit_breakers(opts)),
        typed_extension_protocol_options: protocol_options(protocol, opts),
        ..Default::default()
    }
}

pub(crate) fn rate_limit(rl: &RateLimit) -> Cluster {
    Cluster {
        name: RATE_LIMIT_CLUSTER.to_string(),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::LogicalDns as i32)),
        connect_timeout: Some(duration(Duration::from_millis(250))),
        load_assignment: Some(endpoint::static_assignment(
            RATE_LIMIT_CLUSTER,
            &rl.server_host,
            rl.server_port,
        )),
        // The rate limit service speaks gRPC.
        typed_extension_protocol_options: protocol_options(Protocol::Grpc, &Options::default()),
        ..Default::default()
    }
}

fn upstream(name: &str, protocol: Protocol, opts: &Options) -> Cluster {
    Cluster {
        name: name.to_string(),
        connect_timeout: Some(duration(opts.connection_timeout)),
        lb_policy: LbPolicy::RoundRobin as i32,
        circuit_breakers: Some(circuit_breakers(opts)),
        outlier_detection: Some(OutlierDetection {
            consecutive_5xx: uint32(opts.consecutive_errors),
            interval: Some(duration(opts.outlier_interval)),
            base_ejection_time: Some(duration(opts.base_ejection_time)),
            max_ejection_percent: uint32(opts.max_ejection_percent),
            ..Default::default()
        }),
        common_lb_config: Some(CommonLbConfig {
            healthy_panic_threshold: Some(Percent {
                value: opts.healthy_panic_threshold.into(),
            }),
            ..Default::default()
        }),
        health_checks: opts
            .grpc_health_service_name
            .as_ref()
            .map(|service_name| HealthCheck {
                timeout: Some(duration(opts.health_check_timeout)),
                interval: Some(duration(opts.health_check_interval)),
                unhealthy_threshold: uint32(HEALTH_CHECK_UNHEALTHY_THRESHOLD),
                healthy_threshold: uint32(HEALTH_CHECK_HEALTHY_THRESHOLD),
                health_checker: Some(HealthChecker::GrpcHealthCheck(GrpcHealthCheck {
                    service_name: service_name.clone(),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .into_iter()
            .collect(),
        typed_extension_protocol_options: protocol_options(protocol, opts),
        ..Default::default()
    }
}

fn circuit_breakers(opts: &Options) -> CircuitBreakers {
    CircuitBreakers {
        thresholds: vec![Thresholds {
            max_connections: uint32(opts.max_connections),
            max_pending_requests: uint32(opts.max_pending_requests),
            max_requests: uint32(opts.max_requests),
            max_retries: uint32(opts.max_active_retries),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// gRPC upstreams are always HTTP/2. HTTP upstreams only carry protocol
/// options when connection reuse is limited.
fn protocol_options(protocol: Protocol, opts: &Options) -> HashMap<String, Any> {
    let protocol_config = match protocol {
        Protocol::Grpc => ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default()),
        Protocol::Http if opts.max_requests_per_connection.is_some() => {
            ProtocolConfig::HttpProtocolOptions(Http1ProtocolOptions::default())
        }
        _ => return HashMap::new(),
    };

    let options = HttpProtocolOptions {
        common_http_protocol_options: opts.max_requests_per_connection.map(|max| {
            CommonHttpProtocolOptions {
                max_requests_per_connection: uint32(max),
                ..Default::default()
            }
        }),
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(protocol_config),
            },
        )),
        ..Default::default()
    };
    HashMap::from([(
        HTTP_PROTOCOL_OPTIONS.to_string(),
        to_any(HTTP_PROTOCOL_OPTIONS_URL, &options),
    )])
}

fn upstream_tls(sni: &str) -> TransportSocket {
    let context = UpstreamTlsContext {
        sni: sni.to_string(),
        ..Default::default()
    };
    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(to_any(
            UPSTREAM_TLS_CONTEXT_URL,
            &context,
        ))),
    }
}
