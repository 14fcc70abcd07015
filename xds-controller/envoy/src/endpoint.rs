use crate::socket_address;
use kato_xds_controller_core::pb::envoy::config::endpoint::v3::{
    endpoint::HealthCheckConfig, lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint,
    LbEndpoint, LocalityLbEndpoints,
};
use kato_xds_controller_k8s_api::{MeshEndpoints, MeshService};

/// Builds the EDS assignment for an upstream service.
///
/// Ready addresses carry a health check port so that clients can tell them
/// apart from the single placeholder emitted for a subset with no ready
/// addresses.
pub(crate) fn load_assignment(
    cluster_name: &str,
    svc: &MeshService,
    endpoints: Option<&MeshEndpoints>,
    self_reference: bool,
) -> ClusterLoadAssignment {
    let mut lb_endpoints = Vec::new();
    for subset in endpoints.iter().flat_map(|eps| eps.subsets.iter()) {
        let port = match svc.origin_port {
            Some(port) if self_reference => port,
            _ => subset.port.unwrap_or(svc.port),
        };

        if !subset.ready.is_empty() {
            lb_endpoints.extend(subset.ready.iter().map(|ip| lb_endpoint(ip, port, true)));
        } else if let Some(ip) = subset.not_ready.first() {
            lb_endpoints.push(lb_endpoint(ip, port, false));
        }
    }

    if lb_endpoints.is_empty() {
        tracing::debug!(cluster = %cluster_name, service = %svc.name, "No endpoints");
    }

    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// A single-endpoint assignment embedded in a static or DNS cluster.
pub(crate) fn static_assignment(cluster_name: &str, host: &str, port: u16) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: vec![lb_endpoint(host, port, false)],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn lb_endpoint(ip: &str, port: u16, health_checked: bool) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(ip, port)),
            health_check_config: health_checked.then(|| HealthCheckConfig {
                port_value: port.into(),
                ..Default::default()
            }),
            ..Default::default()
        })),
        ..Default::default()
    }
}
