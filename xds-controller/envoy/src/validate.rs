//! Structural validation of generated resources.
//!
//! These checks reject configurations that Envoy would NACK, so that a single
//! bad resource does not poison a sidecar's whole snapshot.

use crate::route::MAX_TOTAL_WEIGHT;
use kato_xds_controller_core::pb::envoy::config::{
    cluster::v3::{
        cluster::{ClusterDiscoveryType, DiscoveryType},
        Cluster,
    },
    core::v3::{address, socket_address, Address},
    endpoint::v3::{lb_endpoint::HostIdentifier, ClusterLoadAssignment},
    listener::v3::Listener,
    route::v3::{route, route_action::ClusterSpecifier, RouteConfiguration},
};
use std::collections::HashSet;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("resource has no name")]
    MissingName,

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("invalid socket address")]
    InvalidAddress,

    #[error("connect timeout must be positive")]
    InvalidConnectTimeout,

    #[error("{0} clusters must have exactly one endpoint")]
    InvalidEndpointCount(&'static str),

    #[error("virtual host {0} has no domains")]
    NoDomains(String),

    #[error("domain {0} is claimed by more than one virtual host")]
    DuplicateDomain(String),

    #[error("weighted clusters total {0}; must be between 1 and 100")]
    InvalidWeights(u32),
}

pub fn cluster(cluster: &Cluster) -> Result<(), ValidationError> {
    if cluster.name.is_empty() {
        return Err(ValidationError::MissingName);
    }

    match &cluster.connect_timeout {
        Some(t) if t.seconds > 0 || (t.seconds == 0 && t.nanos > 0) => {}
        _ => return Err(ValidationError::InvalidConnectTimeout),
    }

    let kind = match cluster.cluster_discovery_type {
        Some(ClusterDiscoveryType::Type(t)) => DiscoveryType::try_from(t).ok(),
        _ => None,
    };
    match kind {
        Some(DiscoveryType::Eds) => {
            if cluster.eds_cluster_config.is_none() {
                return Err(ValidationError::MissingField("eds_cluster_config"));
            }
        }
        Some(DiscoveryType::LogicalDns) => {
            let cla = cluster
                .load_assignment
                .as_ref()
                .ok_or(ValidationError::MissingField("load_assignment"))?;
            if count_endpoints(cla) != 1 {
                return Err(ValidationError::InvalidEndpointCount("LOGICAL_DNS"));
            }
            load_assignment(cla)?;
        }
        Some(DiscoveryType::Static) => {
            let cla = cluster
                .load_assignment
                .as_ref()
                .ok_or(ValidationError::MissingField("load_assignment"))?;
            load_assignment(cla)?;
        }
        _ => return Err(ValidationError::MissingField("discovery type")),
    }

    Ok(())
}

pub fn listener(listener: &Listener) -> Result<(), ValidationError> {
    if listener.name.is_empty() {
        return Err(ValidationError::MissingName);
    }
    socket_address(listener.address.as_ref())?;
    if listener.filter_chains.iter().all(|c| c.filters.is_empty()) {
        return Err(ValidationError::MissingField("filter chain"));
    }
    Ok(())
}

pub fn route_config(rc: &RouteConfiguration) -> Result<(), ValidationError> {
    let mut domains = HashSet::new();
    for vh in &rc.virtual_hosts {
        if vh.domains.is_empty() {
            return Err(ValidationError::NoDomains(vh.name.clone()));
        }
        for domain in &vh.domains {
            if !domains.insert(domain.as_str()) {
                return Err(ValidationError::DuplicateDomain(domain.clone()));
            }
        }

        for r in &vh.routes {
            if r.r#match.is_none() {
                return Err(ValidationError::MissingField("route match"));
            }
            let Some(route::Action::Route(action)) = &r.action else {
                return Err(ValidationError::MissingField("route action"));
            };
            match &action.cluster_specifier {
                Some(ClusterSpecifier::Cluster(name)) if !name.is_empty() => {}
                Some(ClusterSpecifier::WeightedClusters(wc)) => {
                    let total = wc
                        .clusters
                        .iter()
                        .map(|c| c.weight.as_ref().map(|w| w.value).unwrap_or(0))
                        .sum::<u32>();
                    if total == 0 || total > MAX_TOTAL_WEIGHT {
                        return Err(ValidationError::InvalidWeights(total));
                    }
                }
                _ => return Err(ValidationError::MissingField("route cluster")),
            }
        }
    }
    Ok(())
}

pub fn load_assignment(cla: &ClusterLoadAssignment) -> Result<(), ValidationError> {
    if cla.cluster_name.is_empty() {
        return Err(ValidationError::MissingName);
    }
    for lb in cla.endpoints.iter().flat_map(|l| l.lb_endpoints.iter()) {
        match &lb.host_identifier {
            Some(HostIdentifier::Endpoint(ep)) => socket_address(ep.address.as_ref())?,
            _ => return Err(ValidationError::MissingField("endpoint")),
        }
    }
    Ok(())
}

fn count_endpoints(cla: &ClusterLoadAssignment) -> usize {
    cla.endpoints.iter().map(|l| l.lb_endpoints.len()).sum()
}

fn socket_address(addr: Option<&Address>) -> Result<(), ValidationError> {
    let Some(address::Address::SocketAddress(sa)) = addr.and_then(|a| a.address.as_ref()) else {
        return Err(ValidationError::InvalidAddress);
    };
    match sa.port_specifier {
        Some(socket_address::PortSpecifier::PortValue(port)) if port > 0 && port <= 65535 => {}
        _ => return Err(ValidationError::InvalidAddress),
    }
    if sa.address.is_empty() {
        return Err(ValidationError::InvalidAddress);
    }
    Ok(())
}
