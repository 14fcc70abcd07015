#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Translates a workload's plugin configuration and the mesh Services it
//! depends on into Envoy v3 listeners, clusters, and load assignments.
//!
//! Building is pure: identical inputs always produce identical resources.

mod cluster;
mod domain;
mod endpoint;
mod listener;
mod route;
pub mod validate;


pub use self::{
    cluster::RATE_LIMIT_CLUSTER,
    domain::UpstreamDomain,
    listener::{http_connection_manager_of, virtual_host_domains},
    validate::ValidationError,
};

use kato_xds_controller_core::{
    pb::{
        envoy::config::{
            cluster::v3::Cluster,
            core::v3::{address, socket_address, Address, SocketAddress},
            endpoint::v3::ClusterLoadAssignment,
            listener::v3::Listener,
        },
        google::protobuf::{Duration, UInt32Value},
    },
    NodeIdentity, Options, PluginConfig, PluginModel, Snapshot,
};
use kato_xds_controller_k8s_api::{MeshEndpoints, MeshService, Protocol};
use std::collections::{btree_map, BTreeMap};

/// Everything the builder needs to know about one sidecar.
#[derive(Clone, Debug)]
pub struct Input<'a> {
    pub identity: &'a NodeIdentity,
    pub model: PluginModel,
    pub config: &'a PluginConfig,

    /// Services selected for the workload's dependencies.
    pub services: &'a [MeshService],

    /// Endpoints selected for the workload's dependencies, matched to
    /// services by name.
    pub endpoints: &'a [MeshEndpoints],
}

/// The validated resources for one sidecar.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
    pub endpoints: Vec<ClusterLoadAssignment>,
}

// === impl Resources ===

impl Resources {
    /// Sidecars are never sent a configuration without both clusters and
    /// listeners.
    pub fn is_publishable(&self) -> bool {
        !self.clusters.is_empty() && !self.listeners.is_empty()
    }

    pub fn to_snapshot(&self, version: u64) -> Snapshot {
        Snapshot::new(
            version,
            self.listeners.clone(),
            self.clusters.clone(),
            self.endpoints.clone(),
            Vec::new(),
        )
    }
}

/// The name of the cluster through which `self_alias` reaches `dest_alias`.
pub fn upstream_cluster_name(ns: &str, self_alias: &str, dest_alias: &str, port: u16) -> String {
    format!("{ns}_{self_alias}_{dest_alias}_{port}")
}

/// The name of the cluster that forwards inbound traffic to a local port.
pub fn local_cluster_name(ns: &str, self_alias: &str, port: u16) -> String {
    format!("{ns}_{self_alias}_{port}")
}

pub fn outbound_listener_name(ns: &str, self_alias: &str, port: u16) -> String {
    format!("{ns}_{self_alias}_upstream_{port}")
}

pub fn inbound_listener_name(ns: &str, self_alias: &str, port: u16) -> String {
    format!("{ns}_{self_alias}_downstream_{port}")
}

/// Builds the resources for a single sidecar.
///
/// Resources that fail validation are logged and omitted. Load assignments
/// are only emitted for clusters that survive validation.
pub fn build(input: &Input<'_>) -> Resources {
    let NodeIdentity {
        namespace,
        service_alias: self_alias,
        ..
    } = input.identity;

    let mut clusters = BTreeMap::<String, Cluster>::new();
    let mut endpoints = BTreeMap::<String, ClusterLoadAssignment>::new();
    let mut listeners = Vec::new();

    if matches!(input.model, PluginModel::Upstream | PluginModel::InAndOut) {
        let mut outbound = BTreeMap::<u16, listener::Outbound>::new();

        for dep in &input.config.base_services {
            let options = Options::parse(&dep.options);
            let self_reference = dep.depend_service_alias == *self_alias;

            for svc in input.upstreams(&dep.depend_service_alias, dep.port) {
                let protocol = if dep.protocol.is_empty() {
                    svc.protocol
                } else {
                    Protocol::parse(&dep.protocol)
                };
                let name = upstream_cluster_name(namespace, self_alias, &svc.service_alias, svc.port);

                if let btree_map::Entry::Vacant(entry) = clusters.entry(name.clone()) {
                    let cluster = match svc.domain.as_deref() {
                        Some(domain) => {
                            let Some(domain) = UpstreamDomain::parse(domain, svc.port) else {
                                tracing::warn!(service = %svc.name, %domain, "Ignoring upstream with invalid domain");
                                continue;
                            };
                            cluster::logical_dns(&name, &domain, protocol, &options)
                        }
                        None => {
                            let eps = input.endpoints_of(svc);
                            endpoints.insert(
                                name.clone(),
                                endpoint::load_assignment(&name, svc, eps, self_reference),
                            );
                            cluster::eds(&name, protocol, &options)
                        }
                    };
                    entry.insert(cluster);
                }

                match outbound.entry(svc.port) {
                    btree_map::Entry::Vacant(entry) => {
                        entry.insert(listener::Outbound::new(svc.port, protocol));
                    }
                    btree_map::Entry::Occupied(entry) if entry.get().protocol != protocol => {
                        tracing::warn!(
                            port = svc.port,
                            %protocol,
                            existing = %entry.get().protocol,
                            service = %svc.name,
                            "Skipping upstream with conflicting protocol on the same port",
                        );
                        continue;
                    }
                    btree_map::Entry::Occupied(_) => {}
                }
                if let Some(group) = outbound.get_mut(&svc.port) {
                    group.push(name, options.clone());
                }
            }
        }

        listeners.extend(outbound.values().filter_map(|group| {
            listener::outbound(
                outbound_listener_name(namespace, self_alias, group.port),
                group,
            )
        }));
    }

    if matches!(input.model, PluginModel::Downstream | PluginModel::InAndOut) {
        for port in &input.config.base_ports {
            let options = Options::parse(&port.options);
            let protocol = Protocol::parse(&port.protocol);
            let name = local_cluster_name(namespace, self_alias, port.port);
            clusters.insert(
                name.clone(),
                cluster::local(&name, port.port, protocol, &options),
            );
            if let Some(rate_limit) = options.rate_limit.as_ref().filter(|_| protocol.is_http()) {
                clusters
                    .entry(RATE_LIMIT_CLUSTER.to_string())
                    .or_insert_with(|| cluster::rate_limit(rate_limit));
            }

            let listen_port = port.listen_port();
            listeners.extend(listener::inbound(
                inbound_listener_name(namespace, self_alias, listen_port),
                listen_port,
                &name,
                protocol,
                &options,
            ));
        }
    }

    let clusters = clusters
        .into_values()
        .filter(|cluster| match validate::cluster(cluster) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(cluster = %cluster.name, %error, "Dropping invalid cluster");
                false
            }
        })
        .collect::<Vec<_>>();
    let listeners = listeners
        .into_iter()
        .filter(|listener| match validate::listener(listener) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(listener = %listener.name, %error, "Dropping invalid listener");
                false
            }
        })
        .collect();
    let endpoints = endpoints
        .into_values()
        .filter(|cla| clusters.iter().any(|c| c.name == cla.cluster_name))
        .filter(|cla| match validate::load_assignment(cla) {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(cluster = %cla.cluster_name, %error, "Dropping invalid load assignment");
                false
            }
        })
        .collect();

    Resources {
        listeners,
        clusters,
        endpoints,
    }
}

// === impl Input ===

impl Input<'_> {
    /// Inner services with the given alias. A port of zero selects every
    /// port.
    fn upstreams<'s>(&'s self, alias: &'s str, port: u16) -> impl Iterator<Item = &'s MeshService> + 's {
        self.services.iter().filter(move |svc| {
            svc.service_alias == alias && svc.is_inner() && (port == 0 || svc.port == port)
        })
    }

    fn endpoints_of(&self, svc: &MeshService) -> Option<&MeshEndpoints> {
        self.endpoints
            .iter()
            .find(|ep| ep.name == svc.name && ep.namespace == svc.namespace)
    }
}

fn socket_address(ip: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: ip.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
    }
}

fn duration(d: std::time::Duration) -> Duration {
    Duration {
        seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        nanos: i32::try_from(d.subsec_nanos()).unwrap_or_default(),
    }
}

fn uint32(value: u32) -> Option<UInt32Value> {
    Some(UInt32Value { value })
}
