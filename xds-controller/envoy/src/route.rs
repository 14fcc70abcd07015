use crate::{listener::Upstream, uint32};
use kato_xds_controller_core::{
    options::HeaderMatch,
    pb::envoy::{
        config::route::v3::{
            header_matcher::HeaderMatchSpecifier,
            rate_limit::{
                action::{ActionSpecifier, RemoteAddress},
                Action as RateLimitAction,
            },
            route, route_action::ClusterSpecifier,
            route_match::PathSpecifier,
            weighted_cluster::ClusterWeight,
            HeaderMatcher, RateLimit, Route, RouteAction, RouteConfiguration, RouteMatch, VirtualHost,
            WeightedCluster,
        },
        r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher},
    },
    Options,
};
use kato_xds_controller_k8s_api::Protocol;
use std::collections::BTreeMap;

/// Sibling weighted clusters never share more than this in total.
pub(crate) const MAX_TOTAL_WEIGHT: u32 = 100;

type RouteKey = (String, Vec<HeaderMatch>);

/// Builds the routes for an outbound HTTP listener.
///
/// Upstreams with identical domains share a virtual host, and upstreams with
/// an identical prefix and header match within it share a weighted route.
pub(crate) fn outbound(
    name: &str,
    port: u16,
    protocol: Protocol,
    upstreams: &[Upstream],
) -> RouteConfiguration {
    let mut vhosts = BTreeMap::<Vec<String>, BTreeMap<RouteKey, Vec<(&str, u32)>>>::new();
    for upstream in upstreams {
        let opts = &upstream.options;
        let mut headers = opts.headers.clone();
        headers.sort();

        let targets = vhosts
            .entry(domains(&opts.domains, protocol, port))
            .or_default()
            .entry((opts.prefix.clone(), headers))
            .or_default();
        if !targets.iter().any(|(cluster, _)| *cluster == upstream.cluster) {
            targets.push((upstream.cluster.as_str(), opts.weight));
        }
    }

    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vhosts
            .into_iter()
            .map(|(domains, routes)| {
                let mut routes = routes.into_iter().collect::<Vec<_>>();
                // Envoy takes the first matching route, so more specific
                // matches must come first.
                routes.sort_by(|((a_prefix, a_headers), _), ((b_prefix, b_headers), _)| {
                    b_prefix
                        .len()
                        .cmp(&a_prefix.len())
                        .then_with(|| b_headers.len().cmp(&a_headers.len()))
                        .then_with(|| (a_prefix, a_headers).cmp(&(b_prefix, b_headers)))
                });
                VirtualHost {
                    name: domains.join(","),
                    domains,
                    routes: routes
                        .into_iter()
                        .map(|((prefix, headers), targets)| route(prefix, &headers, &targets))
                        .collect(),
                    ..Default::default()
                }
            })
            .collect(),
        ..Default::default()
    }
}

/// Builds the routes for an inbound HTTP listener, which forwards everything
/// to the local cluster.
pub(crate) fn inbound(name: &str, cluster: &str, opts: &Options) -> RouteConfiguration {
    let rate_limits = opts
        .rate_limit
        .as_ref()
        .map(|_| RateLimit {
            actions: vec![RateLimitAction {
                action_specifier: Some(ActionSpecifier::RemoteAddress(RemoteAddress {})),
            }],
            ..Default::default()
        })
        .into_iter()
        .collect();

    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: name.to_string(),
            domains: vec!["*".to_string()],
            routes: vec![route("/".to_string(), &[], &[(cluster, MAX_TOTAL_WEIGHT)])],
            rate_limits,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Envoy does not match HTTP/2 authorities that carry a port against
/// portless domains, so gRPC domains are qualified with the listener port.
pub(crate) fn domains(domains: &[String], protocol: Protocol, port: u16) -> Vec<String> {
    let mut domains = domains
        .iter()
        .map(|domain| {
            if protocol == Protocol::Grpc && domain != "*" && !domain.contains(':') {
                format!("{domain}:{port}")
            } else {
                domain.clone()
            }
        })
        .collect::<Vec<_>>();
    domains.sort();
    domains.dedup();
    domains
}

/// Clamps weights so that their running total never exceeds
/// [`MAX_TOTAL_WEIGHT`].
pub(crate) fn clamp_weights(weights: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut total = 0;
    weights
        .into_iter()
        .map(|weight| {
            let weight = weight.min(MAX_TOTAL_WEIGHT - total);
            total += weight;
            weight
        })
        .collect()
}

fn route(prefix: String, headers: &[HeaderMatch], targets: &[(&str, u32)]) -> Route {
    let cluster_specifier = match targets {
        [(cluster, _)] => ClusterSpecifier::Cluster(cluster.to_string()),
        targets => {
            let weights = clamp_weights(targets.iter().map(|(_, w)| *w));
            ClusterSpecifier::WeightedClusters(WeightedCluster {
                clusters: targets
                    .iter()
                    .zip(weights)
                    .map(|((cluster, _), weight)| ClusterWeight {
                        name: cluster.to_string(),
                        weight: uint32(weight),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
        }
    };

    Route {
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix(prefix)),
            headers: headers
                .iter()
                .map(|h| HeaderMatcher {
                    name: h.name.clone(),
                    header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(
                        StringMatcher {
                            match_pattern: Some(MatchPattern::Exact(h.value.clone())),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
        action: Some(route::Action::Route(RouteAction {
            cluster_specifier: Some(cluster_specifier),
            ..Default::default()
        })),
        ..Default::default()
    }
}
