use crate::xds::{Client, XdsArgs};
use anyhow::{bail, Result};
use kato_xds_controller_core::pb::envoy::config::{
    cluster::v3::{
        cluster::{ClusterDiscoveryType, DiscoveryType},
        Cluster,
    },
    endpoint::v3::{lb_endpoint::HostIdentifier, ClusterLoadAssignment},
};
use std::{collections::BTreeSet, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, clap::Args)]
pub struct Args {
    #[clap(flatten)]
    xds: XdsArgs,

    /// Aliases of the services that must be reachable before startup.
    #[clap(
        long,
        env = "STARTUP_SEQUENCE_DEPENDENCIES",
        value_delimiter = ',',
        default_value = ""
    )]
    dependencies: Vec<String>,

    #[clap(long, default_value = "5s", value_parser = crate::parse_duration)]
    interval: Duration,

    /// Gives up after this long. Waits indefinitely if unset.
    #[clap(long, value_parser = crate::parse_duration)]
    timeout: Option<Duration>,
}

pub async fn run(args: Args) -> Result<()> {
    let Args {
        xds,
        dependencies,
        interval,
        timeout,
    } = args;

    let dependencies = dependencies
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .map(ToString::to_string)
        .collect::<BTreeSet<_>>();
    if dependencies.is_empty() {
        info!("No startup dependencies");
        return Ok(());
    }

    let client = xds.client()?;
    info!(node = %client.node(), ?dependencies, "Waiting for dependencies");
    let ready = poll(&client, &dependencies, interval);
    match timeout {
        None => ready.await,
        Some(timeout) => match time::timeout(timeout, ready).await {
            Ok(res) => res,
            Err(_) => bail!("dependencies not ready after {timeout:?}"),
        },
    }
}

async fn poll(client: &Client, dependencies: &BTreeSet<String>, interval: Duration) -> Result<()> {
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        match check(client).await {
            Ok(ready) => {
                let pending = pending(dependencies, &ready);
                if pending.is_empty() {
                    info!("All dependencies are ready");
                    return Ok(());
                }
                info!(?pending, "Waiting for dependencies");
            }
            Err(error) => warn!(%error, "Failed to query the control plane"),
        }
    }
}

async fn check(client: &Client) -> Result<BTreeSet<String>> {
    let clusters = client.clusters().await?;
    let endpoints = client.endpoints().await?;
    debug!(
        clusters = clusters.len(),
        endpoints = endpoints.len(),
        "Fetched resources"
    );
    Ok(ready_aliases(&clusters, &endpoints))
}

/// Returns the aliases of every dependency with a ready upstream.
///
/// DNS clusters have no endpoints to wait for and are always ready. Other
/// clusters are ready once an endpoint carries a health check config, which
/// only ready addresses are given.
fn ready_aliases(clusters: &[Cluster], endpoints: &[ClusterLoadAssignment]) -> BTreeSet<String> {
    let dns = clusters
        .iter()
        .filter(|c| {
            c.cluster_discovery_type
                == Some(ClusterDiscoveryType::Type(DiscoveryType::LogicalDns as i32))
        })
        .map(|c| c.name.as_str());

    let healthy = endpoints
        .iter()
        .filter(|cla| {
            cla.endpoints
                .iter()
                .flat_map(|l| l.lb_endpoints.iter())
                .filter_map(|lb| lb.host_identifier.as_ref())
                .any(|host| {
                    matches!(host, HostIdentifier::Endpoint(ep) if ep.health_check_config.is_some())
                })
        })
        .map(|cla| cla.cluster_name.as_str());

    dns.chain(healthy)
        .filter_map(dependency_alias)
        .map(ToString::to_string)
        .collect()
}

/// Upstream clusters are named `<namespace>_<alias>_<dependency>_<port>`.
fn dependency_alias(cluster_name: &str) -> Option<&str> {
    cluster_name.split('_').nth(2).filter(|a| !a.is_empty())
}

fn pending<'a>(dependencies: &'a BTreeSet<String>, ready: &BTreeSet<String>) -> Vec<&'a str> {
    dependencies
        .iter()
        .filter(|d| !ready.contains(*d))
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Uri;
    use hyper_util::rt::TokioIo;
    use kato_xds_controller_core::{
        pb::envoy::config::endpoint::v3::{
            endpoint::HealthCheckConfig, Endpoint, LbEndpoint, LocalityLbEndpoints,
        },
        NodeIdentity, Snapshot, SnapshotSink,
    };
    use kato_xds_controller_grpc::{metrics::GrpcServerMetricsFamily, SnapshotCache, XdsServer};
    use tonic::transport::Endpoint as ChannelEndpoint;

    fn cluster(name: &str, ty: DiscoveryType) -> Cluster {
        Cluster {
            name: name.to_string(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(ty as i32)),
            ..Default::default()
        }
    }

    fn assignment(name: &str, ready: &[bool]) -> ClusterLoadAssignment {
        let lb_endpoints = ready
            .iter()
            .map(|ready| LbEndpoint {
                host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                    health_check_config: ready.then(HealthCheckConfig::default),
                    ..Default::default()
                })),
                ..Default::default()
            })
            .collect();
        ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn deps(aliases: &[&str]) -> BTreeSet<String> {
        aliases.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn waits_for_every_dependency() {
        let clusters = vec![
            cluster("ns_app_web_8080", DiscoveryType::Eds),
            cluster("ns_app_cache_6379", DiscoveryType::Eds),
        ];
        let dependencies = deps(&["web", "cache"]);

        let ready = ready_aliases(
            &clusters,
            &[
                assignment("ns_app_web_8080", &[true]),
                assignment("ns_app_cache_6379", &[false]),
            ],
        );
        assert_eq!(pending(&dependencies, &ready), ["cache"]);

        let ready = ready_aliases(
            &clusters,
            &[
                assignment("ns_app_web_8080", &[true]),
                assignment("ns_app_cache_6379", &[false, true]),
            ],
        );
        assert!(pending(&dependencies, &ready).is_empty());
    }

    #[test]
    fn dns_clusters_are_ready_without_endpoints() {
        let clusters = vec![cluster("ns_app_payments_443", DiscoveryType::LogicalDns)];
        let ready = ready_aliases(&clusters, &[]);
        assert!(pending(&deps(&["payments"]), &ready).is_empty());
    }

    #[test]
    fn unknown_dependencies_are_pending() {
        let ready = ready_aliases(&[], &[assignment("ns_app_web_8080", &[true])]);
        assert_eq!(pending(&deps(&["web", "db"]), &ready), ["db"]);
    }

    #[test]
    fn cluster_names_without_a_dependency_are_ignored() {
        assert_eq!(dependency_alias("ns_app_web_8080"), Some("web"));
        assert_eq!(dependency_alias("rate"), None);
        assert_eq!(dependency_alias("ns_app"), None);
    }

    /// Serves `cache` to a client over an in-memory connection. Streams are
    /// served until the returned signal is dropped.
    async fn connect(cache: SnapshotCache, node: &NodeIdentity) -> (Client, drain::Signal) {
        let (signal, drain) = drain::channel();
        let metrics = GrpcServerMetricsFamily::register(&mut Default::default());
        let server = XdsServer::new(cache, metrics, drain);
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(server.cds())
                .add_service(server.eds())
                .serve_with_incoming(futures::stream::iter([Ok::<_, std::io::Error>(server_io)])),
        );

        let mut client_io = Some(client_io);
        let channel = ChannelEndpoint::from_static("http://[::]:6101")
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let io = client_io.take();
                async move {
                    io.map(TokioIo::new).ok_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "already connected")
                    })
                }
            }))
            .await
            .expect("must connect");
        (Client::new(node.to_string(), channel), signal)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn polls_until_dependencies_are_ready() {
        let cache = SnapshotCache::default();
        let node = NodeIdentity::new("ns", "app", "web");
        let (client, _signal) = connect(cache.clone(), &node).await;
        let interval = Duration::from_secs(5);

        let polling = tokio::spawn(async move {
            poll(&client, &deps(&["cache"]), interval).await
        });
        // Publish between ticks.
        time::sleep(interval * 4 + interval / 5).await;
        assert!(!polling.is_finished(), "no snapshot has been published");

        cache
            .set_snapshot(
                &node,
                Snapshot::new(
                    1,
                    vec![],
                    vec![cluster("ns_app_cache_6379", DiscoveryType::Eds)],
                    vec![assignment("ns_app_cache_6379", &[false])],
                    vec![],
                ),
            )
            .expect("must publish");
        time::sleep(interval * 2).await;
        assert!(!polling.is_finished(), "the dependency has no ready endpoints");

        cache
            .set_snapshot(
                &node,
                Snapshot::new(
                    2,
                    vec![],
                    vec![cluster("ns_app_cache_6379", DiscoveryType::Eds)],
                    vec![assignment("ns_app_cache_6379", &[true])],
                    vec![],
                ),
            )
            .expect("must publish");
        let ready = time::Instant::now();
        time::timeout(interval, polling)
            .await
            .expect("must complete within one interval")
            .expect("task must not panic")
            .expect("poll must succeed");
        assert!(ready.elapsed() <= interval);
    }
}
