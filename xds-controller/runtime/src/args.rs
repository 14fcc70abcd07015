use crate::{
    core::DEFAULT_CREATOR,
    grpc::{self, SnapshotCache},
    index::{self, metrics::IndexMetrics, Index, Registry},
    k8s::{self, labels},
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry as Prometheus;
use std::net::SocketAddr;
use tokio::{sync::watch, time::Duration};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "xds-controller", about = "An Envoy xDS control plane for KATO sidecars")]
pub struct Args {
    #[clap(
        long,
        default_value = "kato=info,warn",
        env = "KATO_XDS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:6101", env = "GRPC_API_ADDR")]
    grpc_addr: SocketAddr,

    /// Only Services, Endpoints, and ConfigMaps labeled `creator=<CREATOR>`
    /// are watched.
    #[clap(long, default_value = DEFAULT_CREATOR, env = "KATO_CREATOR")]
    creator: String,

    /// Delay before a failed rebuild is retried.
    #[clap(long, default_value = "1000")]
    retry_delay_ms: u64,

    #[clap(long, default_value = "1000000")]
    max_concurrent_streams: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            grpc_addr,
            creator,
            retry_delay_ms,
            max_concurrent_streams,
        } = self;

        let mut prom = <Prometheus>::default();
        let index_prom = prom.sub_registry_with_prefix("kato_xds_index");
        let queue_metrics = index::metrics::QueueMetrics::register(index_prom);
        let registry_metrics = index::metrics::RegistryMetrics::register(index_prom);

        // Watch events are enqueued onto the work queue, which a single
        // worker drains into the registry.
        let (queue, worker) =
            index::queue::channel(Duration::from_millis(retry_delay_ms), queue_metrics);
        let (xds_index, initial_build) = Index::shared(queue);
        let indexed = IndexMetrics::register(xds_index.clone(), index_prom).shared();

        let grpc_metrics = grpc::metrics::GrpcServerMetricsFamily::register(
            prom.sub_registry_with_prefix("kato_xds_grpc"),
        );
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // The admin server reports ready once the first build has completed.
        let ready = runtime.initialized_handle();

        // The cache outlives the registry and the gRPC server, which both hold
        // handles to it.
        let cache = SnapshotCache::default();

        // Spawn resource watches.

        let selector = format!("{}={}", labels::CREATOR, creator);

        let services = runtime
            .watch_all::<k8s::Service>(watcher::Config::default().labels(&selector));
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), services)
                .instrument(info_span!("services")),
        );

        let endpoints = runtime
            .watch_all::<k8s::Endpoints>(watcher::Config::default().labels(&selector));
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), endpoints)
                .instrument(info_span!("endpoints")),
        );

        let config_maps = runtime
            .watch_all::<k8s::ConfigMap>(watcher::Config::default().labels(&selector));
        tokio::spawn(
            index::index_config_maps(xds_index.clone(), indexed, config_maps)
                .instrument(info_span!("configmaps")),
        );

        let registry = Registry::new(xds_index, cache.clone(), registry_metrics);
        tokio::spawn(
            worker
                .run(registry, runtime.shutdown_handle())
                .instrument(info_span!("queue")),
        );

        // Run the gRPC server once the initial build has been published.
        let grpc = tokio::spawn(grpc(
            grpc_addr,
            max_concurrent_streams,
            grpc::XdsServer::new(cache.clone(), grpc_metrics, runtime.shutdown_handle()),
            initial_build,
            ready,
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // the background tasks to complete before exiting.
        let runtime = runtime.run();
        tokio::pin!(runtime);
        tokio::select! {
            res = &mut runtime => {
                cache.clear();
                if res.is_err() {
                    bail!("Aborted");
                }
            }

            res = grpc => {
                cache.clear();
                match res {
                    // The server stops on its own only after shutdown begins.
                    Ok(Ok(())) => {
                        if runtime.await.is_err() {
                            bail!("Aborted");
                        }
                    }
                    Ok(Err(error)) => return Err(error.context("xDS server failed")),
                    Err(error) => bail!("xDS server task failed: {error}"),
                }
            }
        }

        Ok(())
    }
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn grpc(
    addr: SocketAddr,
    max_concurrent_streams: u32,
    xds: grpc::XdsServer,
    mut initial_build: watch::Receiver<bool>,
    ready: kubert::initialized::Handle,
    drain: drain::Watch,
) -> Result<()> {
    // Sidecars that connect before their dependencies are indexed would
    // receive an empty configuration, so nothing listens until then.
    tokio::select! {
        res = initial_build.wait_for(|built| *built) => {
            if res.is_err() {
                bail!("index stopped before the initial build completed");
            }
        }
        _ = drain.clone().signaled() => return Ok(()),
    }
    info!("Initial build complete");
    drop(ready);

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .max_concurrent_streams(max_concurrent_streams)
            .add_service(xds.ads())
            .add_service(xds.cds())
            .add_service(xds.eds())
            .add_service(xds.lds())
            .add_service(xds.rds())
            .add_service(xds.sds())
            .serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "xDS gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
