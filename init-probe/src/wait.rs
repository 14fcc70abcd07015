use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{StatusCode, Uri};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::{net::SocketAddr, time::Duration};
use tokio::time;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, clap::Args)]
pub struct Args {
    /// The local Envoy admin server.
    #[clap(long, env = "ENVOY_ADMIN_ADDR", default_value = "127.0.0.1:65534")]
    admin_addr: SocketAddr,

    /// A port Envoy must be listening on before it is considered started.
    #[clap(long, env = "ENVOY_LISTENER_PORT")]
    listener_port: Option<u16>,

    #[clap(long, default_value = "60s", value_parser = crate::parse_duration)]
    timeout: Duration,
}

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

pub async fn run(args: Args) -> Result<()> {
    let Args {
        admin_addr,
        listener_port,
        timeout,
    } = args;

    let client = Client::builder(TokioExecutor::new()).build_http();
    info!(%admin_addr, ?listener_port, "Waiting for Envoy");
    match time::timeout(timeout, poll(&client, admin_addr, listener_port)).await {
        Ok(()) => {
            info!("Envoy is ready");
            Ok(())
        }
        Err(_) => bail!("Envoy not ready after {timeout:?}"),
    }
}

async fn poll(client: &HttpClient, admin: SocketAddr, port: Option<u16>) {
    loop {
        match check(client, admin, port).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(error) => debug!(%error, "Envoy admin not reachable"),
        }
        time::sleep(POLL_INTERVAL).await;
    }
}

async fn check(client: &HttpClient, admin: SocketAddr, port: Option<u16>) -> Result<bool> {
    let (status, state) = get(client, admin, "/ready").await?;
    if status != StatusCode::OK || state.trim() != "LIVE" {
        debug!(%status, state = %state.trim(), "Envoy not live");
        return Ok(false);
    }

    let Some(port) = port else {
        return Ok(true);
    };
    let (_, listeners) = get(client, admin, "/listeners").await?;
    let listening = listening_on(&listeners, port);
    if !listening {
        debug!(port, "Envoy not yet listening");
    }
    Ok(listening)
}

async fn get(client: &HttpClient, admin: SocketAddr, path: &str) -> Result<(StatusCode, String)> {
    let uri = format!("http://{admin}{path}")
        .parse::<Uri>()
        .context("invalid admin address")?;
    let rsp = client.get(uri).await?;
    let status = rsp.status();
    let body = rsp.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Envoy lists one `<name>::<address>:<port>` line per listener.
fn listening_on(listeners: &str, port: u16) -> bool {
    listeners
        .lines()
        .filter_map(|line| line.rsplit_once(':'))
        .any(|(_, p)| p.trim().parse::<u16>().ok() == Some(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_listener_ports() {
        let listeners = "\
ns_app_upstream_8080::127.0.0.1:8080
ns_app_downstream_5000::0.0.0.0:5000
";
        assert!(listening_on(listeners, 8080));
        assert!(listening_on(listeners, 5000));
        assert!(!listening_on(listeners, 80));
        assert!(!listening_on("", 8080));
    }
}
