use crate::xds::XdsArgs;
use anyhow::{Context, Result};
use kato_xds_controller_envoy::virtual_host_domains;
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs, time};
use tracing::{debug, info, warn};

const BEGIN: &str = "# kato-mesh begin";
const END: &str = "# kato-mesh end";

#[derive(Debug, clap::Args)]
pub struct Args {
    #[clap(flatten)]
    xds: XdsArgs,

    #[clap(long, env = "HOST_FILE_PATH", default_value = "/etc/hosts")]
    hosts_file: PathBuf,

    #[clap(long, default_value = "5s", value_parser = crate::parse_duration)]
    interval: Duration,
}

pub async fn run(args: Args) -> Result<()> {
    let Args {
        xds,
        hosts_file,
        interval,
    } = args;

    let client = xds.client()?;
    let (shutdown, _) = kubert::shutdown::sigint_or_sigterm()?;
    tokio::pin! {
        let shutdown = shutdown.signaled();
    }

    info!(node = %client.node(), path = %hosts_file.display(), "Maintaining hosts file");
    let mut ticks = time::interval(interval);
    ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            _ = &mut shutdown => {
                info!("Shutting down");
                return Ok(());
            }
        }

        let listeners = match client.listeners().await {
            Ok(listeners) => listeners,
            Err(error) => {
                warn!(%error, "Failed to fetch listeners");
                continue;
            }
        };
        let domains = listeners
            .iter()
            .flat_map(virtual_host_domains)
            .collect::<BTreeSet<_>>();
        match sync(&hosts_file, &domains).await {
            Ok(true) => info!(?domains, "Updated hosts file"),
            Ok(false) => debug!("Hosts file up to date"),
            Err(error) => warn!(%error, "Failed to update hosts file"),
        }
    }
}

/// Rewrites the mesh block of a hosts file. Returns true if the file changed.
async fn sync(path: &Path, domains: &BTreeSet<String>) -> Result<bool> {
    let current = match fs::read_to_string(path).await {
        Ok(current) => current,
        Err(error) if error.kind() == io::ErrorKind::NotFound => String::new(),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    let updated = render(&current, domains);
    if updated == current {
        return Ok(false);
    }
    fs::write(path, updated)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

/// Replaces the delimited mesh block, mapping each domain to the loopback
/// address. All other lines are preserved.
fn render(current: &str, domains: &BTreeSet<String>) -> String {
    let mut hosts = String::with_capacity(current.len());
    let mut in_block = false;
    for line in current.lines() {
        match line.trim() {
            BEGIN => in_block = true,
            END if in_block => in_block = false,
            _ if in_block => {}
            _ => {
                hosts.push_str(line);
                hosts.push('\n');
            }
        }
    }

    if !domains.is_empty() {
        hosts.push_str(BEGIN);
        hosts.push('\n');
        for domain in domains {
            hosts.push_str(&format!("127.0.0.1 {domain}\n"));
        }
        hosts.push_str(END);
        hosts.push('\n');
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    const HOSTS: &str = "127.0.0.1 localhost\n10.0.0.7 app-0\n";

    #[test]
    fn appends_a_mesh_block() {
        let hosts = render(HOSTS, &domains(&["web", "api"]));
        assert_eq!(
            hosts,
            "127.0.0.1 localhost\n10.0.0.7 app-0\n\
             # kato-mesh begin\n127.0.0.1 api\n127.0.0.1 web\n# kato-mesh end\n"
        );
    }

    #[test]
    fn replaces_the_existing_block() {
        let hosts = render(HOSTS, &domains(&["web", "api"]));
        let hosts = format!("{hosts}192.168.1.1 gateway\n");

        let updated = render(&hosts, &domains(&["web"]));
        assert_eq!(
            updated,
            "127.0.0.1 localhost\n10.0.0.7 app-0\n192.168.1.1 gateway\n\
             # kato-mesh begin\n127.0.0.1 web\n# kato-mesh end\n"
        );

        // Rendering is stable.
        assert_eq!(render(&updated, &domains(&["web"])), updated);
    }

    #[test]
    fn removes_the_block_without_domains() {
        let hosts = render(HOSTS, &domains(&["web"]));
        assert_eq!(render(&hosts, &BTreeSet::new()), HOSTS);
    }

    #[tokio::test]
    async fn syncs_only_on_change() {
        let path = std::env::temp_dir().join(format!("kato-hosts-{}", std::process::id()));
        fs::write(&path, HOSTS).await.expect("must write fixture");

        let web = domains(&["web"]);
        assert!(sync(&path, &web).await.expect("sync must succeed"));
        assert!(!sync(&path, &web).await.expect("sync must succeed"));
        let contents = fs::read_to_string(&path).await.expect("must read hosts");
        assert!(contents.starts_with(HOSTS));
        assert!(contents.contains("127.0.0.1 web\n"));

        fs::remove_file(&path).await.expect("must remove fixture");
    }
}
