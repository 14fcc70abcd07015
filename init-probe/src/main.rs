#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod hosts;
mod probe;
mod wait;
mod xds;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;

/// Gates KATO sidecar startup on the availability of mesh dependencies.
#[derive(Debug, Parser)]
#[clap(name = "init-probe", version, about)]
struct Args {
    #[clap(long, default_value = "kato=info,warn", env = "KATO_INIT_PROBE_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Blocks until every startup dependency has a ready upstream.
    Probe(probe::Args),

    /// Blocks until the local Envoy is live and listening.
    Wait(wait::Args),

    /// Maps virtual host domains to the sidecar in the hosts file.
    Run(hosts::Args),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        command,
    } = Args::parse();

    log_format.try_init(log_level)?;

    match command {
        Command::Probe(args) => probe::run(args).await,
        Command::Wait(args) => wait::run(args).await,
        Command::Run(args) => hosts::run(args).await,
    }
}

/// Parses durations like `500ms`, `5s`, `2m`, or `1h`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let Some(offset) = s.rfind(|c: char| c.is_ascii_digit()) else {
        bail!("{s:?} does not contain a duration value");
    };
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>()?;

    let ms_per_unit = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => bail!("invalid duration unit {unit:?} (expected one of 'ms', 's', 'm', or 'h')"),
    };
    let ms = magnitude
        .checked_mul(ms_per_unit)
        .ok_or_else(|| anyhow!("duration {s:?} overflows"))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration(" 2m ").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_invalid_durations() {
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5 days").is_err());
        assert!(parse_duration("18446744073709551615s").is_err());
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::try_parse_from(["init-probe", "wait", "--timeout", "30s"])
            .expect("wait must parse");
        assert!(matches!(args.command, Command::Wait(_)));

        assert!(Args::try_parse_from(["init-probe"]).is_err());
    }
}
