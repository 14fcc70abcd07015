//! Typed decoding of plugin option maps.
//!
//! Unknown keys are ignored. Values that fail to parse fall back to their
//! defaults rather than failing the whole configuration.

use crate::plugin::OptionMap;
use std::{str::FromStr, time::Duration};

pub const PREFIX: &str = "Prefix";
pub const HEADERS: &str = "Headers";
pub const DOMAINS: &str = "Domains";
pub const MAX_CONNECTIONS: &str = "MaxConnections";
pub const MAX_REQUESTS: &str = "MaxRequests";
pub const MAX_PENDING_REQUESTS: &str = "MaxPendingRequests";
pub const MAX_ACTIVE_RETRIES: &str = "MaxActiveRetries";
pub const MAX_REQUESTS_PER_CONNECTION: &str = "MaxRequestsPerConnection";
pub const WEIGHT: &str = "Weight";
pub const INTERVAL_MS: &str = "IntervalMS";
pub const CONSECUTIVE_ERRORS: &str = "ConsecutiveErrors";
pub const BASE_EJECTION_TIME_MS: &str = "BaseEjectionTimeMS";
pub const MAX_EJECTION_PERCENT: &str = "MaxEjectionPercent";
pub const HEALTHY_PANIC_THRESHOLD: &str = "HealthyPanicThreshold";
pub const CONNECTION_TIMEOUT: &str = "ConnectionTimeout";
pub const TCP_IDLE_TIMEOUT: &str = "TCPIdleTimeout";
pub const GRPC_HEALTH_SERVICE_NAME: &str = "GrpcHealthServiceName";
pub const HEALTH_CHECK_TIMEOUT: &str = "HealthCheckTimeout";
pub const HEALTH_CHECK_INTERVAL: &str = "HealthCheckInterval";
pub const OPEN_LIMIT: &str = "OPEN_LIMIT";
pub const LIMIT_DOMAIN: &str = "LIMIT_DOMAIN";
pub const LIMIT_SERVER_HOST: &str = "LIMIT_SERVER_HOST";
pub const LIMIT_SERVER_PORT: &str = "LIMIT_SERVER_PORT";

/// Every option that may be applied to a dependency or a local port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub prefix: String,
    pub headers: Vec<HeaderMatch>,
    pub domains: Vec<String>,
    pub max_connections: u32,
    pub max_requests: u32,
    pub max_pending_requests: u32,
    pub max_active_retries: u32,
    pub max_requests_per_connection: Option<u32>,
    pub weight: u32,
    pub outlier_interval: Duration,
    pub consecutive_errors: u32,
    pub base_ejection_time: Duration,
    pub max_ejection_percent: u32,
    pub healthy_panic_threshold: u32,
    pub connection_timeout: Duration,
    pub tcp_idle_timeout: Duration,
    pub grpc_health_service_name: Option<String>,
    pub health_check_timeout: Duration,
    pub health_check_interval: Duration,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeaderMatch {
    pub name: String,
    pub value: String,
}

/// Rate limiting for an inbound HTTP port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub domain: String,
    pub server_host: String,
    pub server_port: u16,
}

// === impl Options ===

impl Default for Options {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            headers: Vec::new(),
            domains: vec!["*".to_string()],
            max_connections: 10240,
            max_requests: 10240,
            max_pending_requests: 1024,
            max_active_retries: 3,
            max_requests_per_connection: None,
            weight: 100,
            outlier_interval: Duration::from_millis(10_000),
            consecutive_errors: 5,
            base_ejection_time: Duration::from_millis(30_000),
            max_ejection_percent: 10,
            healthy_panic_threshold: 50,
            connection_timeout: Duration::from_millis(250),
            tcp_idle_timeout: Duration::from_secs(7200),
            grpc_health_service_name: None,
            health_check_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(4),
            rate_limit: None,
        }
    }
}

impl Options {
    pub fn parse(opts: &OptionMap) -> Self {
        let mut parsed = Self::default();
        let mut rate_limit = RateLimit::default();
        let mut open_limit = false;

        for (key, value) in opts {
            let value = value.trim();
            match key.as_str() {
                PREFIX if !value.is_empty() => parsed.prefix = value.to_string(),
                HEADERS => parsed.headers = parse_headers(value),
                DOMAINS => {
                    let domains = value
                        .split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(ToString::to_string)
                        .collect::<Vec<_>>();
                    if !domains.is_empty() {
                        parsed.domains = domains;
                    }
                }
                MAX_CONNECTIONS => number(key, value, &mut parsed.max_connections),
                MAX_REQUESTS => number(key, value, &mut parsed.max_requests),
                MAX_PENDING_REQUESTS => number(key, value, &mut parsed.max_pending_requests),
                MAX_ACTIVE_RETRIES => number(key, value, &mut parsed.max_active_retries),
                MAX_REQUESTS_PER_CONNECTION => {
                    parsed.max_requests_per_connection = parse_number(key, value);
                }
                WEIGHT => number(key, value, &mut parsed.weight),
                INTERVAL_MS => millis(key, value, &mut parsed.outlier_interval),
                CONSECUTIVE_ERRORS => number(key, value, &mut parsed.consecutive_errors),
                BASE_EJECTION_TIME_MS => millis(key, value, &mut parsed.base_ejection_time),
                MAX_EJECTION_PERCENT => percent(key, value, &mut parsed.max_ejection_percent),
                HEALTHY_PANIC_THRESHOLD => {
                    percent(key, value, &mut parsed.healthy_panic_threshold)
                }
                CONNECTION_TIMEOUT => millis(key, value, &mut parsed.connection_timeout),
                TCP_IDLE_TIMEOUT => secs(key, value, &mut parsed.tcp_idle_timeout),
                GRPC_HEALTH_SERVICE_NAME => {
                    parsed.grpc_health_service_name =
                        Some(value.to_string()).filter(|v| !v.is_empty());
                }
                HEALTH_CHECK_TIMEOUT => secs(key, value, &mut parsed.health_check_timeout),
                HEALTH_CHECK_INTERVAL => secs(key, value, &mut parsed.health_check_interval),
                OPEN_LIMIT => {
                    open_limit = value.eq_ignore_ascii_case("yes")
                        || value.eq_ignore_ascii_case("true");
                }
                LIMIT_DOMAIN if !value.is_empty() => rate_limit.domain = value.to_string(),
                LIMIT_SERVER_HOST if !value.is_empty() => {
                    rate_limit.server_host = value.to_string()
                }
                LIMIT_SERVER_PORT => number(key, value, &mut rate_limit.server_port),
                _ => {}
            }
        }

        if open_limit {
            parsed.rate_limit = Some(rate_limit);
        }
        parsed
    }
}

// === impl RateLimit ===

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            domain: "limit.common".to_string(),
            server_host: "rate-limit-server".to_string(),
            server_port: 8081,
        }
    }
}

/// Parses `k:v;k:v`. A `has_header:no` entry disables header matching
/// entirely.
fn parse_headers(value: &str) -> Vec<HeaderMatch> {
    let mut headers = Vec::new();
    for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once(':') else {
            tracing::debug!(header = %pair, "Ignoring malformed header match");
            continue;
        };
        let (name, value) = (name.trim(), value.trim());
        if name == "has_header" && value == "no" {
            return Vec::new();
        }
        if name.is_empty() {
            continue;
        }
        headers.push(HeaderMatch {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    headers
}

fn parse_number<N: FromStr>(key: &str, value: &str) -> Option<N> {
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::debug!(%key, %value, "Invalid numeric option; using default");
            None
        }
    }
}

fn number<N: FromStr>(key: &str, value: &str, slot: &mut N) {
    if let Some(n) = parse_number(key, value) {
        *slot = n;
    }
}

fn percent(key: &str, value: &str, slot: &mut u32) {
    if let Some(n) = parse_number::<u32>(key, value).filter(|n| *n <= 100) {
        *slot = n;
    }
}

fn millis(key: &str, value: &str, slot: &mut Duration) {
    if let Some(n) = parse_number(key, value) {
        *slot = Duration::from_millis(n);
    }
}

fn secs(key: &str, value: &str, slot: &mut Duration) {
    if let Some(n) = parse_number(key, value) {
        *slot = Duration::from_secs(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};

    #[test]
    fn defaults() {
        let opts = Options::parse(&OptionMap::new());
        assert_eq!(opts, Options::default());
        assert_eq!(opts.prefix, "/");
        assert_eq!(opts.domains, ["*"]);
        assert_eq!(opts.weight, 100);
        assert_eq!(opts.max_pending_requests, 1024);
        assert_eq!(opts.rate_limit, None);
    }

    #[test]
    fn recognized_keys() {
        let opts = Options::parse(&convert_args!(btreemap!(
            "Prefix" => "/api",
            "Headers" => "x-env:canary; x-user : bob",
            "Domains" => "a.example.com, b.example.com",
            "MaxConnections" => "10",
            "MaxRequestsPerConnection" => "7",
            "Weight" => "30",
            "IntervalMS" => "500",
            "ConnectionTimeout" => "1000",
            "TCPIdleTimeout" => "60",
            "GrpcHealthServiceName" => "grpc.health",
            "HealthCheckInterval" => "9",
            "Unrecognized" => "whatever",
        )));

        assert_eq!(opts.prefix, "/api");
        assert_eq!(
            opts.headers,
            [
                HeaderMatch {
                    name: "x-env".into(),
                    value: "canary".into()
                },
                HeaderMatch {
                    name: "x-user".into(),
                    value: "bob".into()
                },
            ]
        );
        assert_eq!(opts.domains, ["a.example.com", "b.example.com"]);
        assert_eq!(opts.max_connections, 10);
        assert_eq!(opts.max_requests_per_connection, Some(7));
        assert_eq!(opts.weight, 30);
        assert_eq!(opts.outlier_interval, Duration::from_millis(500));
        assert_eq!(opts.connection_timeout, Duration::from_secs(1));
        assert_eq!(opts.tcp_idle_timeout, Duration::from_secs(60));
        assert_eq!(opts.grpc_health_service_name.as_deref(), Some("grpc.health"));
        assert_eq!(opts.health_check_interval, Duration::from_secs(9));
    }

    #[test]
    fn malformed_numbers_fall_back() {
        let opts = Options::parse(&convert_args!(btreemap!(
            "MaxRequests" => "lots",
            "Weight" => "-1",
            "MaxEjectionPercent" => "250",
            "HealthCheckTimeout" => "",
        )));
        let defaults = Options::default();
        assert_eq!(opts.max_requests, defaults.max_requests);
        assert_eq!(opts.weight, defaults.weight);
        assert_eq!(opts.max_ejection_percent, defaults.max_ejection_percent);
        assert_eq!(opts.health_check_timeout, defaults.health_check_timeout);
    }

    #[test]
    fn has_header_no_disables_matching() {
        let opts = Options::parse(&convert_args!(btreemap!(
            "Headers" => "x-env:canary;has_header:no",
        )));
        assert!(opts.headers.is_empty());
    }

    #[test]
    fn rate_limit() {
        let opts = Options::parse(&convert_args!(btreemap!(
            "OPEN_LIMIT" => "YES",
            "LIMIT_DOMAIN" => "orders",
        )));
        assert_eq!(
            opts.rate_limit,
            Some(RateLimit {
                domain: "orders".into(),
                ..Default::default()
            })
        );

        let opts = Options::parse(&convert_args!(btreemap!(
            "OPEN_LIMIT" => "no",
            "LIMIT_DOMAIN" => "orders",
        )));
        assert_eq!(opts.rate_limit, None);
    }
}
