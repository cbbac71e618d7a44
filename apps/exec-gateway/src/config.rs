use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use exec_relay::credential::{
    DEFAULT_CREDENTIAL_COOKIE, DEFAULT_CSRF_COOKIE, DEFAULT_CSRF_HEADER,
};
use secrecy::SecretString;
use thiserror::Error;
use url::Url;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_CLUSTER_ADDR: &str = "http://127.0.0.1:4646";
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
/// Upper bound for every `*_SECS` setting (one week).
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;
const DEVELOPMENT_TICKET_SECRET: &str = "exec-gateway-development-ticket-secret";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Second listener served by the accept-callback adapter.
    pub native_bind_addr: Option<SocketAddr>,
    pub log_filter: String,
    pub cluster_addr: String,
    pub ticket_secret: SecretString,
    pub credential_cookie: String,
    pub csrf_cookie: String,
    pub csrf_header: String,
    pub upstream_token_in_query: bool,
    pub upstream_connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub uses_development_secret: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} value '{value}': {source}")]
    InvalidAddr {
        name: &'static str,
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid NOMAD_ADDR value '{0}': expected an http(s) or ws(s) URL")]
    InvalidClusterAddr(String),
    #[error("invalid {name} value '{value}': expected whole seconds, at most {MAX_TIMEOUT_SECS}")]
    InvalidSeconds { name: &'static str, value: String },
    #[error("EXEC_TICKET_SECRET must be set")]
    MissingTicketSecret,
}

impl Config {
    /// Production configuration. A missing ticket secret is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok(), false)
    }

    /// Same as [`from_env`](Self::from_env) but falls back to a fixed
    /// development ticket secret.
    pub fn development() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok(), true)
    }

    pub fn from_lookup<F>(lookup: F, allow_development_secret: bool) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = parse_addr(
            "EXEC_GATEWAY_BIND_ADDR",
            value("EXEC_GATEWAY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        )?;
        let native_bind_addr = value("EXEC_GATEWAY_NATIVE_BIND_ADDR")
            .map(|raw| parse_addr("EXEC_GATEWAY_NATIVE_BIND_ADDR", raw))
            .transpose()?;

        let log_filter =
            value("EXEC_GATEWAY_LOG_FILTER").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let cluster_addr =
            value("NOMAD_ADDR").unwrap_or_else(|| DEFAULT_CLUSTER_ADDR.to_string());
        let cluster_ok = Url::parse(&cluster_addr)
            .map(|url| matches!(url.scheme(), "http" | "https" | "ws" | "wss"))
            .unwrap_or(false);
        if !cluster_ok {
            return Err(ConfigError::InvalidClusterAddr(cluster_addr));
        }

        let (ticket_secret, uses_development_secret) = match value("EXEC_TICKET_SECRET") {
            Some(secret) => (secret, false),
            None if allow_development_secret => (DEVELOPMENT_TICKET_SECRET.to_string(), true),
            None => return Err(ConfigError::MissingTicketSecret),
        };

        let upstream_token_in_query = value("EXEC_UPSTREAM_TOKEN_IN_QUERY")
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let upstream_connect_timeout = Duration::from_secs(parse_seconds(
            "EXEC_UPSTREAM_CONNECT_TIMEOUT_SECS",
            value("EXEC_UPSTREAM_CONNECT_TIMEOUT_SECS"),
            DEFAULT_UPSTREAM_CONNECT_TIMEOUT_SECS,
        )?);
        let idle_timeout = match parse_seconds(
            "EXEC_IDLE_TIMEOUT_SECS",
            value("EXEC_IDLE_TIMEOUT_SECS"),
            DEFAULT_IDLE_TIMEOUT_SECS,
        )? {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };

        Ok(Self {
            bind_addr,
            native_bind_addr,
            log_filter,
            cluster_addr,
            ticket_secret: SecretString::new(ticket_secret),
            credential_cookie: value("EXEC_CREDENTIAL_COOKIE")
                .unwrap_or_else(|| DEFAULT_CREDENTIAL_COOKIE.to_string()),
            csrf_cookie: value("EXEC_CSRF_COOKIE").unwrap_or_else(|| DEFAULT_CSRF_COOKIE.to_string()),
            csrf_header: value("EXEC_CSRF_HEADER")
                .map(|header| header.to_ascii_lowercase())
                .unwrap_or_else(|| DEFAULT_CSRF_HEADER.to_string()),
            upstream_token_in_query,
            upstream_connect_timeout,
            idle_timeout,
            uses_development_secret,
        })
    }
}

fn parse_addr(name: &'static str, value: String) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::InvalidAddr {
            name,
            value,
            source,
        })
}

fn parse_seconds(
    name: &'static str,
    value: Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(seconds) if seconds <= MAX_TIMEOUT_SECS => Ok(seconds),
            _ => Err(ConfigError::InvalidSeconds { name, value }),
        },
    }
}
