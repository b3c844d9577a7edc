//! Authgate configuration.
//!
//! Everything is read from `AUTHGATE_*` environment variables.

use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};

use crate::proxy::WorkerConfig;
use crate::store::StoreConfig;

/// Authgate configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to accept client connections on.
    pub listen_host: String,

    /// Port to accept client connections on.
    pub listen_port: u16,

    /// Number of worker threads.
    pub workers: usize,

    /// Settings shared by every worker.
    pub worker: WorkerConfig,

    /// Lookup store connection parameters.
    pub store: StoreConfig,

    /// Run without terminal output. Requires `log_file`.
    pub daemonize: bool,

    /// Optional JSON log file.
    pub log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through `var`, which returns the value of a variable if set.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_host = var("AUTHGATE_LISTEN_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let listen_port: u16 = parse_var(&var, "AUTHGATE_LISTEN_PORT")?.unwrap_or(9292);

        let workers: usize = parse_var(&var, "AUTHGATE_WORKERS")?
            .unwrap_or(8)
            .max(1);

        let buffer_size: usize = parse_var(&var, "AUTHGATE_BUFFER_SIZE")?
            .unwrap_or(32 * 1024)
            .max(1024);

        let max_connections: usize =
            parse_var(&var, "AUTHGATE_MAX_CONNECTIONS")?.unwrap_or(10000);

        let dial_timeout_ms: u64 = parse_var(&var, "AUTHGATE_DIAL_TIMEOUT_MS")?.unwrap_or(500);
        let route_ttl_secs: u64 = parse_var(&var, "AUTHGATE_ROUTE_TTL_SECS")?.unwrap_or(86400);

        let realm = var("AUTHGATE_REALM").unwrap_or_else(|| "authgate".to_string());

        let daemonize = var("AUTHGATE_DAEMONIZE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_file = var("AUTHGATE_LOG_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if daemonize && log_file.is_none() {
            bail!("AUTHGATE_DAEMONIZE requires AUTHGATE_LOG_FILE to be set.");
        }

        let log_level = var("AUTHGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let defaults = StoreConfig::default();
        let store = StoreConfig {
            host: var("AUTHGATE_STORE_HOST").unwrap_or(defaults.host),
            port: parse_var(&var, "AUTHGATE_STORE_PORT")?.unwrap_or(defaults.port),
            user: var("AUTHGATE_STORE_USER").unwrap_or(defaults.user),
            password: var("AUTHGATE_STORE_PASSWORD").unwrap_or(defaults.password),
            database: var("AUTHGATE_STORE_DATABASE").unwrap_or(defaults.database),
            charset: var("AUTHGATE_STORE_CHARSET").unwrap_or(defaults.charset),
            max_connections: parse_var(&var, "AUTHGATE_STORE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections)
                .max(1),
            acquire_timeout: defaults.acquire_timeout,
        };

        Ok(Self {
            listen_host,
            listen_port,
            workers,
            worker: WorkerConfig {
                max_connections,
                dial_timeout: Duration::from_millis(dial_timeout_ms),
                route_ttl: Duration::from_secs(route_ttl_secs),
                buffer_size,
                realm,
            },
            store,
            daemonize,
            log_file,
            log_level,
        })
    }

    /// `host:port` to bind, with IPv6 hosts bracketed.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|v| v.trim().parse())
        .transpose()
        .with_context(|| format!("{} must be an integer.", key))
}
