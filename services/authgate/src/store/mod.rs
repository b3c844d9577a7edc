//! Credential lookup store.
//!
//! The proxy depends on exactly one query: given an account name, return
//! zero or one host record. Everything about the store's transport stays
//! behind the [`CredentialStore`] trait.

mod error;
mod mysql;

pub use error::StoreError;
pub use mysql::MySqlStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// A row of the host table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Password stored for the account.
    pub password: String,
    /// Backend host (IP literal or hostname).
    pub ip: String,
    /// Backend port.
    pub port: u16,
    /// Free-form protocol label, informational only.
    pub protocol: Option<String>,
}

/// Source of host records keyed by account name.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Fetch the host record for `username`, if any.
    async fn lookup(&self, username: &str) -> Result<Option<HostRecord>, StoreError>;
}

/// Store connection parameters.
#[derive(Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub charset: String,
    /// Pool size per worker.
    pub max_connections: u32,
    /// How long a query waits for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "admin".to_string(),
            charset: "utf8mb4".to_string(),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_debug_redacts_password() {
        let config = StoreConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
