//! MySQL-backed host lookup.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tracing::{debug, info};

use super::{CredentialStore, HostRecord, StoreConfig, StoreError};

const LOOKUP_SQL: &str = r#"
    SELECT
        password,
        ip,
        CAST(port AS SIGNED) AS port,
        protocol
    FROM host
    WHERE account = ?
    LIMIT 1
"#;

/// Host lookup against the `host` table.
///
/// The pool connects lazily, so building a store never touches the network
/// and a store outage only surfaces on the first query.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// Build a lazily-connecting store.
    ///
    /// Must be called from within a tokio runtime; the pool's maintenance
    /// tasks are spawned onto the calling runtime.
    pub fn connect_lazy(config: &StoreConfig) -> Self {
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            max_connections = config.max_connections,
            "Configuring lookup store"
        );

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .charset(&config.charset);

        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy_with(options);

        Self { pool }
    }
}

fn host_record_from_row(account: &str, row: &MySqlRow) -> Result<HostRecord, StoreError> {
    let password: String = row.try_get("password").map_err(StoreError::Query)?;
    let ip: String = row.try_get("ip").map_err(StoreError::Query)?;
    let port: i64 = row.try_get("port").map_err(StoreError::Query)?;
    let protocol: Option<String> = row.try_get("protocol").map_err(StoreError::Query)?;

    let port = u16::try_from(port).map_err(|_| StoreError::InvalidRecord {
        account: account.to_string(),
        reason: format!("port {} out of range", port),
    })?;

    Ok(HostRecord {
        password,
        ip,
        port,
        protocol,
    })
}

#[async_trait]
impl CredentialStore for MySqlStore {
    async fn lookup(&self, username: &str) -> Result<Option<HostRecord>, StoreError> {
        let row = sqlx::query(LOOKUP_SQL)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        debug!(username = %username, found = row.is_some(), "Host lookup complete");

        row.map(|row| host_record_from_row(username, &row))
            .transpose()
    }
}
