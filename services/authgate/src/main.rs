//! Authgate
//!
//! Credential-gated transparent TCP proxy.
//!
//! This service:
//! - Accepts client connections on one listening socket shared by all workers
//! - Reads HTTP Basic credentials from the first chunk a client sends
//! - Resolves them to a backend through a per-worker cache or the lookup store
//! - Relays bytes between the client and its backend

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use authgate::config::Config;
use authgate::proxy::{ProxyStats, WorkerPool};
use authgate::store::MySqlStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    authgate::logging::init(&config.log_level, config.log_file.as_deref(), config.daemonize)?;

    info!("Starting authgate");
    info!(
        listen_addr = %config.listen_addr(),
        workers = config.workers,
        max_connections = config.worker.max_connections,
        dial_timeout_ms = config.worker.dial_timeout.as_millis() as u64,
        route_ttl_secs = config.worker.route_ttl.as_secs(),
        store_host = %config.store.host,
        store_port = config.store.port,
        store_database = %config.store.database,
        "Configuration loaded"
    );

    let listener = std::net::TcpListener::bind(config.listen_addr())
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    let stats = Arc::new(ProxyStats::default());
    let store_config = config.store.clone();
    let pool = WorkerPool::spawn(
        config.workers,
        config.worker.clone(),
        listener,
        Arc::clone(&stats),
        move |_| Ok(MySqlStore::connect_lazy(&store_config)),
    )?;

    info!(bind_addr = %pool.local_addr(), "Listening");

    wait_for_shutdown().await?;
    info!("Shutdown requested");

    tokio::task::spawn_blocking(move || pool.shutdown())
        .await
        .context("Worker shutdown panicked")?;

    stats.log_summary();
    info!("Authgate stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")
}
