use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subproxy::admin::{ControlPlane, PKG_NAME, VERSION};
use subproxy::admission::AdmissionPolicy;
use subproxy::config::{Config, StorageEngine};
use subproxy::pool::{ConnectionPool, PoolConfig};
use subproxy::proxy::ProxyServer;
use subproxy::router::Router;
use subproxy::store::open_store;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("subproxy=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("subproxy.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let store = open_store(&config.storage).context("Failed to open mapping store")?;

    let policy = Arc::new(AdmissionPolicy::from_config(&config.allow)?);
    let control_plane =
        Arc::new(ControlPlane::new(policy).with_auth_token(config.server.admin_token.clone()));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));

    let router = Router::new(
        &config.server.domain,
        Arc::clone(&store),
        Some(control_plane.into_fallback()),
        Arc::clone(&pool),
    )?
    .with_request_timeout(config.server.request_timeout());

    let bind_addr = config.server.bind_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::new(bind_addr, Arc::new(router), shutdown_rx);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let stats = pool.stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Backend request totals"
    );

    store.close();

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        domain = %config.server.domain,
        request_timeout_secs = ?config.server.request_timeout_secs,
        admin_auth = config.server.admin_token.is_some(),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    let storage_path = match config.storage.engine {
        StorageEngine::Sqlite => config.storage.path.as_str(),
        StorageEngine::Memory => "-",
    };
    info!(engine = ?config.storage.engine, path = storage_path, "Mapping store settings");
    info!(
        ips = ?config.allow.ips,
        networks = ?config.allow.networks,
        hosts = ?config.allow.hosts,
        "Backend allow-list"
    );
}
