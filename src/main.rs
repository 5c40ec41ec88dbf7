use hostgate::admin::{AdminApi, PKG_NAME, VERSION};
use hostgate::cache::ResolutionCache;
use hostgate::config::{Config, StoreBackend};
use hostgate::db::SqliteStore;
use hostgate::directory::{HttpAppDirectory, HttpHostnameDirectory};
use hostgate::index::HostnameIndex;
use hostgate::pool::PoolConfig;
use hostgate::proxy::ProxyServer;
use hostgate::store::{MemoryCache, MemoryStore, SharedCacheStore, SharedRecordStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (records, cache_store) = open_store(&config)?;

    let index = HostnameIndex::new(records);
    let apps = Arc::new(HttpAppDirectory::new(
        &config.resolver.projects_url,
        &config.resolver.origin_suffix,
        config.resolver.timeout(),
    )?);
    let directory = Arc::new(HttpHostnameDirectory::new(
        &config.directory.endpoint,
        config.directory.timeout(),
    )?);

    let cache = ResolutionCache::new(index.clone(), apps, cache_store)
        .with_freshness_window(config.resolver.freshness_window());
    let admin = Arc::new(AdminApi::new(config.server.api_prefix.clone(), index, directory));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::with_pool_config(
        addr,
        cache,
        admin,
        config.upstream.target.clone(),
        shutdown_rx,
        pool_config,
    )
    .with_request_timeout(config.server.request_timeout());
    let pool = Arc::clone(proxy.pool());

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop (with timeout)
    if tokio::time::timeout(Duration::from_secs(5), proxy_handle).await.is_err() {
        warn!("Gateway did not stop within 5 seconds");
    }

    let stats = pool.stats();
    info!(
        total_requests = stats.get_total_requests(),
        failed_requests = stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Open the configured record store and resolution cache store
fn open_store(config: &Config) -> anyhow::Result<(SharedRecordStore, SharedCacheStore)> {
    match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; hostname bindings are lost on restart");
            let records: SharedRecordStore = Arc::new(MemoryStore::new());
            let cache: SharedCacheStore = Arc::new(MemoryCache::new());
            Ok((records, cache))
        }
        StoreBackend::Sqlite => {
            let store = Arc::new(SqliteStore::open(&config.store.path)?);
            info!(path = %config.store.path, "SQLite store opened");
            let records: SharedRecordStore = store.clone();
            let cache: SharedCacheStore = store;
            Ok((records, cache))
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        api_prefix = %config.server.api_prefix,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        target = %config.upstream.target,
        directory = %config.directory.endpoint,
        projects_url = %config.resolver.projects_url,
        origin_suffix = %config.resolver.origin_suffix,
        freshness_window_secs = config.resolver.freshness_window_secs,
        "Upstream settings"
    );
    info!(backend = ?config.store.backend, "Store settings");
}
