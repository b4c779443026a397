use routegate::admin::{admin_tls_config, AdminServer, PKG_NAME, VERSION};
use routegate::api::ControlApi;
use routegate::auth::{AuthConfig, AuthGate};
use routegate::certs::CertificateStore;
use routegate::config::Config;
use routegate::db::Database;
use routegate::dispatch::{ConnectionTracker, DispatchContext, DispatchStats};
use routegate::operators::{ensure_bootstrap_operator, OperatorStore, BOOTSTRAP_IDENTIFIER};
use routegate::pool::{ConnectionPool, PoolConfig};
use routegate::proxy::HttpProxyServer;
use routegate::records::RecordStore;
use routegate::tls_proxy::TlsProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "routegate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("routegate=info")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(explicit_path)?;

    print_startup_banner(&config);

    // Store and bootstrap
    let db = Arc::new(Database::open(&config.store.path).map_err(|e| {
        error!(path = %config.store.path.display(), error = %e, "Failed to open store");
        anyhow::anyhow!("Failed to open store {}: {}", config.store.path.display(), e)
    })?);
    let operators = OperatorStore::new(Arc::clone(&db));
    let records = RecordStore::new(Arc::clone(&db));

    if let Some(secret) = ensure_bootstrap_operator(&operators)? {
        warn!(
            identifier = BOOTSTRAP_IDENTIFIER,
            secret = %secret,
            "Store was empty, created the bootstrap operator. Record this secret, it is not shown again"
        );
    }

    if config.auth.token_secret.is_none() {
        warn!("No auth.token_secret configured, using a random secret; tokens will not survive a restart");
    }
    let auth = AuthGate::new(AuthConfig::from_settings(&config.auth), operators.clone());
    let api = ControlApi::new(operators, records.clone(), auth);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(ConnectionPool::new(PoolConfig::from_settings(
        &config.pool,
        config.timeouts.connect(),
    )));
    let pool_stats = pool.stats();
    let tracker = Arc::new(ConnectionTracker::new());
    let stats = Arc::new(DispatchStats::default());
    let ctx = DispatchContext {
        records,
        pool,
        stats: Arc::clone(&stats),
        tracker: Arc::clone(&tracker),
        timeouts: config.timeouts.clone(),
        shutdown: shutdown_rx.clone(),
    };

    // Bind everything before serving so a bad address fails startup
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if config.proxy.http.enabled {
        let server = HttpProxyServer::bind(config.http_addr()?, ctx.clone()).await?;
        handles.push(("http proxy", spawn_listener("http proxy", server.run())));
    }

    if config.proxy.tls.enabled {
        let certs = Arc::new(CertificateStore::from_config(&config.proxy.tls));
        let server = TlsProxyServer::bind(config.tls_addr()?, ctx.clone(), certs).await?;
        handles.push(("tls proxy", spawn_listener("tls proxy", server.run())));
    }

    let admin_tls = admin_tls_config(&config.admin)?;
    let admin = AdminServer::bind(
        config.admin_addr()?,
        admin_tls,
        api,
        config.admin.static_dir.clone(),
        config.timeouts.clone(),
        shutdown_rx.clone(),
    )
    .await?;
    handles.push(("admin", spawn_listener("admin", admin.run())));

    wait_for_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    let aborted = tracker.drain(config.timeouts.shutdown_grace()).await;
    if aborted > 0 {
        warn!(connections = aborted, "Closed connections still open after the grace period");
    }

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for (name, handle) in handles {
            if handle.await.is_err() {
                warn!(listener = name, "Listener task ended abnormally");
            }
        }
    })
    .await;

    let snapshot = stats.snapshot();
    info!(
        accepted = snapshot.accepted,
        rejected = snapshot.rejected,
        forwarded = snapshot.forwarded,
        upstream_failures = snapshot.upstream_failures,
        backend_requests = pool_stats.get_total_requests(),
        failed_backend_requests = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Load the config file. Without an explicit path a missing default file means defaults.
fn load_config(explicit_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit_path.is_none() && !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn spawn_listener<F>(name: &'static str, run: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = run.await {
            error!(listener = name, error = %e, "Listener failed");
        }
    })
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        store = %config.store.path.display(),
        admin = %config.admin.listen,
        http = config.proxy.http.enabled.then_some(config.proxy.http.listen.as_str()),
        tls = config.proxy.tls.enabled.then_some(config.proxy.tls.listen.as_str()),
        "Listener configuration"
    );
    info!(
        connect_secs = config.timeouts.connect_secs,
        idle_secs = config.timeouts.idle_secs,
        sni_secs = config.timeouts.sni_secs,
        handshake_secs = config.timeouts.handshake_secs,
        request_secs = config.timeouts.request_secs,
        shutdown_grace_secs = config.timeouts.shutdown_grace_secs,
        "I/O deadlines"
    );
    info!(
        pool_max_idle = config.pool.max_idle_per_host,
        pool_idle_timeout_secs = config.pool.idle_timeout_secs,
        "Connection pool settings"
    );
}
