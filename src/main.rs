use escudeiro::config::{Config, DotEnv, DOTENV_FILE};
use escudeiro::dispatcher::Dispatcher;
use escudeiro::php::PhpExecutor;
use escudeiro::pool::{ConnectionPool, PoolConfig};
use escudeiro::proxy::Forwarder;
use escudeiro::server::GatewayServer;
use escudeiro::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "escudeiro.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("escudeiro=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let dotenv = DotEnv::load(Path::new(DOTENV_FILE)).map_err(|e| {
        error!(error = %e, "Failed to load environment file");
        e
    })?;
    if !dotenv.is_empty() {
        info!(path = DOTENV_FILE, variables = dotenv.len(), "Environment file loaded");
    }

    let lookup = dotenv.layered(|name| std::env::var(name).ok());
    let config =
        Config::from_sources(&config_path, explicit_path.is_some(), lookup).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let pool_config = PoolConfig {
        max_idle_per_host: config.proxy.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.proxy.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let root = config.content_root().to_path_buf();
    let php = Arc::new(PhpExecutor::new(
        config.php.clone(),
        root.clone(),
        Arc::clone(&pool),
    ));

    let forwarder = config.proxy.upstream_origin()?.map(|upstream| {
        info!(upstream = %upstream, "Forwarding /api/ to upstream");
        Forwarder::new(upstream, Arc::clone(&pool), config.proxy.request_timeout())
    });
    if forwarder.is_none() {
        warn!("No upstream configured, /api/ answers 404");
    }

    let dispatcher = Arc::new(Dispatcher::new(root, php, forwarder));
    let server = GatewayServer::new(dispatcher, &config.server);

    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
    })?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut server_handle = tokio::spawn(server.run(listener, shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or an early server exit
    tokio::select! {
        _ = wait_for_signal() => {}
        result = &mut server_handle => {
            error!("Gateway stopped unexpectedly");
            return result?;
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The server bounds connection draining itself; this only guards the
    // interpreter shutdown that follows it
    let limit = config.server.shutdown_grace_period() + config.php.shutdown_grace_period();
    match tokio::time::timeout(limit + Duration::from_secs(1), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Gateway server error"),
        Ok(Err(e)) => error!(error = %e, "Gateway server task failed"),
        Err(_) => warn!("Timed out waiting for the gateway to stop"),
    }

    info!(
        outbound_requests = pool.stats().sent(),
        failed_requests = pool.stats().failed(),
        "Shutdown complete"
    );
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C is handled");
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
        header_read_timeout_secs = config.server.header_read_timeout_secs,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Server configuration"
    );
    info!(root = %config.content_root().display(), "Content root");
    info!(
        binary = %config.php.binary.display(),
        persistent = config.php.persistent,
        listen = %config.php.listen_addr(),
        startup_timeout_secs = config.php.startup_timeout_secs,
        exec_timeout_secs = config.php.exec_timeout_secs,
        "PHP interpreter settings"
    );
    info!(
        upstream = ?config.proxy.upstream,
        request_timeout_secs = config.proxy.request_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Proxy settings"
    );
}
