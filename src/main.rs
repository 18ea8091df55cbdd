use dockgate::admin::{AdminServer, PKG_NAME, VERSION};
use dockgate::config::Config;
use dockgate::docker::DockerRuntime;
use dockgate::ingest::{EventIngestor, FeedHealth};
use dockgate::proxy::ProxyServer;
use dockgate::registry::ServiceRegistry;
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
                .add_directive("dockgate=info".parse().map_err(|e| anyhow::anyhow!("Invalid log directive: {}", e))?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = ServiceRegistry::new();

    // Docker is optional at startup: without it the proxy serves nothing but
    // stays up, and the management API reports the degraded feed.
    let docker = match DockerRuntime::new(&config.docker).await {
        Ok(runtime) => Some(Arc::new(runtime)),
        Err(e) => {
            warn!(error = %e, "Docker unavailable; no containers will be registered");
            None
        }
    };

    let (feed_health, ingest_handle) = match docker.as_ref() {
        Some(runtime) => {
            let ingestor = EventIngestor::new(Arc::clone(runtime), Arc::clone(&registry), config.docker.clone())
                .with_domain(config.server.domain.clone());
            let health = ingestor.health();
            let handle = tokio::spawn(ingestor.run(shutdown_rx.clone()));
            (health, Some(handle))
        }
        None => {
            let (_, health) = watch::channel(FeedHealth::Degraded {
                last_error: "no Docker connection".to_string(),
            });
            (health, None)
        }
    };

    // Proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid proxy bind address");
            anyhow::anyhow!("Invalid proxy bind address: {}", e)
        })?;
    let proxy = ProxyServer::new(proxy_addr, Arc::clone(&registry), &config.proxy, shutdown_rx.clone());
    let pool_stats = proxy.pool_stats();
    let proxy_handle = tokio::spawn(proxy.run());

    // Admin server (if port > 0)
    let admin_handle = if config.server.admin_port > 0 {
        let admin_addr: SocketAddr = format!("{}:{}", config.server.admin_bind, config.server.admin_port)
            .parse()
            .map_err(|e| {
                error!(admin_bind = %config.server.admin_bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let mut admin = AdminServer::new(
            admin_addr,
            Arc::clone(&registry),
            feed_health,
            shutdown_rx.clone(),
            admin_token,
        )
        .with_domain(config.server.domain.clone())
        .with_pool_stats(pool_stats);
        if let Some(runtime) = docker.as_ref() {
            admin = admin.with_docker(Arc::clone(runtime));
        }

        Some(tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal or a proxy listener failure
    tokio::select! {
        _ = shutdown_signal() => {}
        result = proxy_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Proxy server error");
                    let _ = shutdown_tx.send(true);
                    return Err(e);
                }
                Err(e) => error!(error = %e, "Proxy server task failed"),
            }
        }
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = ingest_handle {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_port > 0 { Some(config.server.admin_port) } else { None },
        domain = %config.server.domain,
        "Server configuration"
    );
    info!(
        connect_timeout_secs = config.proxy.connect_timeout_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        websocket_connect_timeout_secs = config.proxy.websocket_connect_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        "Proxy settings"
    );
    info!(
        docker_host = ?config.docker.host,
        network = ?config.docker.network,
        prune_on_stop = config.docker.prune_on_stop,
        resync_on_connect = config.docker.resync_on_connect,
        max_reconnect_attempts = config.docker.max_reconnect_attempts,
        "Docker settings"
    );
}
