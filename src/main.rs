// src/main.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cluster_load_balancer::{
    config::{self, Config},
    health::HealthChecker,
    manager::Manager,
    metrics::MetricsRegistry,
    proxy::TcpForwarder,
    server::{bind_tcp, ServerBuilder, StatusHandler},
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = config::load_config(&config_path).await?;

    // RUST_LOG wins over the configured level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("Loaded configuration from: {}", config_path);

    let registry = Arc::new(MetricsRegistry::new()?);
    let manager = Arc::new(Manager::new(Some(registry.collector())));
    let report = manager.apply_config(&config)?;

    let checker = HealthChecker::new(manager.clone())?;
    checker.sync(manager.probe_targets());

    for name in &report.listeners_added {
        start_listener(&manager, &config, name)
            .await
            .with_context(|| format!("Failed to start listener {}", name))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if config.status.enabled {
        start_status_server(&config, manager.clone(), registry, shutdown_rx);
    }

    run_until_shutdown(&manager, &checker, &config_path).await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    checker.shutdown();
    manager.shutdown();
    Ok(())
}

async fn start_listener(manager: &Manager, config: &Config, name: &str) -> Result<()> {
    let listener = manager
        .listener(name)
        .with_context(|| format!("Listener {} is not registered", name))?;
    let connect_timeout = config
        .listeners
        .iter()
        .find(|lc| lc.name == name)
        .map(|lc| lc.connect_timeout())
        .unwrap_or_default();

    let socket = bind_tcp(listener.bind()).await?;
    let handler = Arc::new(TcpForwarder::new(connect_timeout));
    tokio::spawn(async move {
        let name = listener.name().to_string();
        if let Err(e) = listener.serve(socket, handler).await {
            error!("Listener {} failed: {}", name, e);
        }
    });
    Ok(())
}

fn start_status_server(
    config: &Config,
    manager: Arc<Manager>,
    registry: Arc<MetricsRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let addr = config.status.bind;
    let handler = StatusHandler::new(manager, registry, &config.status.metrics_path);
    info!(
        "Status server on http://{} (metrics at {}, snapshot at /status)",
        addr, config.status.metrics_path
    );

    tokio::spawn(async move {
        let stopped = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let server = ServerBuilder::new(addr).with_handler(handler);
        if let Err(e) = server.serve(stopped).await {
            error!("Status server error: {:#}", e);
        }
    });
}

/// Re-reads the config file and applies it. A file that fails to load or
/// validate leaves the running state untouched.
async fn reload(manager: &Manager, checker: &HealthChecker, config_path: &str) {
    info!("Reloading configuration from: {}", config_path);
    let config = match config::load_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!("Reload failed, keeping current configuration: {:#}", e);
            return;
        }
    };
    let report = match manager.apply_config(&config) {
        Ok(report) => report,
        Err(e) => {
            error!("Reload failed, keeping current configuration: {}", e);
            return;
        }
    };

    checker.sync(manager.probe_targets());
    for name in &report.listeners_added {
        if let Err(e) = start_listener(manager, &config, name).await {
            warn!("Listener {} not started: {:#}", name, e);
        }
    }
}

#[cfg(unix)]
async fn run_until_shutdown(manager: &Manager, checker: &HealthChecker, config_path: &str) -> Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = hangup.recv() => reload(manager, checker, config_path).await,
        }
    }
}

#[cfg(not(unix))]
async fn run_until_shutdown(_manager: &Manager, _checker: &HealthChecker, _config_path: &str) -> Result<()> {
    shutdown_signal().await;
    Ok(())
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
