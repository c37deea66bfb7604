use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use eligr::api::{create_router, AppState};
use eligr::config::Config;
use eligr::observability::{init_tracing, MetricsRegistry};
use eligr::rules::{RuleSetLoader, RuleSetWatcher};
use eligr::runs::RunManager;
use eligr::storage::{InMemoryRunStore, PostgresRunStore, RunStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let config = Config::parse();

    // Initialize tracing
    init_tracing(&config.log_level, config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting eligr decision engine"
    );

    // Choose the run store
    let store: Arc<dyn RunStore> = match config.database_url.as_deref() {
        Some(url) => {
            let store =
                PostgresRunStore::connect(url, config.db_min_connections, config.db_max_connections)
                    .await?;
            store.run_migrations().await?;
            info!("Postgres run store ready");
            Arc::new(store)
        }
        None => {
            warn!("No database configured, runs are kept in memory only");
            Arc::new(InMemoryRunStore::new())
        }
    };

    let metrics = Arc::new(MetricsRegistry::new());
    let manager = RunManager::new(store, config.run_manager_config(), metrics);

    // Start rule set watcher (optional)
    let watcher_handle = match config.rule_set_dir.clone() {
        Some(dir) => {
            let watcher = RuleSetWatcher::new(
                RuleSetLoader::new(dir),
                manager.clone(),
                config.rule_set_poll_interval(),
            );
            let (_, handle) = watcher.start().await;
            Some(handle)
        }
        None => {
            info!("Rule set directory not configured, publish rule sets over HTTP");
            None
        }
    };

    // Create application state
    let state = Arc::new(AppState {
        manager: manager.clone(),
        start_time: Instant::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        wait_timeout: config.wait_timeout(),
        request_timeout: config.request_timeout(),
        max_in_flight_requests: config.max_in_flight_requests,
        cors_origins: config.cors_origins.clone(),
    });

    // Create router
    let app = create_router(state);

    // Parse listen address
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(addr = %addr, "Starting HTTP server");

    // Create TCP listener
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run server with graceful shutdown
    if config.graceful_shutdown {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        axum::serve(listener, app).await?;
    }

    // Cleanup
    info!("Shutting down...");
    if let Some(handle) = watcher_handle {
        handle.abort();
    }

    let in_flight = manager.in_flight();
    if in_flight > 0 {
        info!(runs = in_flight, "Waiting for in-flight runs");
        if !manager.drain(config.shutdown_timeout()).await {
            warn!(
                runs = manager.in_flight(),
                "Shutdown timeout reached with runs still in flight"
            );
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal");
}
