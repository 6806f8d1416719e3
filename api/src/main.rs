use anyhow::Result;
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::sync::Arc;

mod handlers;
mod routes;
mod state;

use common::config::Settings;
use common::connection::ConnectionManager;
use common::queue::{QueueRegistry, RedisBackendProvider};
use common::scheduler::SchedulerEngine;
use common::telemetry;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Settings::load()?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &config.observability.log_level,
        config.observability.log_format,
        config.observability.tracing_endpoint.as_deref(),
    )?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        default_target = %config.server.default_target,
        queues = ?config.queues.names,
        "Configuration loaded"
    );

    if let Some(metrics_port) = config.observability.metrics_port {
        telemetry::init_metrics(metrics_port)?;
    }

    let timezone: Tz = config
        .scheduler
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid scheduler timezone: {}", e))?;

    // Connections are opened lazily on first use of each target
    let connections = ConnectionManager::new(config.targets.clone());
    let provider = Arc::new(RedisBackendProvider::new(
        connections.clone(),
        config.queues.prefix.clone(),
    ));
    let registry = Arc::new(QueueRegistry::new(config.queues.clone(), provider));
    let scheduler = Arc::new(SchedulerEngine::new(registry, timezone));

    let state = AppState::new(
        scheduler,
        Arc::new(connections.clone()),
        connections,
        config.clone(),
    );

    let app = routes::create_router(state);

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    telemetry::shutdown_tracer();
    tracing::info!("API server stopped");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Initiating graceful shutdown");
}
