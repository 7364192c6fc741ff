mod admission;
mod cleanup;
mod config;
mod coordinator;
mod engine;
mod error;
mod filter;
mod report_api;

use anyhow::{Context, Result};
use config::Config;
use filter::RuleCatalog;
use report_api::AppState;
use sysinfo::System;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting reports service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let mut system = System::new();
    system.refresh_memory();
    info!(
        cpus = config.worker_threads(),
        available_memory_mb = system.available_memory() / (1024 * 1024),
        memory_factor = config.limits.memory_factor,
        timeout_ms = config.limits.timeout_ms,
        rules = RuleCatalog::global().rules().len(),
        "Report generation limits"
    );

    let state = AppState::from_config(&config);

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = report_api::start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Reports service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down reports service");

    api_handle.abort();

    info!("Reports service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
