//! Application startup and initialization logic

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::config::Config;
use crate::services::meter::{EndpointProber, HttpMeterFetcher};
use crate::services::Scheduler;

/// Initialize services and create the AppState.
pub async fn initialize_app(config: &Config) -> Result<AppState> {
    info!("🚀 Starting meter telemetry service");

    // Initialize Prometheus metrics exporter
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
    info!("✅ Prometheus metrics initialized");

    let fetcher = HttpMeterFetcher::new()?;
    let prober = EndpointProber::new(fetcher.client().clone());
    info!("✅ Meter HTTP client initialized");

    for device in &config.devices {
        info!(
            "📟 Device {}: {} (every {}s, auth: {})",
            device.id,
            device.base_url,
            device.poll_interval_secs,
            device.has_auth()
        );
    }

    let app_state = AppState::new(
        config.clone(),
        Arc::new(fetcher),
        prober,
        Some(metrics_handle),
    );
    info!("✅ Meter poller initialized for {} devices", config.devices.len());

    Ok(app_state)
}

/// Spawn background tasks.
pub fn spawn_background_tasks(app_state: &AppState) {
    info!("📌 Spawning background tasks...");

    app_state.poller.start(app_state.scheduler.as_ref());
    info!(
        "✅ Meter polling started (health summary every {}s)",
        app_state.config.polling.health_log_interval_secs
    );
}

/// Stop background tasks, waiting for in-flight polls.
pub async fn stop_background_tasks(app_state: &AppState) {
    info!("Stopping meter polling...");
    app_state.scheduler.stop().await;
    info!("✅ Meter polling stopped");
}

/// Wait for shutdown signal.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully");
        },
    }
}
