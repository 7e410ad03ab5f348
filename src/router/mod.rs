//! Router configuration module

use axum::{http::StatusCode, routing::get, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::app_state::AppState;
use crate::config::Config;
use crate::handlers::{health, meter_routes, metrics};
use crate::middleware::{metrics_middleware, request_logger_middleware};
use crate::services::meter::EndpointProber;

/// Slack on top of the slowest device exchange
const DEVICE_TIMEOUT_HEADROOM: Duration = Duration::from_secs(5);

/// Build the application router.
///
/// Routes that wait on a device get a timeout sized to the slowest device
/// instead of `REQUEST_TIMEOUT`.
pub fn build_router(app_state: AppState) -> Router {
    let request_timeout = Duration::from_secs(app_state.config.request_timeout);
    let device_timeout = device_request_timeout(&app_state.config);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::get_prometheus_metrics))
        .route_layer(timeout_layer(request_timeout))
        .nest(
            "/api/meters",
            meter_routes(timeout_layer(request_timeout), timeout_layer(device_timeout)),
        )
        .layer(axum::middleware::from_fn(metrics_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logger_middleware))
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state)
}

fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

/// Timeout for requests that poll or probe a device
pub fn device_request_timeout(config: &Config) -> Duration {
    let slowest = config
        .devices
        .iter()
        .map(|device| device.fetch_budget().max(EndpointProber::budget(device)))
        .max()
        .unwrap_or_default();

    slowest.max(Duration::from_secs(config.request_timeout)) + DEVICE_TIMEOUT_HEADROOM
}
