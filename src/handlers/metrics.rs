// Prometheus-compatible metrics endpoint

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::AppState;

/// Prometheus metrics endpoint
pub async fn get_prometheus_metrics(State(app_state): State<AppState>) -> Response {
    let body = match &app_state.metrics_handle {
        Some(handle) => handle.render(),
        None => "# metrics recorder not installed\n".to_string(),
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
