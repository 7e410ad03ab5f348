use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metrics middleware that tracks request metrics
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    // Route template keeps device ids out of label values
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let start = Instant::now();

    gauge!("http_requests_in_flight", "path" => path.clone()).increment(1.0);
    counter!("http_requests_total", "method" => method.clone(), "path" => path.clone()).increment(1);

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    histogram!(
        "http_request_duration_seconds",
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status.clone()
    )
    .record(start.elapsed().as_secs_f64());

    gauge!("http_requests_in_flight", "path" => path.clone()).decrement(1.0);

    if response.status().is_server_error() {
        counter!(
            "http_errors_total",
            "method" => method,
            "path" => path,
            "status" => status
        )
        .increment(1);
    }

    response
}

/// Track one polling tick
pub fn track_meter_poll(device_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "meter_polls_total",
        "device" => device_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    if outcome != "skipped" {
        histogram!("meter_poll_duration_seconds", "device" => device_id.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Track a forced poll requested through the API
pub fn track_force_poll(device_id: &str, status: &str) {
    counter!(
        "meter_force_polls_total",
        "device" => device_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Track cache lookups for latest readings
pub fn track_cache_operation(operation: &str, hit: bool) {
    counter!(
        "cache_operations_total",
        "operation" => operation.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}
