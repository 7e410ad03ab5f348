//! HTTP surface tests driven through the router without a listener

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use meter_telemetry::config::{Config, DeviceConfig};
use meter_telemetry::models::Reading;
use meter_telemetry::router::build_router;
use meter_telemetry::services::meter::{EndpointProber, FetchError, MeterFetcher};
use meter_telemetry::AppState;

/// "up" always answers 1.8 kW, "legacy" rejects the request format and
/// "down" is unreachable
struct FixedFetcher;

#[async_trait]
impl MeterFetcher for FixedFetcher {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError> {
        match device.id.as_str() {
            "up" => Ok(Reading::live(device.id.clone(), 1800.0, Utc::now())),
            "legacy" => Err(FetchError::FormatRejected {
                url: format!("{}/en_GB/check.html", device.base_url),
            }),
            _ => Err(FetchError::Transport {
                url: device.base_url.clone(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

/// Unreachable device that only gives up after `hang`
struct HangingFetcher {
    hang: Duration,
}

#[async_trait]
impl MeterFetcher for HangingFetcher {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError> {
        tokio::time::sleep(self.hang).await;
        Err(FetchError::Transport {
            url: device.base_url.clone(),
            message: "operation timed out".to_string(),
        })
    }
}

fn app_with(fetcher: Arc<dyn MeterFetcher>) -> Router {
    let config = Config::from_lookup(|key| match key {
        "METER_DEVICES" => Some("up,down,legacy".to_string()),
        "METER_UP_BASE_URL" => Some("http://up.local/63C1A1".to_string()),
        "METER_DOWN_BASE_URL" => Some("http://127.0.0.1:9/63C1A1".to_string()),
        "METER_DOWN_REQUEST_TIMEOUT_SECS" => Some("1".to_string()),
        "METER_LEGACY_BASE_URL" => Some("http://legacy.local/63C1A1".to_string()),
        _ => None,
    })
    .unwrap();

    let state = AppState::new(
        config,
        fetcher,
        EndpointProber::new(reqwest::Client::new()),
        None,
    );
    build_router(state)
}

fn test_app() -> Router {
    app_with(Arc::new(FixedFetcher))
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_latest_requires_fresh_data() {
    let app = test_app();

    let (status, body) = send(&app, "GET", "/api/meters/up/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RES_4003");

    let (status, body) = send(&app, "POST", "/api/meters/up/force-poll").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["reading"]["source"], "live");

    let (status, body) = send(&app, "GET", "/api/meters/up/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["power_kw"], 1.8);
    assert_eq!(body["device_id"], "up");
}

#[tokio::test]
async fn test_forced_latest_on_failing_device_is_unavailable() {
    let app = test_app();

    let (status, body) = send(&app, "GET", "/api/meters/down/latest?force=true").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "DEV_6004");

    let (status, body) = send(&app, "POST", "/api/meters/down/force-poll").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert!(body["error"].as_str().unwrap().contains("connection refused"));

    let (status, body) = send(&app, "GET", "/api/meters/history/errors?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["errors"][0]["device_id"], "down");
    assert_eq!(body["counts_by_device"]["down"], 2);
}

#[tokio::test]
async fn test_status_and_fleet_health() {
    let app = test_app();
    send(&app, "POST", "/api/meters/up/force-poll").await;

    let (status, body) = send(&app, "GET", "/api/meters/up/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"]["health"], "healthy");
    assert_eq!(body["status"]["uptime_percentage"], 100.0);
    assert_eq!(body["has_cached_data"], true);
    assert_eq!(body["config"]["has_auth"], false);
    assert!(body["config"].get("password").is_none());

    let (status, body) = send(&app, "GET", "/api/meters/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["overall"], "healthy");
    assert_eq!(body["devices"]["down"]["status"]["health"], "unknown");

    let (status, body) = send(&app, "GET", "/api/meters/nope/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RES_4002");
}

#[tokio::test]
async fn test_error_history_rejects_zero_limit() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/meters/history/errors?limit=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VAL_3001");
    assert_eq!(body["error"]["details"], "limit must be at least 1");
}

#[tokio::test]
async fn test_fallback_source_visible_on_every_route() {
    let app = test_app();

    let (status, body) = send(&app, "POST", "/api/meters/legacy/force-poll").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["reading"]["source"], "fallback_mock");

    let (status, body) = send(&app, "GET", "/api/meters/legacy/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "fallback_mock");

    let (status, body) = send(&app, "GET", "/api/meters/legacy/latest?force=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "fallback_mock");

    let (status, body) = send(&app, "GET", "/api/meters/legacy/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["latest_reading"]["source"], "fallback_mock");
    assert_eq!(body["status"]["health"], "degraded");

    send(&app, "POST", "/api/meters/up/force-poll").await;
    let (_, body) = send(&app, "GET", "/api/meters/up/latest").await;
    assert_eq!(body["source"], "live");
}

#[tokio::test(start_paused = true)]
async fn test_slow_force_poll_outlasts_request_timeout() {
    // three candidates at the default 15s each, past the 30s REQUEST_TIMEOUT
    let app = app_with(Arc::new(HangingFetcher {
        hang: Duration::from_secs(45),
    }));

    let (status, body) = send(&app, "POST", "/api/meters/down/force-poll").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert!(body["error"].as_str().unwrap().contains("timed out"));

    let (_, body) = send(&app, "GET", "/api/meters/down/status").await;
    assert_eq!(body["status"]["total_failures"], 1);
    assert!(!body["status"]["last_attempt"].is_null());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_force_poll_is_still_recorded() {
    let app = app_with(Arc::new(HangingFetcher {
        hang: Duration::from_secs(45),
    }));

    let abandoned = tokio::time::timeout(
        Duration::from_secs(5),
        send(&app, "POST", "/api/meters/up/force-poll"),
    )
    .await;
    assert!(abandoned.is_err());

    let (_, body) = send(&app, "GET", "/api/meters/up/status").await;
    assert!(!body["status"]["last_attempt"].is_null());
    assert_eq!(body["status"]["total_failures"], 0);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let (_, body) = send(&app, "GET", "/api/meters/up/status").await;
    assert_eq!(body["status"]["total_failures"], 1);
    assert!(body["last_error"]
        .as_str()
        .unwrap()
        .contains("operation timed out"));
}

#[tokio::test]
async fn test_diagnose_unreachable_device() {
    let app = test_app();
    let (status, body) = send(&app, "GET", "/api/meters/down/diagnose").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], "down");
    assert_eq!(body["endpoints"].as_array().unwrap().len(), 8);
    assert!(body["recommended_url"].is_null());
}

#[tokio::test]
async fn test_liveness_and_metrics() {
    let app = test_app();

    let (status, body) = send(&app, "GET", "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["polling_active"], true);
    assert_eq!(body["devices"], 3);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
