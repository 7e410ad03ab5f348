//! Meter telemetry handlers.
//!
//! This module provides endpoints for:
//! - Latest and forced readings
//! - Per-device status and fleet health
//! - Polling error history and connection diagnostics

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::{
    error::{ApiError, Result},
    middleware::metrics::{track_cache_operation, track_force_poll},
    models::Reading,
    services::meter::{
        diagnostics::DiagnosticReport, ForcePollResult, ForcePollStatus, HealthOverview,
        PollingErrorRecord, StatusSnapshot,
    },
    AppState,
};

const DEFAULT_ERROR_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Deserialize, Default)]
pub struct LatestQuery {
    /// Poll the device before answering
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ErrorHistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ErrorHistoryResponse {
    pub errors: Vec<PollingErrorRecord>,
    pub count: usize,
    pub counts_by_device: HashMap<String, u64>,
}

/// Routes mounted under `/api/meters`.
///
/// `device_timeout` wraps the routes that poll or probe a device, the rest
/// only read shared state.
pub fn meter_routes(
    request_timeout: TimeoutLayer,
    device_timeout: TimeoutLayer,
) -> Router<AppState> {
    let state_routes = Router::new()
        .route("/health", get(get_all_health))
        .route("/history/errors", get(get_error_history))
        .route("/{device_id}/status", get(get_status))
        .route_layer(request_timeout);

    let device_routes = Router::new()
        .route("/{device_id}/latest", get(get_latest))
        .route("/{device_id}/force-poll", post(force_poll))
        .route("/{device_id}/diagnose", get(diagnose))
        .route_layer(device_timeout);

    state_routes.merge(device_routes)
}

fn ensure_device(state: &AppState, device_id: &str) -> Result<()> {
    if state.poller.device(device_id).is_some() {
        Ok(())
    } else {
        Err(ApiError::UnknownDevice(device_id.to_string()))
    }
}

/// Latest reading within the cache window, optionally polling first
pub async fn get_latest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LatestQuery>,
) -> Result<Json<Reading>> {
    ensure_device(&state, &device_id)?;

    if query.force {
        let result = state.poller.force_poll(&device_id).await;
        track_force_poll(&device_id, status_label(result.status));
        return match (result.status, result.reading) {
            (ForcePollStatus::Error, _) | (_, None) => Err(ApiError::poll_failed(
                &device_id,
                result.error.unwrap_or(result.message),
            )),
            (_, Some(reading)) => Ok(Json(reading)),
        };
    }

    let cached = state.poller.get_cached(&device_id, None).await;
    track_cache_operation("latest_reading", cached.is_some());
    cached
        .map(Json)
        .ok_or_else(|| ApiError::no_fresh_reading(&device_id))
}

/// Poll a device now, outside its schedule
pub async fn force_poll(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<ForcePollResult>> {
    ensure_device(&state, &device_id)?;

    info!("Force poll requested for {}", device_id);
    let result = state.poller.force_poll(&device_id).await;
    track_force_poll(&device_id, status_label(result.status));
    Ok(Json(result))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<StatusSnapshot>> {
    state
        .poller
        .get_status(&device_id)
        .await
        .map(Json)
        .ok_or(ApiError::UnknownDevice(device_id))
}

pub async fn get_all_health(State(state): State<AppState>) -> Json<HealthOverview> {
    Json(state.poller.get_all_health().await)
}

/// Recent polling errors, newest first
pub async fn get_error_history(
    State(state): State<AppState>,
    Query(query): Query<ErrorHistoryQuery>,
) -> Result<Json<ErrorHistoryResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_ERROR_HISTORY_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }

    let errors = state.error_log.recent(limit).await;
    Ok(Json(ErrorHistoryResponse {
        count: errors.len(),
        errors,
        counts_by_device: state.error_log.counts_by_device().await,
    }))
}

/// Probe known device endpoints
pub async fn diagnose(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DiagnosticReport>> {
    let device = state
        .poller
        .device(&device_id)
        .ok_or_else(|| ApiError::UnknownDevice(device_id.clone()))?;

    Ok(Json(state.prober.diagnose(device).await))
}

fn status_label(status: ForcePollStatus) -> &'static str {
    match status {
        ForcePollStatus::Success => "success",
        ForcePollStatus::Fallback => "fallback",
        ForcePollStatus::Error => "error",
    }
}
