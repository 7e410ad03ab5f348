//! Read-only status views over the device store

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::cache::{DeviceState, DeviceStore};
use super::health::{data_freshness, Health};
use crate::config::DeviceConfig;
use crate::models::reading::{round_to, Reading};

/// Per-device polling statistics
#[derive(Debug, Clone, Serialize)]
pub struct PollingStatus {
    pub health: Health,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub uptime_percentage: f64,
    pub avg_response_time_ms: Option<f64>,
    pub data_freshness_seconds: Option<f64>,
}

/// Non-secret device configuration echoed in status responses
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEcho {
    pub base_url: String,
    pub poll_interval_seconds: u64,
    pub has_auth: bool,
    pub cost_per_kwh: f64,
}

impl From<&DeviceConfig> for ConfigEcho {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            base_url: device.base_url.clone(),
            poll_interval_seconds: device.poll_interval_secs,
            has_auth: device.has_auth(),
            cost_per_kwh: device.cost_per_kwh,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub status: PollingStatus,
    pub latest_reading: Option<Reading>,
    pub has_cached_data: bool,
    pub last_error: Option<String>,
    pub config: ConfigEcho,
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn build(device: &DeviceConfig, state: &DeviceState, now: DateTime<Utc>) -> Self {
        let health = &state.health;
        let latest_reading = state.entry.as_ref().map(|entry| entry.reading.clone());
        let freshness = data_freshness(
            latest_reading.as_ref().map(|reading| reading.timestamp_utc),
            now,
        );

        Self {
            device_id: device.id.clone(),
            status: PollingStatus {
                health: health.health,
                last_success: health.last_success,
                last_attempt: health.last_attempt,
                consecutive_failures: health.consecutive_failures,
                total_successes: health.total_successes,
                total_failures: health.total_failures,
                uptime_percentage: round_to(health.uptime_pct(), 1),
                avg_response_time_ms: health
                    .avg_latency()
                    .map(|latency| round_to(latency.as_secs_f64() * 1000.0, 1)),
                data_freshness_seconds: freshness
                    .map(|age| round_to(age.num_milliseconds() as f64 / 1000.0, 1)),
            },
            has_cached_data: latest_reading.is_some(),
            latest_reading,
            last_error: state.last_error.clone(),
            config: ConfigEcho::from(device),
            timestamp: now,
        }
    }
}

/// Health of every configured device
#[derive(Debug, Clone, Serialize)]
pub struct HealthOverview {
    pub overall: Health,
    pub devices: BTreeMap<String, StatusSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// Folds device health into one value: the worst known health wins
pub fn overall_health<'a, I>(snapshots: I) -> Health
where
    I: IntoIterator<Item = &'a StatusSnapshot>,
{
    Health::worst(snapshots.into_iter().map(|s| s.status.health))
}

/// Builds snapshots for configured devices. Never mutates state.
#[derive(Clone)]
pub struct StatusReporter {
    store: DeviceStore,
    devices: Arc<BTreeMap<String, DeviceConfig>>,
}

impl StatusReporter {
    pub fn new(store: DeviceStore, devices: Arc<BTreeMap<String, DeviceConfig>>) -> Self {
        Self { store, devices }
    }

    /// `None` for devices that are not configured
    pub async fn snapshot(&self, device_id: &str) -> Option<StatusSnapshot> {
        let device = self.devices.get(device_id)?;
        let state = self.store.state(device_id).await.unwrap_or_default();
        Some(StatusSnapshot::build(device, &state, Utc::now()))
    }

    pub async fn overview(&self) -> HealthOverview {
        let now = Utc::now();
        let mut devices = BTreeMap::new();
        for (id, device) in self.devices.iter() {
            let state = self.store.state(id).await.unwrap_or_default();
            devices.insert(id.clone(), StatusSnapshot::build(device, &state, now));
        }

        HealthOverview {
            overall: overall_health(devices.values()),
            devices,
            timestamp: now,
        }
    }
}
