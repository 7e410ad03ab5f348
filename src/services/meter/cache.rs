//! Last-known-good readings and per-device health, behind one lock
//!
//! Each device owns a single overwritten slot. A poll tick commits its cache
//! and health changes together so readers never see half of a tick.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::health::HealthRecord;
use crate::models::Reading;

/// Cached reading plus the instant it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub reading: Reading,
    pub polled_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is at most `max_age` old at `now`
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(max_age) {
            Ok(max_age) => now - self.polled_at <= max_age,
            // beyond chrono's range: effectively unbounded
            Err(_) => true,
        }
    }
}

/// Everything known about one device
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub entry: Option<CacheEntry>,
    pub health: HealthRecord,
    pub last_error: Option<String>,
}

impl DeviceState {
    /// Store a reading, keeping reading timestamps strictly increasing
    pub(crate) fn store_reading(&mut self, mut reading: Reading, polled_at: DateTime<Utc>) {
        if let Some(previous) = &self.entry {
            let floor = previous.reading.timestamp_utc;
            if reading.timestamp_utc <= floor {
                reading.timestamp_utc = floor + chrono::Duration::microseconds(1);
            }
        }
        self.entry = Some(CacheEntry { reading, polled_at });
    }
}

/// Shared, synchronized per-device state
#[derive(Clone, Default)]
pub struct DeviceStore {
    devices: Arc<RwLock<HashMap<String, DeviceState>>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached reading for a device
    pub async fn put(&self, device_id: &str, reading: Reading) {
        self.commit(device_id, |state| state.store_reading(reading, Utc::now()))
            .await;
    }

    /// Cached reading, or `None` if absent or older than `max_age`
    pub async fn get(&self, device_id: &str, max_age: Option<Duration>) -> Option<Reading> {
        self.get_as_of(device_id, max_age, Utc::now()).await
    }

    /// Like [`DeviceStore::get`] evaluated at an explicit instant
    pub async fn get_as_of(
        &self,
        device_id: &str,
        max_age: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<Reading> {
        let devices = self.devices.read().await;
        let entry = devices.get(device_id)?.entry.as_ref()?;

        match max_age {
            Some(max_age) if !entry.is_fresh(max_age, now) => {
                debug!("Cache STALE: {} (polled at {})", device_id, entry.polled_at);
                None
            }
            _ => Some(entry.reading.clone()),
        }
    }

    pub async fn entry(&self, device_id: &str) -> Option<CacheEntry> {
        let devices = self.devices.read().await;
        devices.get(device_id)?.entry.clone()
    }

    /// Consistent copy of a device's state
    pub async fn state(&self, device_id: &str) -> Option<DeviceState> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Apply a tick's changes as one unit.
    ///
    /// The closure works on a copy which replaces the stored state once it
    /// returns; the write lock is held throughout.
    pub(crate) async fn commit<F, T>(&self, device_id: &str, apply: F) -> T
    where
        F: FnOnce(&mut DeviceState) -> T,
    {
        let mut devices = self.devices.write().await;
        let mut next = devices.get(device_id).cloned().unwrap_or_default();
        let result = apply(&mut next);
        devices.insert(device_id.to_string(), next);
        result
    }
}
