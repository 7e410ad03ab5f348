use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a reading came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadingSource {
    /// Fetched from the device
    Live,
    /// Synthesized by the degraded-fallback policy
    FallbackMock,
}

/// One polled power sample for a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub power_kw: f64,
    /// Approximate energy over the sampling window (power x window)
    pub energy_kwh_delta: f64,
    /// `energy_kwh_delta * cost_per_kwh`
    pub cost_delta: f64,
    pub timestamp_utc: DateTime<Utc>,
    pub source: ReadingSource,
    /// Summed register value as reported by the device, in watts
    pub raw_watts: f64,
}

impl Reading {
    /// Build a live reading from the raw register sum (watts).
    ///
    /// Negative sums (export exceeding import) are clamped to zero.
    pub fn live(device_id: impl Into<String>, raw_watts: f64, at: DateTime<Utc>) -> Self {
        let power_kw = round_to(raw_watts.max(0.0) / 1000.0, 3);
        Self {
            device_id: device_id.into(),
            power_kw,
            energy_kwh_delta: 0.0,
            cost_delta: 0.0,
            timestamp_utc: at,
            source: ReadingSource::Live,
            raw_watts: round_to(raw_watts, 2),
        }
    }
}

/// Round to a fixed number of decimal places
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
