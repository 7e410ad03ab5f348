use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;
use tracing::{info, warn};

/// Page suffixes tried against a device base URL, in order
pub const DEFAULT_ENDPOINT_SUFFIXES: &[&str] = &["en_GB/check.html", "en/check.html", "check.html"];

/// Register row label summed by the default extractor
pub const DEFAULT_LABEL_PATTERN: &str = "local mains";

const DEFAULT_FALLBACK_MIN_KW: f64 = 1.2;
const DEFAULT_FALLBACK_MAX_KW: f64 = 3.8;

/// Configuration for a single polled meter device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier, e.g. "bertha-house"
    pub id: String,

    /// Device base URL including the install path (e.g. https://host/63C1A1)
    pub base_url: String,

    /// Basic auth username (auth is only sent when both parts are set)
    pub username: Option<String>,

    /// Basic auth password
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Interval in seconds between scheduled polls (default: 60)
    pub poll_interval_secs: u64,

    /// Tariff applied to energy deltas (default: 2.00 per kWh)
    pub cost_per_kwh: f64,

    /// Candidate page suffixes, tried in order
    pub endpoint_suffixes: Vec<String>,

    /// Case-insensitive label matched against register rows (default: "local mains")
    pub label_pattern: String,

    /// Lower bound in kW for synthesized fallback readings (default: 1.2)
    pub fallback_min_kw: f64,

    /// Upper bound in kW for synthesized fallback readings (default: 3.8)
    pub fallback_max_kw: f64,

    /// Per-request timeout in seconds (default: 15)
    pub request_timeout_secs: u64,
}

impl DeviceConfig {
    /// Device with defaults for everything but its identity and address
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            username: None,
            password: None,
            poll_interval_secs: 60,
            cost_per_kwh: 2.00,
            endpoint_suffixes: DEFAULT_ENDPOINT_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            label_pattern: DEFAULT_LABEL_PATTERN.to_string(),
            fallback_min_kw: DEFAULT_FALLBACK_MIN_KW,
            fallback_max_kw: DEFAULT_FALLBACK_MAX_KW,
            request_timeout_secs: 15,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Longest one fetch can take: every candidate page timing out in turn.
    ///
    /// A locale base URL adds one candidate ahead of the suffixes.
    pub fn fetch_budget(&self) -> Duration {
        self.request_timeout() * (self.endpoint_suffixes.len() as u32 + 1)
    }

    /// Bounds for synthesized readings, ordered low to high.
    ///
    /// Non-finite or negative bounds fall back to the defaults.
    pub fn fallback_range(&self) -> RangeInclusive<f64> {
        let (min, max) = (self.fallback_min_kw, self.fallback_max_kw);
        if !valid_fallback_bound(min) || !valid_fallback_bound(max) {
            return DEFAULT_FALLBACK_MIN_KW..=DEFAULT_FALLBACK_MAX_KW;
        }
        min.min(max)..=min.max(max)
    }

    /// Credentials, only when both username and password are non-empty
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().map(str::trim).unwrap_or_default();
        let password = self.password.as_deref().map(str::trim).unwrap_or_default();
        if username.is_empty() || password.is_empty() {
            None
        } else {
            Some((username, password))
        }
    }

    pub fn has_auth(&self) -> bool {
        self.basic_auth().is_some()
    }

    /// Environment variable prefix for a device id: "bertha-house" -> "METER_BERTHA_HOUSE_"
    pub fn env_prefix(id: &str) -> String {
        let normalized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("METER_{}_", normalized)
    }

    /// Load a device from variables prefixed with [`DeviceConfig::env_prefix`]
    pub fn from_lookup<F>(id: &str, lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = Self::env_prefix(id);
        let var = |name: &str| {
            lookup(&format!("{}{}", prefix, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let base_url = var("BASE_URL")
            .ok_or_else(|| anyhow!("{}BASE_URL environment variable is required", prefix))?;
        let mut config = Self::new(id, base_url);

        config.username = var("USERNAME");
        config.password = var("PASSWORD");

        if let Some(val) = var("POLL_INTERVAL_SECONDS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => {
                    config.poll_interval_secs = secs;
                    info!("Device {}: poll interval {}s", id, secs);
                }
                Ok(_) => warn!(
                    "Invalid poll interval for {}: {}, must be > 0, using default",
                    id, val
                ),
                Err(_) => warn!(
                    "Failed to parse poll interval for {}: {}, using default",
                    id, val
                ),
            }
        }

        if let Some(val) = var("COST_PER_KWH") {
            match val.parse::<f64>() {
                Ok(cost) if cost >= 0.0 => config.cost_per_kwh = cost,
                Ok(_) => warn!(
                    "Invalid cost per kWh for {}: {}, must be >= 0, using default",
                    id, val
                ),
                Err(_) => warn!(
                    "Failed to parse cost per kWh for {}: {}, using default",
                    id, val
                ),
            }
        }

        if let Some(val) = var("ENDPOINT_SUFFIXES") {
            let suffixes: Vec<String> = val
                .split(',')
                .map(|s| s.trim().trim_start_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if suffixes.is_empty() {
                warn!("Empty endpoint suffix list for {}, using default", id);
            } else {
                config.endpoint_suffixes = suffixes;
            }
        }

        if let Some(val) = var("LABEL_PATTERN") {
            config.label_pattern = val.to_lowercase();
        }

        let min = var("FALLBACK_MIN_KW").and_then(|v| v.parse::<f64>().ok());
        let max = var("FALLBACK_MAX_KW").and_then(|v| v.parse::<f64>().ok());
        if min.is_some() || max.is_some() {
            let min = min.unwrap_or(config.fallback_min_kw);
            let max = max.unwrap_or(config.fallback_max_kw);
            if valid_fallback_bound(min) && valid_fallback_bound(max) && min <= max {
                config.fallback_min_kw = min;
                config.fallback_max_kw = max;
            } else {
                warn!(
                    "Invalid fallback range for {}: {}..={}, using default",
                    id, min, max
                );
            }
        }

        if let Some(val) = var("REQUEST_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout_secs = secs,
                _ => warn!(
                    "Invalid request timeout for {}: {}, using default",
                    id, val
                ),
            }
        }

        Ok(config)
    }
}

fn valid_fallback_bound(kw: f64) -> bool {
    kw.is_finite() && kw >= 0.0
}
