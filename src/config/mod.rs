use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub mod devices;
pub use devices::DeviceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub environment: String,
    pub port: u16,
    /// Seconds before an HTTP request to this service times out
    pub request_timeout: u64,
    pub log_format: LogFormat,
    pub polling: PollingConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Settings shared by all polled devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Interval of the health summary log job (default: 300)
    pub health_log_interval_secs: u64,
    /// Freshness window for serving cached readings (default: 900)
    pub cache_max_age_secs: u64,
    /// Oldest cached reading a failed force poll may fall back to (default: 86400)
    pub force_poll_max_age_secs: u64,
    /// Number of polling errors kept in memory (default: 200)
    pub error_history_size: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            health_log_interval_secs: 300,
            cache_max_age_secs: 15 * 60,
            force_poll_max_age_secs: 24 * 60 * 60,
            error_history_size: 200,
        }
    }
}

impl PollingConfig {
    pub fn health_log_interval(&self) -> Duration {
        Duration::from_secs(self.health_log_interval_secs)
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn force_poll_max_age(&self) -> Duration {
        Duration::from_secs(self.force_poll_max_age_secs)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = PollingConfig::default();

        let device_ids: Vec<String> = lookup("METER_DEVICES")
            .unwrap_or_else(|| "bertha-house".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if device_ids.is_empty() {
            return Err(anyhow::anyhow!("METER_DEVICES must list at least one device"));
        }

        let devices = device_ids
            .iter()
            .map(|id| DeviceConfig::from_lookup(id, &lookup))
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            environment: lookup("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            port: lookup("PORT")
                .unwrap_or_else(|| "8000".to_string())
                .parse()?,
            request_timeout: lookup("REQUEST_TIMEOUT")
                .unwrap_or_else(|| "30".to_string())
                .parse()
                .unwrap_or(30),
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
            polling: PollingConfig {
                health_log_interval_secs: lookup("HEALTH_LOG_INTERVAL_SECS")
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults.health_log_interval_secs),
                cache_max_age_secs: lookup("METER_CACHE_MAX_AGE_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.cache_max_age_secs),
                force_poll_max_age_secs: lookup("METER_FORCE_POLL_MAX_AGE_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.force_poll_max_age_secs),
                error_history_size: lookup("METER_ERROR_HISTORY_SIZE")
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults.error_history_size),
            },
            devices,
        })
    }
}
