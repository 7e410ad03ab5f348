use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Number of latency samples kept per device
pub const LATENCY_WINDOW: usize = 10;

/// Consecutive failures before a device is reported degraded
pub const DEGRADED_AFTER: u64 = 2;

/// Consecutive failures before a device is reported offline
pub const OFFLINE_AFTER: u64 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Offline,
    #[default]
    Unknown,
}

impl Health {
    /// Severity used when folding several devices into one status
    fn severity(self) -> u8 {
        match self {
            Health::Unknown => 0,
            Health::Healthy => 1,
            Health::Degraded => 2,
            Health::Offline => 3,
        }
    }

    /// Worst health across devices; `Unknown` only when nothing else is known
    pub fn worst<I: IntoIterator<Item = Health>>(healths: I) -> Health {
        healths
            .into_iter()
            .max_by_key(|h| h.severity())
            .unwrap_or(Health::Unknown)
    }
}

/// Rolling polling statistics for one device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthRecord {
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub recent_latencies: VecDeque<Duration>,
    pub health: Health,
}

impl HealthRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, at: DateTime<Utc>) {
        self.last_attempt = Some(at);
    }

    /// Live reading obtained
    pub fn record_success(&mut self, latency: Duration, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success = Some(at);
        self.health = Health::Healthy;

        self.recent_latencies.push_back(latency);
        while self.recent_latencies.len() > LATENCY_WINDOW {
            self.recent_latencies.pop_front();
        }
    }

    /// Fetch failed with no fallback: a single blip leaves health unchanged
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.total_failures += 1;

        if self.consecutive_failures >= OFFLINE_AFTER {
            self.health = Health::Offline;
        } else if self.consecutive_failures >= DEGRADED_AFTER {
            self.health = Health::Degraded;
        }
    }

    /// Synthesized reading served: counts towards uptime but the device is degraded
    pub fn record_fallback(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.last_success = Some(at);
        self.health = Health::Degraded;
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let total: Duration = self.recent_latencies.iter().sum();
        Some(total / self.recent_latencies.len() as u32)
    }

    /// Share of successful polls in percent, 0 when nothing was polled yet
    pub fn uptime_pct(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            return 0.0;
        }
        self.total_successes as f64 / total as f64 * 100.0
    }
}

/// Age of the last successful reading
pub fn data_freshness(
    reading_timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<chrono::Duration> {
    reading_timestamp.map(|ts| now - ts)
}
