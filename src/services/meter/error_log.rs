use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use super::health::Health;

/// One failed poll, with the context needed to analyse it later
#[derive(Debug, Clone, Serialize)]
pub struct PollingErrorRecord {
    pub device_id: String,
    pub error: String,
    pub error_kind: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    pub base_url: String,
    pub consecutive_failures: u64,
    pub health_status: Health,
}

/// Destination for polling errors. Delivery is best-effort.
#[async_trait]
pub trait PollingErrorSink: Send + Sync {
    async fn log_polling_error(&self, record: PollingErrorRecord) -> anyhow::Result<()>;
}

/// Bounded in-memory history of polling errors
#[derive(Clone)]
pub struct PollingErrorLog {
    entries: Arc<RwLock<VecDeque<PollingErrorRecord>>>,
    max_entries: usize,
}

impl PollingErrorLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    /// Most recent errors first
    pub async fn recent(&self, limit: usize) -> Vec<PollingErrorRecord> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Error counts per device over the retained history
    pub async fn counts_by_device(&self) -> HashMap<String, u64> {
        let entries = self.entries.read().await;
        let mut counts = HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.device_id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl PollingErrorSink for PollingErrorLog {
    async fn log_polling_error(&self, record: PollingErrorRecord) -> anyhow::Result<()> {
        warn!(
            device_id = %record.device_id,
            error_kind = %record.error_kind,
            duration_ms = record.duration_ms,
            consecutive_failures = record.consecutive_failures,
            health = ?record.health_status,
            base_url = %record.base_url,
            "Polling error: {}",
            record.error
        );

        let mut entries = self.entries.write().await;
        entries.push_back(record);
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        Ok(())
    }
}
