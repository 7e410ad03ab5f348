//! Application state shared across all handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::config::Config;
use crate::services::meter::{EndpointProber, MeterFetcher, MeterPoller, PollingErrorLog};
use crate::services::TokioScheduler;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// Device poller, owner of the reading cache and health records
    pub poller: MeterPoller,
    /// Recent polling errors
    pub error_log: PollingErrorLog,
    /// Connection diagnostics
    pub prober: EndpointProber,
    /// Background job scheduler
    pub scheduler: Arc<TokioScheduler>,
    /// Prometheus exporter handle, absent when no recorder is installed
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire the poller and its collaborators around a fetcher
    pub fn new(
        config: Config,
        fetcher: Arc<dyn MeterFetcher>,
        prober: EndpointProber,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let error_log = PollingErrorLog::new(config.polling.error_history_size);
        let poller = MeterPoller::new(
            config.devices.clone(),
            config.polling.clone(),
            fetcher,
            Arc::new(error_log.clone()),
        );

        Self {
            config,
            poller,
            error_log,
            prober,
            scheduler: Arc::new(TokioScheduler::new()),
            metrics_handle,
        }
    }
}
