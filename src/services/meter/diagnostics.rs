//! Connection diagnostics for a device
//!
//! Probes the pages and CGI endpoints a meter usually exposes and reports
//! what each one returned. Used to find a working endpoint when polling
//! keeps failing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::fetcher::normalize_base_url;
use crate::config::DeviceConfig;

/// Paths probed relative to the normalized base URL
pub const PROBE_PATHS: &[&str] = &[
    "",
    "en_GB/check.html",
    "en/check.html",
    "check.html",
    "cgi-bin/egauge",
    "cgi-bin/egauge-show",
    "cgi-bin/egauge?inst",
    "cgi-bin/egauge?tot",
];

const PREVIEW_CHARS: usize = 200;

/// What the body looks like
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentAnalysis {
    pub has_local_mains: bool,
    pub is_html: bool,
    pub is_xml: bool,
    pub mentions_egauge: bool,
}

impl ContentAnalysis {
    pub fn of(body: &str, label_pattern: &str) -> Self {
        let lower = body.to_lowercase();
        let trimmed = lower.trim_start();
        Self {
            has_local_mains: lower.contains(&label_pattern.to_lowercase()),
            is_html: lower.contains("<html") || trimmed.starts_with("<!doctype html"),
            is_xml: trimmed.starts_with("<?xml"),
            mentions_egauge: lower.contains("egauge"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointProbe {
    pub url: String,
    pub status_code: Option<u16>,
    pub success: bool,
    pub content_type: Option<String>,
    pub content_length: usize,
    pub response_time_ms: f64,
    pub preview: Option<String>,
    pub analysis: Option<ContentAnalysis>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub device_id: String,
    pub base_url: String,
    pub normalized_base_url: String,
    pub has_auth: bool,
    pub endpoints: Vec<EndpointProbe>,
    /// First endpoint that answered 200 with the expected registers
    pub recommended_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Probes device endpoints with a caller-supplied client
#[derive(Clone)]
pub struct EndpointProber {
    client: reqwest::Client,
}

impl EndpointProber {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Longest a full diagnosis of `device` can take
    pub fn budget(device: &DeviceConfig) -> Duration {
        device.request_timeout() * PROBE_PATHS.len() as u32
    }

    pub async fn diagnose(&self, device: &DeviceConfig) -> DiagnosticReport {
        let base = normalize_base_url(&device.base_url);
        info!("Diagnosing connection to {} at {}", device.id, base);

        let mut endpoints = Vec::with_capacity(PROBE_PATHS.len());
        for path in PROBE_PATHS {
            let url = if path.is_empty() {
                base.clone()
            } else {
                format!("{}/{}", base, path)
            };
            endpoints.push(self.probe(device, url).await);
        }

        let recommended_url = endpoints
            .iter()
            .find(|probe| {
                probe.success
                    && probe
                        .analysis
                        .as_ref()
                        .is_some_and(|analysis| analysis.has_local_mains)
            })
            .map(|probe| probe.url.clone());

        DiagnosticReport {
            device_id: device.id.clone(),
            base_url: device.base_url.clone(),
            normalized_base_url: base,
            has_auth: device.has_auth(),
            endpoints,
            recommended_url,
            timestamp: Utc::now(),
        }
    }

    async fn probe(&self, device: &DeviceConfig, url: String) -> EndpointProbe {
        let started = Instant::now();
        let mut request = self.client.get(&url).timeout(device.request_timeout());
        if let Some((username, password)) = device.basic_auth() {
            request = request.basic_auth(username, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                return EndpointProbe {
                    url,
                    status_code: None,
                    success: false,
                    content_type: None,
                    content_length: 0,
                    response_time_ms: elapsed_ms(started),
                    preview: None,
                    analysis: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let (body, error) = match response.text().await {
            Ok(body) => (body, None),
            Err(e) => (String::new(), Some(e.to_string())),
        };

        debug!("Probe {} -> {} ({} bytes)", url, status.as_u16(), body.len());
        EndpointProbe {
            url,
            status_code: Some(status.as_u16()),
            success: status.is_success(),
            content_type,
            content_length: body.len(),
            response_time_ms: elapsed_ms(started),
            preview: Some(body.chars().take(PREVIEW_CHARS).collect()),
            analysis: Some(ContentAnalysis::of(&body, &device.label_pattern)),
            error,
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0
}
