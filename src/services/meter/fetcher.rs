//! HTTP fetcher for field meter status pages

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::extractor::{ExtractError, ReadingExtractor, RegisterTableExtractor};
use crate::config::DeviceConfig;
use crate::models::Reading;

/// Page tails stripped from a configured base URL, longest first
const KNOWN_PAGE_TAILS: &[&str] = &["/en_GB/check.html", "/en/check.html", "/check.html"];

const USER_AGENT: &str = concat!("meter-telemetry/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Connection, TLS or timeout failure
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// Non-200, non-400 response
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// HTTP 400: the device rejected the request format
    #[error("HTTP 400 Bad Request from {url}")]
    FormatRejected { url: String },

    /// HTTP 200 but the page did not contain the expected registers
    #[error("unexpected page content at {url}: {source}")]
    Extract {
        url: String,
        #[source]
        source: ExtractError,
    },

    #[error("no candidate endpoints for base URL '{0}'")]
    NoCandidates(String),
}

impl FetchError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }

    pub fn is_format_rejection(&self) -> bool {
        matches!(self, FetchError::FormatRejected { .. })
    }

    /// Short machine-readable label used for metrics and error records
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport { .. } => "transport",
            FetchError::HttpStatus { .. } => "http_status",
            FetchError::FormatRejected { .. } => "format_rejected",
            FetchError::Extract { .. } => "extract",
            FetchError::NoCandidates(_) => "no_candidates",
        }
    }
}

/// Fetches one reading from a device
#[async_trait]
pub trait MeterFetcher: Send + Sync {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError>;
}

/// Strip known page tails and anything from `/cgi-bin/` onward, keeping the install path
pub fn normalize_base_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }

    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, raw),
    };
    let rest = rest.split(['?', '#']).next().unwrap_or_default();

    let mut path = rest.trim_end_matches('/').to_string();
    if let Some(tail) = KNOWN_PAGE_TAILS.iter().find(|tail| path.ends_with(*tail)) {
        path.truncate(path.len() - tail.len());
    }
    if let Some(idx) = path.find("/cgi-bin/") {
        path.truncate(idx);
    }
    let path = path.trim_end_matches('/');

    match scheme {
        Some(scheme) => format!("{}://{}", scheme, path),
        None => path.to_string(),
    }
}

fn join_url(base: &str, suffix: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), suffix.trim_start_matches('/'))
}

/// Ordered list of URLs to try for a device
pub fn candidate_urls(base_url: &str, suffixes: &[String]) -> Vec<String> {
    let base = normalize_base_url(base_url);
    if base.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = suffixes.iter().map(|s| join_url(&base, s)).collect();

    // A base already pointing at a locale directory only needs the page name
    if base.ends_with("/en_GB") {
        candidates.insert(0, join_url(&base, "check.html"));
    }

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|url| seen.insert(url.clone()));
    candidates
}

/// Keep the more diagnostic of two errors: anything beats a transport failure
fn prefer_error(previous: Option<FetchError>, next: FetchError) -> FetchError {
    match previous {
        Some(prev) if next.is_transport() && !prev.is_transport() => prev,
        _ => next,
    }
}

/// Fetcher backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpMeterFetcher {
    client: reqwest::Client,
    /// Compiled extractors keyed by label pattern
    extractors: Arc<RwLock<HashMap<String, Arc<RegisterTableExtractor>>>>,
}

impl HttpMeterFetcher {
    /// Build the HTTP client.
    ///
    /// Field meters commonly serve self-signed or expired certificates, so
    /// certificate verification is disabled for this client only.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create meter HTTP client: {}", e))?;
        Ok(Self {
            client,
            extractors: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Extractor for a label pattern, built on first use
    fn extractor_for(
        &self,
        label_pattern: &str,
    ) -> Result<Arc<RegisterTableExtractor>, ExtractError> {
        if let Some(extractor) = self
            .extractors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(label_pattern)
        {
            return Ok(extractor.clone());
        }

        let extractor = Arc::new(RegisterTableExtractor::new(label_pattern)?);
        let mut extractors = self
            .extractors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(extractors
            .entry(label_pattern.to_string())
            .or_insert(extractor)
            .clone())
    }

    async fn fetch_candidate(
        &self,
        device: &DeviceConfig,
        url: &str,
        extractor: &dyn ReadingExtractor,
    ) -> Result<f64, FetchError> {
        let mut request = self
            .client
            .get(url)
            .timeout(device.request_timeout())
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            );
        if let Some((username, password)) = device.basic_auth() {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(
                "HTTP {} from {}: {}",
                status.as_u16(),
                url,
                snippet.replace('\n', " ")
            );

            return Err(if status == StatusCode::BAD_REQUEST {
                FetchError::FormatRejected {
                    url: url.to_string(),
                }
            } else {
                FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                }
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        extractor.extract(&body).map_err(|source| FetchError::Extract {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl MeterFetcher for HttpMeterFetcher {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError> {
        let extractor = self
            .extractor_for(&device.label_pattern)
            .map_err(|source| FetchError::Extract {
                url: device.base_url.clone(),
                source,
            })?;

        let candidates = candidate_urls(&device.base_url, &device.endpoint_suffixes);
        if candidates.is_empty() {
            return Err(FetchError::NoCandidates(device.base_url.clone()));
        }
        debug!("Trying meter URLs for {}: {:?}", device.id, candidates);

        let mut last_error: Option<FetchError> = None;
        for url in &candidates {
            match self.fetch_candidate(device, url, extractor.as_ref()).await {
                Ok(watts) => {
                    info!("Fetched {:.2} W from {}", watts, url);
                    return Ok(Reading::live(device.id.clone(), watts, Utc::now()));
                }
                Err(e) => {
                    debug!("URL {} failed: {}", url, e);
                    last_error = Some(prefer_error(last_error, e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::NoCandidates(device.base_url.clone())))
    }
}
