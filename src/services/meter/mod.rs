//! Remote meter telemetry: fetch, extract, cache, health and polling

pub mod cache;
pub mod diagnostics;
pub mod error_log;
pub mod extractor;
pub mod fetcher;
pub mod health;
pub mod poller;
pub mod status;

pub use cache::{CacheEntry, DeviceState, DeviceStore};
pub use diagnostics::{DiagnosticReport, EndpointProber};
pub use error_log::{PollingErrorLog, PollingErrorRecord, PollingErrorSink};
pub use extractor::{ExtractError, ReadingExtractor, RegisterTableExtractor};
pub use fetcher::{FetchError, HttpMeterFetcher, MeterFetcher};
pub use health::{Health, HealthRecord};
pub use poller::{FailurePolicy, ForcePollResult, ForcePollStatus, MeterPoller, PollOutcome};
pub use status::{HealthOverview, StatusReporter, StatusSnapshot};
