// Polling services and background scheduling

pub mod meter;
pub mod scheduler;

pub use meter::{HttpMeterFetcher, MeterPoller, PollingErrorLog};
pub use scheduler::{Scheduler, TokioScheduler};
