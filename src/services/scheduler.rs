//! Background job scheduler
//!
//! Jobs run on their own tokio task. A repeating job awaits each run before
//! waiting for the next tick, and ticks missed meanwhile are skipped, so a
//! job never overlaps itself.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A unit of scheduled work
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run `job` every `every`, first run one interval from now
    fn schedule(&self, name: &str, every: Duration, job: Job);

    /// Run `job` once, immediately
    fn schedule_once(&self, name: &str, job: Job);

    /// Stop accepting ticks and wait for running jobs to finish
    async fn stop(&self);
}

/// [`Scheduler`] on tokio tasks and intervals
pub struct TokioScheduler {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow()
    }

    fn handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        // a panicked job cannot leave the handle list inconsistent
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    fn schedule(&self, name: &str, every: Duration, job: Job) {
        if !self.is_running() {
            warn!("Scheduler stopped, not scheduling job {}", name);
            return;
        }

        let name = name.to_string();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                job().await;
            }
            debug!("Job {} stopped", name);
        });

        debug!("Scheduled repeating job (every {:?})", every);
        self.handles().push(handle);
    }

    fn schedule_once(&self, name: &str, job: Job) {
        if !self.is_running() {
            warn!("Scheduler stopped, not running job {}", name);
            return;
        }

        let handle = tokio::spawn(async move { job().await });
        self.handles().push(handle);
    }

    async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles().drain(..).collect();
        let count = handles.len();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Scheduled job ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped ({} jobs)", count);
    }
}
