//! Polling scenarios against scripted fetchers and simulated devices

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meter_telemetry::config::{DeviceConfig, PollingConfig};
use meter_telemetry::models::{Reading, ReadingSource};
use meter_telemetry::services::meter::{
    FetchError, ForcePollStatus, Health, HttpMeterFetcher, MeterFetcher, MeterPoller,
    PollingErrorLog,
};
use meter_telemetry::services::{Scheduler, TokioScheduler};
use wiremock::matchers::{basic_auth, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHECK_PAGE: &str = r#"<html><body><table>
<tr><td>Local Mains L1</td><td>1234.5 W</td></tr>
<tr><td>Local Mains L2</td><td>765.5 W</td></tr>
<tr><td>Solar</td><td>-300 W</td></tr>
</table></body></html>"#;

/// Per-device scripted results; the last entry repeats
#[derive(Default)]
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Result<f64, FetchError>>>>,
}

impl ScriptedFetcher {
    fn with(mut self, device_id: &str, script: Vec<Result<f64, FetchError>>) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(device_id.to_string(), script.into());
        self
    }
}

#[async_trait]
impl MeterFetcher for ScriptedFetcher {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(&device.id).expect("device has a script");
        let next = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        };
        next.map(|watts| Reading::live(device.id.clone(), watts, Utc::now()))
    }
}

fn refused(device_id: &str) -> FetchError {
    FetchError::Transport {
        url: format!("http://{}.local/check.html", device_id),
        message: "connection refused".to_string(),
    }
}

fn rejected(device_id: &str) -> FetchError {
    FetchError::FormatRejected {
        url: format!("http://{}.local/check.html", device_id),
    }
}

fn device(id: &str) -> DeviceConfig {
    DeviceConfig::new(id, format!("http://{}.local/63C1A1", id))
}

fn scripted_poller(fetcher: ScriptedFetcher, ids: &[&str]) -> (MeterPoller, PollingErrorLog) {
    let log = PollingErrorLog::new(100);
    let poller = MeterPoller::new(
        ids.iter().map(|id| device(id)).collect(),
        PollingConfig::default(),
        Arc::new(fetcher),
        Arc::new(log.clone()),
    );
    (poller, log)
}

#[tokio::test]
async fn test_mixed_fleet_health() {
    let fetcher = ScriptedFetcher::default()
        .with("d1", vec![Err(rejected("d1"))])
        .with("d2", vec![Ok(1500.0), Err(refused("d2"))])
        .with("d3", vec![Err(refused("d3"))]);
    let (poller, log) = scripted_poller(fetcher, &["d1", "d2", "d3"]);

    // d1: format rejection becomes a synthesized reading
    let result = poller.force_poll("d1").await;
    assert_eq!(result.status, ForcePollStatus::Success);
    let reading = result.reading.unwrap();
    assert_eq!(reading.source, ReadingSource::FallbackMock);
    assert!((1.2..=3.8).contains(&reading.power_kw));
    let d1 = poller.get_status("d1").await.unwrap();
    assert_eq!(d1.status.health, Health::Degraded);
    assert_eq!(d1.status.total_successes, 1);
    assert_eq!(d1.status.consecutive_failures, 0);

    // d2: one live reading, then five transport failures
    poller.poll_device("d2").await;
    for _ in 0..5 {
        poller.poll_device("d2").await;
    }
    let d2 = poller.get_status("d2").await.unwrap();
    assert_eq!(d2.status.health, Health::Offline);
    assert_eq!(d2.status.total_failures, 5);
    assert_eq!(d2.status.total_successes, 1);
    assert_eq!(poller.get_latest("d2").await.unwrap().power_kw, 1.5);

    // d3: nothing cached, forced poll errors
    let result = poller.force_poll("d3").await;
    assert_eq!(result.status, ForcePollStatus::Error);
    assert!(result.reading.is_none());
    assert!(result.error.is_some_and(|e| !e.is_empty()));

    let overview = poller.get_all_health().await;
    assert_eq!(overview.overall, Health::Offline);
    assert_eq!(overview.devices.len(), 3);

    // every non-fallback failure reached the sink
    let counts = log.counts_by_device().await;
    assert_eq!(counts.get("d1"), None);
    assert_eq!(counts.get("d2"), Some(&5));
    assert_eq!(counts.get("d3"), Some(&1));
}

#[tokio::test]
async fn test_recovery_resets_failures() {
    let fetcher = ScriptedFetcher::default().with(
        "d1",
        vec![
            Err(refused("d1")),
            Err(refused("d1")),
            Err(refused("d1")),
            Ok(900.0),
        ],
    );
    let (poller, _) = scripted_poller(fetcher, &["d1"]);

    for _ in 0..3 {
        poller.poll_device("d1").await;
    }
    assert_eq!(
        poller.get_status("d1").await.unwrap().status.health,
        Health::Degraded
    );

    poller.poll_device("d1").await;
    let status = poller.get_status("d1").await.unwrap();
    assert_eq!(status.status.health, Health::Healthy);
    assert_eq!(status.status.consecutive_failures, 0);
    assert!(status.last_error.is_none());
    assert_eq!(status.status.uptime_percentage, 25.0);
}

#[tokio::test]
async fn test_live_poll_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/63C1A1/en_GB/check.html"))
        .and(basic_auth("owner", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHECK_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let mut device = DeviceConfig::new("d1", format!("{}/63C1A1/", server.uri()));
    device.username = Some("owner".to_string());
    device.password = Some("secret".to_string());

    let reading = HttpMeterFetcher::new().unwrap().fetch(&device).await.unwrap();
    assert_eq!(reading.power_kw, 2.0);
    assert_eq!(reading.raw_watts, 2000.0);
    assert_eq!(reading.source, ReadingSource::Live);
}

#[tokio::test]
async fn test_http_candidates_tried_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/63C1A1/en_GB/check.html"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/63C1A1/en/check.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CHECK_PAGE))
        .expect(1)
        .mount(&server)
        .await;

    let device = DeviceConfig::new("d1", format!("{}/63C1A1", server.uri()));
    let reading = HttpMeterFetcher::new().unwrap().fetch(&device).await.unwrap();
    assert_eq!(reading.power_kw, 2.0);
}

#[tokio::test]
async fn test_http_400_serves_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request"))
        .mount(&server)
        .await;

    let log = PollingErrorLog::new(10);
    let poller = MeterPoller::new(
        vec![DeviceConfig::new("d1", format!("{}/63C1A1", server.uri()))],
        PollingConfig::default(),
        Arc::new(HttpMeterFetcher::new().unwrap()),
        Arc::new(log.clone()),
    );

    let outcome = poller.poll_device("d1").await;
    assert_eq!(outcome.label(), "fallback");
    let cached = poller.get_cached("d1", None).await.unwrap();
    assert_eq!(cached.source, ReadingSource::FallbackMock);
    assert_eq!(
        poller.get_status("d1").await.unwrap().status.health,
        Health::Degraded
    );
    assert!(log.is_empty().await);
}

#[tokio::test]
async fn test_http_page_without_registers_is_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let device = DeviceConfig::new("d1", format!("{}/63C1A1", server.uri()));
    let err = HttpMeterFetcher::new().unwrap().fetch(&device).await.unwrap_err();
    assert_eq!(err.kind(), "extract");
}

/// Counts overlapping fetches and takes `work` per fetch
struct SlowFetcher {
    work: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl MeterFetcher for SlowFetcher {
    async fn fetch(&self, device: &DeviceConfig) -> Result<Reading, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.work).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Reading::live(device.id.clone(), 1000.0, Utc::now()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_never_overlaps_itself() {
    let fetcher = Arc::new(SlowFetcher {
        work: Duration::from_secs(150),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        calls: AtomicUsize::new(0),
    });
    let mut slow = device("d1");
    slow.poll_interval_secs = 60;

    let poller = MeterPoller::new(
        vec![slow],
        PollingConfig::default(),
        fetcher.clone(),
        Arc::new(PollingErrorLog::new(10)),
    );
    let scheduler = TokioScheduler::new();
    poller.start(&scheduler);

    tokio::time::sleep(Duration::from_secs(600)).await;
    scheduler.stop().await;

    assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    // 600s of 150s fetches leaves room for at most four polls
    let calls = fetcher.calls.load(Ordering::SeqCst);
    assert!((2..=5).contains(&calls), "calls = {}", calls);
    assert!(poller.get_latest("d1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_devices_poll_on_their_own_intervals() {
    let fetcher = ScriptedFetcher::default()
        .with("fast", vec![Ok(1000.0)])
        .with("slow", vec![Ok(2000.0)]);
    let mut fast = device("fast");
    fast.poll_interval_secs = 10;
    let mut slow = device("slow");
    slow.poll_interval_secs = 100;

    let log = PollingErrorLog::new(10);
    let poller = MeterPoller::new(
        vec![fast, slow],
        PollingConfig::default(),
        Arc::new(fetcher),
        Arc::new(log),
    );
    let scheduler = TokioScheduler::new();
    poller.start(&scheduler);

    tokio::time::sleep(Duration::from_secs(105)).await;
    scheduler.stop().await;

    let fast = poller.get_status("fast").await.unwrap();
    let slow = poller.get_status("slow").await.unwrap();
    // initial poll plus one per elapsed interval
    assert_eq!(fast.status.total_successes, 11);
    assert_eq!(slow.status.total_successes, 2);
}
