use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use httpmock::prelude::*;

use spotguard::config::Config;
use spotguard::error::{Result, SupervisorError};
use spotguard::imds::ImdsClient;
use spotguard::monitor::{self, ActivitySource, StopReason};
use spotguard::notify::Notifier;
use spotguard::store::MessageQueue;

struct RecordingQueue(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl MessageQueue for RecordingQueue {
    async fn enqueue(&self, body: String) -> Result<()> {
        self.0.lock().unwrap().push(body);
        Ok(())
    }
}

fn recording_notifier() -> (Arc<Notifier>, Arc<Mutex<Vec<String>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(Notifier::new(
        Some(Box::new(RecordingQueue(sent.clone()))),
        "srv-1",
    ));
    (notifier, sent)
}

fn actions(sent: &Arc<Mutex<Vec<String>>>) -> Vec<(String, String)> {
    sent.lock()
        .unwrap()
        .iter()
        .map(|body| {
            let value: serde_json::Value = serde_json::from_str(body).unwrap();
            (
                value["Args"]["Action"].as_str().unwrap().to_string(),
                value["Args"]["Message"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

/// Scripted activity source: pops queued samples, then keeps returning the
/// fallback.
struct Scripted {
    samples: Mutex<VecDeque<Result<bool>>>,
    fallback: bool,
}

impl Scripted {
    fn new(samples: Vec<Result<bool>>, fallback: bool) -> Arc<Self> {
        Arc::new(Self { samples: Mutex::new(samples.into()), fallback })
    }
}

impl ActivitySource for Scripted {
    fn sample(&self) -> Result<bool> {
        self.samples
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(self.fallback))
    }
}

/// Tight cadences so the loop settles within milliseconds.
fn fast_config() -> Config {
    let mut cfg = Config::from_lookup(|_| None, vec!["/bin/true".into()]).unwrap();
    cfg.sniff_interval = Duration::from_millis(25);
    cfg.sniff_timeout = Duration::from_millis(5);
    cfg.empty_timeout = Duration::from_millis(150);
    cfg.termination_check_interval = Duration::from_millis(20);
    cfg
}

// ---------------------------------------------------------------------------
// Test 1: sustained silence exits through the empty branch
// ---------------------------------------------------------------------------
#[tokio::test]
async fn silence_ends_in_empty() {
    let cfg = fast_config();
    let (notifier, sent) = recording_notifier();
    let start = Instant::now();

    let reason = monitor::run(&cfg, Scripted::new(vec![], false), None, notifier)
        .await
        .unwrap();

    assert_eq!(reason, StopReason::Empty);
    assert!(start.elapsed() >= cfg.empty_timeout);
    assert!(actions(&sent)
        .iter()
        .any(|(kind, msg)| kind == "info" && msg.contains("empty")));
}

// ---------------------------------------------------------------------------
// Test 2: activity re-arms the inactivity deadline
// ---------------------------------------------------------------------------
#[tokio::test]
async fn activity_extends_life() {
    let cfg = fast_config();
    let (notifier, _sent) = recording_notifier();
    let start = Instant::now();

    // Four positive samples at a 25ms cadence, then silence: the deadline
    // last re-arms around t=75ms, so the loop outlives a single timeout.
    let source = Scripted::new(vec![Ok(true), Ok(true), Ok(true), Ok(true)], false);
    let reason = monitor::run(&cfg, source, None, notifier).await.unwrap();

    assert_eq!(reason, StopReason::Empty);
    assert!(start.elapsed() >= cfg.empty_timeout + Duration::from_millis(50));
}

// ---------------------------------------------------------------------------
// Test 3: a sample error is fatal when configured
// ---------------------------------------------------------------------------
#[tokio::test]
async fn sample_error_is_fatal_when_configured() {
    let cfg = fast_config();
    let (notifier, _sent) = recording_notifier();

    let source = Scripted::new(vec![Err(SupervisorError::Sniff("socket: EPERM".into()))], false);
    let reason = monitor::run(&cfg, source, None, notifier).await.unwrap();

    assert_eq!(reason, StopReason::SniffError);
}

// ---------------------------------------------------------------------------
// Test 4: a sample error is logged and survived otherwise
// ---------------------------------------------------------------------------
#[tokio::test]
async fn sample_error_is_survivable_when_disabled() {
    let mut cfg = fast_config();
    cfg.panic_on_socket_error = false;
    let (notifier, _sent) = recording_notifier();

    let source = Scripted::new(vec![Err(SupervisorError::Sniff("socket: EPERM".into()))], false);
    let reason = monitor::run(&cfg, source, None, notifier).await.unwrap();

    assert_eq!(reason, StopReason::Empty);
}

// ---------------------------------------------------------------------------
// Test 5: a preemption notice ends the loop with a warning
// ---------------------------------------------------------------------------
#[tokio::test]
async fn preemption_ends_the_loop() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(PUT).path("/latest/api/token");
        then.status(200).body("tok-1");
    });
    server.mock(|when, then| {
        when.method(GET).path("/latest/meta-data/spot/termination-time");
        then.status(200).body("2026-08-02T12:34:56Z");
    });

    let imds = ImdsClient::detect(&server.base_url()).await.unwrap();
    assert!(imds.is_some());

    let mut cfg = fast_config();
    cfg.empty_timeout = Duration::from_secs(30);
    let (notifier, sent) = recording_notifier();

    let reason = monitor::run(&cfg, Scripted::new(vec![], false), imds, notifier)
        .await
        .unwrap();

    assert_eq!(reason, StopReason::Preempted);
    assert!(actions(&sent)
        .iter()
        .any(|(kind, msg)| kind == "warning" && msg.contains("preemption")));
}

// ---------------------------------------------------------------------------
// Test 6: probe errors notify once and the loop keeps going
// ---------------------------------------------------------------------------
#[tokio::test]
async fn probe_errors_are_survivable() {
    let server = MockServer::start();
    let token_mock = server.mock(|when, then| {
        when.method(PUT).path("/latest/api/token");
        then.status(200).body("tok-1");
    });
    server.mock(|when, then| {
        when.method(GET).path("/latest/meta-data/spot/termination-time");
        then.status(401);
    });

    let imds = ImdsClient::detect(&server.base_url()).await.unwrap();
    token_mock.assert();

    let cfg = fast_config();
    let (notifier, sent) = recording_notifier();

    let reason = monitor::run(&cfg, Scripted::new(vec![], false), imds, notifier)
        .await
        .unwrap();

    // Every check 401s twice and errors out, but the loop still ends empty.
    assert_eq!(reason, StopReason::Empty);
    let errors = actions(&sent)
        .iter()
        .filter(|(kind, _)| kind == "error")
        .count();
    assert_eq!(errors, 1);
}
