//! Signal handling gets its own test binary: raising SIGTERM is process-wide.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use spotguard::config::Config;
use spotguard::error::Result;
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

struct Silent;

impl ActivitySource for Silent {
    fn sample(&self) -> Result<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn sigterm_ends_the_loop() {
    let mut cfg = Config::from_lookup(|_| None, vec!["/bin/true".into()]).unwrap();
    cfg.sniff_interval = Duration::from_millis(50);
    cfg.empty_timeout = Duration::from_secs(30);

    let sent = Arc::new(Mutex::new(Vec::new()));
    let notifier = Arc::new(Notifier::new(
        Some(Box::new(RecordingQueue(sent.clone()))),
        "srv-1",
    ));

    let loop_task = tokio::spawn(async move {
        monitor::run(&cfg, Arc::new(Silent), None, notifier).await
    });

    // Let the loop install its signal handlers first.
    tokio::time::sleep(Duration::from_millis(100)).await;
    nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGTERM).unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), loop_task)
        .await
        .expect("loop did not stop on SIGTERM")
        .unwrap()
        .unwrap();
    assert_eq!(reason, StopReason::Signal);

    let bodies = sent.lock().unwrap();
    let value: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(value["Args"]["Action"], "warning");
    assert!(value["Args"]["Message"]
        .as_str()
        .unwrap()
        .contains("stop signal"));
}
