//! Output scanner — line-oriented readers over the payload's piped streams.
//!
//! Lines fan into two bounded queues with independent consumers so a slow
//! log sink backpressures the producers without delaying the ready
//! notification.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::notify::{EventKind, Notifier};

const CHANNEL_CAPACITY: usize = 60;

/// What to do with scanned lines.
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// Forward lines to the log sink.
    pub log_scans: bool,
    /// When non-empty, only lines containing one of these substrings are
    /// forwarded.
    pub log_filter: Vec<String>,
    /// Substring marking the payload as ready; empty disables.
    pub sentinel: String,
}

/// Attach scanners to the payload's output streams. Returns the spawned
/// producer and consumer tasks; they end when the streams close.
pub fn attach<R>(
    streams: Vec<R>,
    cfg: ScanConfig,
    process_start: Instant,
    notifier: Arc<Notifier>,
) -> Vec<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (log_tx, mut log_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (ready_tx, mut ready_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

    let mut tasks = Vec::new();
    for stream in streams {
        let log_tx = log_tx.clone();
        let ready_tx = ready_tx.clone();
        let cfg = cfg.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end().to_string();
                if cfg.log_scans && passes_filter(&line, &cfg.log_filter) {
                    if log_tx.send(line.clone()).await.is_err() {
                        break;
                    }
                }
                if !cfg.sentinel.is_empty()
                    && line.contains(&cfg.sentinel)
                    && ready_tx.send(line).await.is_err()
                {
                    break;
                }
            }
        }));
    }
    // Consumers end once every producer clone is gone.
    drop(log_tx);
    drop(ready_tx);

    tasks.push(tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            info!(target: "payload", "{line}");
        }
    }));
    tasks.push(tokio::spawn(async move {
        while let Some(line) = ready_rx.recv().await {
            let elapsed = process_start.elapsed();
            info!(sentinel = %line, "sentinel found");
            notifier
                .notify(
                    EventKind::ServerReady,
                    &format!("The server is ready ! (started in {:.2}s)", elapsed.as_secs_f64()),
                )
                .await;
        }
    }));
    tasks
}

fn passes_filter(line: &str, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|word| line.contains(word.as_str()))
}
