//! Control loop — multiplexes the evidence sources and decides when the
//! instance is done.
//!
//! Single cooperative loop over: the sniffer result channel, the sniff /
//! preemption / memory tickers, the inactivity deadline, and operator
//! signals. Only observed activity re-arms the deadline; ticker churn never
//! grants extra time.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Result;
use crate::imds::ImdsClient;
use crate::mem;
use crate::notify::{EventKind, Notifier};
use crate::sniff;

/// Why the loop decided to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No activity for the whole inactivity timeout.
    Empty,
    /// Operator SIGTERM/SIGINT.
    Signal,
    /// The host announced imminent termination.
    Preempted,
    /// Available memory crossed the signal threshold.
    LowMemory,
    /// Sampling failed and the configuration promotes that to fatal.
    SniffError,
}

/// Source of network-activity evidence. Blocking; sampled off the loop.
pub trait ActivitySource: Send + Sync {
    fn sample(&self) -> Result<bool>;
}

/// The production source: one raw-socket sample per call.
pub struct PacketSniffer {
    pub iface: String,
    pub filter: String,
    pub window: Duration,
}

impl ActivitySource for PacketSniffer {
    fn sample(&self) -> Result<bool> {
        sniff::sample(&self.iface, &self.filter, self.window)
    }
}

/// Run the loop until a terminal event. The caller owns the stop sequence.
pub async fn run(
    cfg: &Config,
    source: Arc<dyn ActivitySource>,
    mut imds: Option<ImdsClient>,
    notifier: Arc<Notifier>,
) -> Result<StopReason> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let (sample_tx, mut sample_rx) = mpsc::channel::<Result<bool>>(1);

    let mut sniff_tick = interval(cfg.sniff_interval);
    sniff_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut preempt_tick = interval(cfg.termination_check_interval);
    let mut memory_tick = interval(cfg.low_memory_check_interval);

    let preempt_enabled = imds.is_some();
    let memory_enabled = cfg.low_memory_warning_mib > 0 || cfg.low_memory_signal_mib > 0;
    let mut imds_error_notified = false;

    let empty = sleep(cfg.empty_timeout);
    tokio::pin!(empty);

    // Lockstep handshake with the sampling worker: a tick only spawns a new
    // one once the previous result has been consumed.
    let mut sample_pending = false;

    loop {
        tokio::select! {
            result = sample_rx.recv() => {
                sample_pending = false;
                match result {
                    Some(Ok(true)) => {
                        debug!("network activity detected");
                        empty.as_mut().reset(Instant::now() + cfg.empty_timeout);
                    }
                    Some(Ok(false)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "error polling network");
                        if cfg.panic_on_socket_error {
                            notifier.notify(
                                EventKind::Error,
                                "Network polling failed, shutting down",
                            ).await;
                            return Ok(StopReason::SniffError);
                        }
                    }
                    None => {}
                }
            }

            _ = sniff_tick.tick() => {
                if !sample_pending {
                    sample_pending = true;
                    let source = source.clone();
                    let tx = sample_tx.clone();
                    tokio::task::spawn_blocking(move || {
                        let _ = tx.blocking_send(source.sample());
                    });
                }
            }

            _ = preempt_tick.tick(), if preempt_enabled => {
                if let Some(client) = imds.as_mut() {
                    match client.termination_notified().await {
                        Ok(true) => {
                            info!("host preemption notified");
                            notifier.notify(
                                EventKind::Warning,
                                "Host preemption notified, shutting down",
                            ).await;
                            return Ok(StopReason::Preempted);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!(error = %e, "error checking preemption notice");
                            if !imds_error_notified {
                                imds_error_notified = true;
                                notifier.notify(
                                    EventKind::Error,
                                    "Error worth checking in the instance",
                                ).await;
                            }
                        }
                    }
                }
            }

            _ = memory_tick.tick(), if memory_enabled => {
                match mem::available_mib() {
                    Ok(available) => {
                        match low_memory_action(
                            available,
                            cfg.low_memory_warning_mib,
                            cfg.low_memory_signal_mib,
                        ) {
                            Some(LowMemory { threshold, fatal: true }) => {
                                info!(available, threshold, "available memory below signal threshold");
                                notifier.notify(
                                    EventKind::Warning,
                                    &format!("Available memory below {threshold} MiB, shutting down"),
                                ).await;
                                return Ok(StopReason::LowMemory);
                            }
                            Some(LowMemory { threshold, fatal: false }) => {
                                info!(available, threshold, "available memory below warning threshold");
                                notifier.notify(
                                    EventKind::Warning,
                                    &format!("Available memory below {threshold} MiB"),
                                ).await;
                            }
                            None => {}
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "error reading available memory");
                        notifier.notify(
                            EventKind::Error,
                            "Error worth checking in the instance",
                        ).await;
                    }
                }
            }

            _ = &mut empty => {
                info!("server empty for too long");
                notifier.notify(
                    EventKind::Info,
                    "Server empty for too long, shutting down",
                ).await;
                return Ok(StopReason::Empty);
            }

            _ = sigterm.recv() => {
                info!("received SIGTERM");
                notifier.notify(EventKind::Warning, "Received stop signal, shutting down").await;
                return Ok(StopReason::Signal);
            }

            _ = sigint.recv() => {
                info!("received SIGINT");
                notifier.notify(EventKind::Warning, "Received stop signal, shutting down").await;
                return Ok(StopReason::Signal);
            }
        }
    }
}

struct LowMemory {
    threshold: i64,
    fatal: bool,
}

/// Threshold rule: below the signal threshold is terminal, below the
/// warning threshold is advisory, a zero threshold is disabled.
fn low_memory_action(available: i64, warning_mib: i64, signal_mib: i64) -> Option<LowMemory> {
    if signal_mib > 0 && available < signal_mib {
        return Some(LowMemory { threshold: signal_mib, fatal: true });
    }
    if warning_mib > 0 && available < warning_mib {
        return Some(LowMemory { threshold: warning_mib, fatal: false });
    }
    None
}
