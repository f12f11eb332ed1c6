//! Payload supervisor — owns the game-server process from savegame restore
//! through the stop sequence.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::config::{Config, PersistSpec};
use crate::error::{Result, SupervisorError};
use crate::notify::{EventKind, Notifier};
use crate::scan::{self, ScanConfig};
use crate::store::ObjectStore;

/// Settle time between payload exit and the savegame archive, letting the
/// filesystem quiesce.
const FS_QUIESCE_DELAY: Duration = Duration::from_secs(1);

pub struct PayloadSupervisor {
    cfg: Arc<Config>,
    store: Option<Arc<dyn ObjectStore>>,
    notifier: Arc<Notifier>,
    on_cloud_host: bool,
    child: Option<Child>,
    started: Option<Instant>,
}

impl PayloadSupervisor {
    pub fn new(
        cfg: Arc<Config>,
        store: Option<Arc<dyn ObjectStore>>,
        notifier: Arc<Notifier>,
        on_cloud_host: bool,
    ) -> Self {
        Self { cfg, store, notifier, on_cloud_host, child: None, started: None }
    }

    /// Restore the savegame if configured, then spawn the payload and attach
    /// the output scanner to any piped stream.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(SupervisorError::Payload("payload already running".into()));
        }
        if let Some(persist) = self.cfg.persist.clone() {
            info!("restoring savegame from the object store");
            match self.retrieve_data(&persist).await {
                Ok(()) => {
                    info!("savegame restore done");
                    self.notifier.notify(EventKind::Info, "Savegame restored from storage").await;
                }
                Err(e) => {
                    error!(error = %e, "savegame restore failed");
                    self.notifier.notify(EventKind::Error, "Savegame was not restored").await;
                }
            }
        }

        let cfg = &self.cfg;
        debug!(argv = ?cfg.argv, "payload initialisation");
        let mut cmd = Command::new(&cfg.argv[0]);
        cmd.args(&cfg.argv[1..]);
        if let Some(home) = &cfg.home {
            debug!(cwd = %home.display(), "set payload working directory");
            cmd.current_dir(home);
        }
        if cfg.uid != 0 || cfg.gid != 0 {
            debug!(uid = cfg.uid, gid = cfg.gid, "set payload credentials");
            cmd.uid(cfg.uid);
            cmd.gid(cfg.gid);
        }
        if cfg.scan_stdout {
            cmd.stdout(Stdio::piped());
        }
        if cfg.scan_stderr {
            cmd.stderr(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Payload(format!("spawn {}: {e}", cfg.argv[0])))?;
        let started = Instant::now();

        let mut streams: Vec<Box<dyn AsyncRead + Send + Unpin>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(Box::new(stderr));
        }
        if !streams.is_empty() {
            info!(
                sentinel = %cfg.wakeup_sentinel,
                log_scans = cfg.log_scans,
                "output scan enabled"
            );
            scan::attach(
                streams,
                ScanConfig {
                    log_scans: cfg.log_scans,
                    log_filter: cfg.log_filter.clone(),
                    sentinel: cfg.wakeup_sentinel.clone(),
                },
                started,
                self.notifier.clone(),
            );
        }

        info!("process started");
        self.child = Some(child);
        self.started = Some(started);
        Ok(())
    }

    /// The stop sequence: grace delay → SIGTERM → wait → quiesce → archive
    /// → host shutdown.
    pub async fn stop(&mut self) {
        // Give backend notifications time to reach users before the world
        // goes away.
        tokio::time::sleep(self.cfg.signal_grace_delay).await;

        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                debug!(pid, "sending SIGTERM to payload");
                if let Err(e) = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                ) {
                    warn!(pid, error = %e, "failed to signal payload");
                }
            }
            let uptime_secs = self.started.map(|t| t.elapsed().as_secs());
            match child.wait().await {
                Ok(status) => info!(%status, uptime_secs, "payload exited"),
                Err(e) => error!(error = %e, "wait on payload failed"),
            }
        }

        tokio::time::sleep(FS_QUIESCE_DELAY).await;

        if let Some(persist) = self.cfg.persist.clone() {
            info!("exporting savegame to the object store");
            match self.archive_data(&persist).await {
                Ok(()) => {
                    self.notifier.notify(EventKind::Info, "Savegame exported to storage").await;
                }
                Err(e) => {
                    error!(error = %e, "savegame export failed");
                    self.notifier.notify(EventKind::Error, "Error when exporting savegame").await;
                }
            }
        }

        self.shutdown_host().await;
        info!("goodbye !");
    }

    /// Invoke the host shutdown command, unless disabled or not on a cloud
    /// host.
    pub async fn shutdown_host(&self) {
        if self.cfg.disable_shutdown_calls || !self.on_cloud_host {
            return;
        }
        info!("issuing host shutdown");
        match Command::new("shutdown").arg("now").status().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!(%status, "shutdown command failed");
                self.notifier
                    .notify(EventKind::Error, "Error worth checking in the instance")
                    .await;
            }
            Err(e) => {
                error!(error = %e, "shutdown command failed to run");
                self.notifier
                    .notify(EventKind::Error, "Error worth checking in the instance")
                    .await;
            }
        }
    }

    async fn retrieve_data(&self, persist: &PersistSpec) -> Result<()> {
        let store = self.require_store()?;
        let blob = store.get(&persist.bucket, &persist.key).await?;

        if persist.zip {
            let root = persist.zip_from.clone();
            let (uid, gid) = (self.cfg.uid, self.cfg.gid);
            tokio::task::spawn_blocking(move || archive::unpack(&blob, &root, uid, gid))
                .await
                .map_err(|e| SupervisorError::Store(format!("unpack task: {e}")))?
        } else {
            let dst = std::path::PathBuf::from(&persist.files[0]);
            if let Some(parent) = dst.parent() {
                archive::mkdir_all_chown(parent, self.cfg.uid, self.cfg.gid)?;
            }
            tokio::fs::write(&dst, &blob).await?;
            archive::chown_path(&dst, self.cfg.uid, self.cfg.gid);
            Ok(())
        }
    }

    async fn archive_data(&self, persist: &PersistSpec) -> Result<()> {
        let store = self.require_store()?;
        let blob = if persist.zip {
            let root = persist.zip_from.clone();
            let files = persist.files.clone();
            tokio::task::spawn_blocking(move || archive::pack(&root, &files))
                .await
                .map_err(|e| SupervisorError::Store(format!("pack task: {e}")))??
        } else {
            tokio::fs::read(&persist.files[0]).await?
        };
        store.put(&persist.bucket, &persist.key, blob).await
    }

    fn require_store(&self) -> Result<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| SupervisorError::Store("no object store configured".into()))
    }
}
