use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use spotguard::config::Config;
use spotguard::imds::ImdsClient;
use spotguard::monitor::{self, PacketSniffer, StopReason};
use spotguard::notify::Notifier;
use spotguard::payload::PayloadSupervisor;
use spotguard::sniff;
use spotguard::store::{HttpQueue, HttpStore, MessageQueue, ObjectStore};
use spotguard::Result;

#[derive(Parser)]
#[command(name = "spotguard", version, about = "Game server supervisor for preemptible hosts")]
struct Cli {
    /// Payload command line: executable followed by its arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    payload: Vec<String>,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match Config::from_env(cli.payload) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cfg.debug);

    match run(cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config) -> Result<ExitCode> {
    let cfg = Arc::new(cfg);

    // One-shot host detection: no metadata service means no preemption to
    // watch for and no host shutdown to issue.
    let imds = match ImdsClient::detect(&cfg.imds_url).await {
        Ok(Some(client)) => {
            info!("metadata service reachable, preemption watch armed");
            Some(client)
        }
        Ok(None) => {
            info!("no metadata service, preemption watch disabled");
            None
        }
        Err(e) => {
            error!(error = %e, "metadata service detection failed, preemption watch disabled");
            None
        }
    };
    let on_cloud_host = imds.is_some();

    let (iface, filter) = choose_sniff_target(&cfg);
    debug!(iface = %iface, filter = %filter, "final BPF filter");
    // The filter text is operator input; fail fast rather than at the first
    // sample.
    sniff::compile_filter(&filter)?;

    let queue: Option<Box<dyn MessageQueue>> = if cfg.queue_url.is_empty() {
        None
    } else {
        Some(Box::new(HttpQueue::new(&cfg.queue_url)?))
    };
    let notifier = Arc::new(Notifier::new(queue, cfg.server.clone()));

    let store: Option<Arc<dyn ObjectStore>> = match &cfg.persist {
        Some(persist) => Some(Arc::new(HttpStore::new(&persist.store_url)?)),
        None => None,
    };

    let mut supervisor =
        PayloadSupervisor::new(cfg.clone(), store, notifier.clone(), on_cloud_host);
    if let Err(e) = supervisor.start().await {
        error!(error = %e, "payload start failed");
        supervisor.shutdown_host().await;
        return Err(e);
    }

    let sniffer = Arc::new(PacketSniffer { iface, filter, window: cfg.sniff_timeout });

    info!("start monitoring network and signals");
    let reason = monitor::run(&cfg, sniffer, imds, notifier.clone()).await?;
    info!(?reason, "monitoring ended");

    supervisor.stop().await;

    Ok(match reason {
        StopReason::SniffError => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// Pick the interface and compose the final filter. A pinned interface is
/// honored even without an address; failing discovery falls back to the
/// `any` pseudo-interface with the operator filter verbatim.
fn choose_sniff_target(cfg: &Config) -> (String, String) {
    if !cfg.sniff_iface.is_empty() {
        let addr = match sniff::lookup_iface(&cfg.sniff_iface) {
            Ok(Some(found)) => {
                debug!(iface = %found.name, ip = %found.addr, "using pinned iface");
                Some(found.addr)
            }
            Ok(None) => None,
            Err(e) => {
                debug!(error = %e, "iface lookup failed");
                None
            }
        };
        return (cfg.sniff_iface.clone(), sniff::compose_filter(addr, &cfg.sniff_filter));
    }

    match sniff::choose_iface() {
        Ok(Some(chosen)) => {
            debug!(iface = %chosen.name, ip = %chosen.addr, "found iface");
            let filter = sniff::compose_filter(Some(chosen.addr), &cfg.sniff_filter);
            (chosen.name, filter)
        }
        Ok(None) => {
            debug!("no iface with a usable IPv4 address, using 'any'");
            (sniff::ANY_IFACE.to_string(), cfg.sniff_filter.clone())
        }
        Err(e) => {
            debug!(error = %e, "iface discovery failed, using 'any'");
            (sniff::ANY_IFACE.to_string(), cfg.sniff_filter.clone())
        }
    }
}
