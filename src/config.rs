//! Supervisor configuration — every option is read from `SPOTGUARD_*`
//! environment variables, the payload argv from the command line.
//!
//! An option set to the empty string falls back to its default, same as an
//! unset one: container schedulers routinely template empty values into the
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SupervisorError};

const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_SNIFF_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_EMPTY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_TERMINATION_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_LOW_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SIGNAL_GRACE_DELAY: Duration = Duration::from_secs(20);

pub const DEFAULT_IMDS_URL: &str = "http://169.254.169.254";

/// Immutable supervisor configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Payload command line, executable first.
    pub argv: Vec<String>,
    /// Payload working directory; `None` inherits the supervisor's.
    pub home: Option<PathBuf>,
    pub uid: u32,
    pub gid: u32,

    /// Interface override; empty means discover one.
    pub sniff_iface: String,
    /// Extra BPF predicate ANDed with the `dst host` clause.
    pub sniff_filter: String,
    pub sniff_timeout: Duration,
    pub sniff_interval: Duration,
    pub empty_timeout: Duration,
    pub termination_check_interval: Duration,
    pub low_memory_check_interval: Duration,
    /// MiB; 0 disables.
    pub low_memory_warning_mib: i64,
    /// MiB; 0 disables. Crossing this one is terminal.
    pub low_memory_signal_mib: i64,
    pub signal_grace_delay: Duration,

    pub scan_stdout: bool,
    pub scan_stderr: bool,
    pub wakeup_sentinel: String,
    pub log_scans: bool,
    pub log_filter: Vec<String>,

    pub persist: Option<PersistSpec>,
    /// Server identity reported in backend notifications.
    pub server: String,
    pub queue_url: String,
    pub imds_url: String,

    pub panic_on_socket_error: bool,
    pub disable_shutdown_calls: bool,
    pub debug: bool,
}

/// What to persist and where.
#[derive(Debug, Clone)]
pub struct PersistSpec {
    pub store_url: String,
    pub bucket: String,
    /// Object key; the server identity.
    pub key: String,
    /// Relative paths, persisted as a set.
    pub files: Vec<String>,
    /// Pack the set into a single archive object.
    pub zip: bool,
    /// Directory the archived paths are relative to.
    pub zip_from: PathBuf,
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env(argv: Vec<String>) -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), argv)
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F, argv: Vec<String>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if argv.is_empty() {
            return Err(SupervisorError::Config("payload argv is empty".into()));
        }

        let get = |name: &str| -> Option<String> {
            lookup(name).filter(|v| !v.trim().is_empty())
        };
        let get_or = |name: &str, alias: &str| get(name).or_else(|| get(alias));

        let files = get("SPOTGUARD_PERSIST_FILES")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let persist = if files.is_empty() {
            None
        } else {
            let bucket = get("SPOTGUARD_BUCKET").ok_or_else(|| {
                SupervisorError::Config("SPOTGUARD_BUCKET required with SPOTGUARD_PERSIST_FILES".into())
            })?;
            let key = get("SPOTGUARD_SERVER").ok_or_else(|| {
                SupervisorError::Config("SPOTGUARD_SERVER required with SPOTGUARD_PERSIST_FILES".into())
            })?;
            let store_url = get("SPOTGUARD_STORE_URL").ok_or_else(|| {
                SupervisorError::Config("SPOTGUARD_STORE_URL required with SPOTGUARD_PERSIST_FILES".into())
            })?;
            // More than one file only fits in an archive.
            let zip = parse_bool("SPOTGUARD_ZIP", get("SPOTGUARD_ZIP"))? || files.len() > 1;
            let zip_from = get("SPOTGUARD_ZIPFROM").map(PathBuf::from).unwrap_or_default();
            if zip && zip_from.as_os_str().is_empty() {
                return Err(SupervisorError::Config(
                    "SPOTGUARD_ZIPFROM required when archiving more than one file".into(),
                ));
            }
            Some(PersistSpec { store_url, bucket, key, files, zip, zip_from })
        };

        let low_memory_warning_mib =
            parse_i64("SPOTGUARD_LOW_MEMORY_WARNING_MIB", get("SPOTGUARD_LOW_MEMORY_WARNING_MIB"))?;
        let low_memory_signal_mib =
            parse_i64("SPOTGUARD_LOW_MEMORY_SIGNAL_MIB", get("SPOTGUARD_LOW_MEMORY_SIGNAL_MIB"))?;
        if low_memory_warning_mib > 0
            && low_memory_signal_mib > 0
            && low_memory_warning_mib < low_memory_signal_mib
        {
            return Err(SupervisorError::Config(format!(
                "warning threshold {low_memory_warning_mib} MiB below signal threshold {low_memory_signal_mib} MiB"
            )));
        }

        let cfg = Config {
            argv,
            home: get_or("SPOTGUARD_HOME", "SPOTGUARD_CWD").map(PathBuf::from),
            uid: parse_u32("SPOTGUARD_UID", get("SPOTGUARD_UID"))?,
            gid: parse_u32("SPOTGUARD_GID", get("SPOTGUARD_GID"))?,
            sniff_iface: get("SPOTGUARD_SNIFF_IFACE").unwrap_or_default(),
            sniff_filter: get("SPOTGUARD_SNIFF_FILTER").unwrap_or_default(),
            sniff_timeout: parse_duration(
                "SPOTGUARD_SNIFF_TIMEOUT",
                get("SPOTGUARD_SNIFF_TIMEOUT"),
                DEFAULT_SNIFF_TIMEOUT,
            )?,
            sniff_interval: parse_duration(
                "SPOTGUARD_SNIFF_INTERVAL",
                get_or("SPOTGUARD_SNIFF_INTERVAL", "SPOTGUARD_SNIFF_DELAY"),
                DEFAULT_SNIFF_INTERVAL,
            )?,
            empty_timeout: parse_duration(
                "SPOTGUARD_EMPTY_TIMEOUT",
                get("SPOTGUARD_EMPTY_TIMEOUT"),
                DEFAULT_EMPTY_TIMEOUT,
            )?,
            termination_check_interval: parse_duration(
                "SPOTGUARD_TERMINATION_CHECK_INTERVAL",
                get("SPOTGUARD_TERMINATION_CHECK_INTERVAL"),
                DEFAULT_TERMINATION_CHECK_INTERVAL,
            )?,
            low_memory_check_interval: parse_duration(
                "SPOTGUARD_LOW_MEMORY_CHECK_INTERVAL",
                get("SPOTGUARD_LOW_MEMORY_CHECK_INTERVAL"),
                DEFAULT_LOW_MEMORY_CHECK_INTERVAL,
            )?,
            low_memory_warning_mib,
            low_memory_signal_mib,
            signal_grace_delay: parse_duration(
                "SPOTGUARD_SIGNAL_GRACE_DELAY",
                get("SPOTGUARD_SIGNAL_GRACE_DELAY"),
                DEFAULT_SIGNAL_GRACE_DELAY,
            )?,
            scan_stdout: parse_bool("SPOTGUARD_SCAN_STDOUT", get("SPOTGUARD_SCAN_STDOUT"))?,
            scan_stderr: parse_bool("SPOTGUARD_SCAN_STDERR", get("SPOTGUARD_SCAN_STDERR"))?,
            wakeup_sentinel: get("SPOTGUARD_WAKEUP_SENTINEL").unwrap_or_default(),
            log_scans: parse_bool("SPOTGUARD_LOG_SCANS", get("SPOTGUARD_LOG_SCANS"))?,
            log_filter: get("SPOTGUARD_LOG_FILTER").map(|v| split_list(&v)).unwrap_or_default(),
            server: get("SPOTGUARD_SERVER").unwrap_or_default(),
            queue_url: get("SPOTGUARD_QUEUE_URL").unwrap_or_default(),
            imds_url: get("SPOTGUARD_IMDS_URL").unwrap_or_else(|| DEFAULT_IMDS_URL.into()),
            panic_on_socket_error: match get("SPOTGUARD_PANIC_ON_SOCKET_ERROR") {
                None => true,
                some => parse_bool("SPOTGUARD_PANIC_ON_SOCKET_ERROR", some)?,
            },
            disable_shutdown_calls: parse_bool(
                "SPOTGUARD_DISABLE_SHUTDOWN_CALLS",
                get("SPOTGUARD_DISABLE_SHUTDOWN_CALLS"),
            )?,
            debug: parse_bool("SPOTGUARD_DEBUG", get("SPOTGUARD_DEBUG"))?,
            persist,
        };

        for (name, value) in [
            ("SPOTGUARD_SNIFF_TIMEOUT", cfg.sniff_timeout),
            ("SPOTGUARD_SNIFF_INTERVAL", cfg.sniff_interval),
            ("SPOTGUARD_EMPTY_TIMEOUT", cfg.empty_timeout),
            ("SPOTGUARD_TERMINATION_CHECK_INTERVAL", cfg.termination_check_interval),
            ("SPOTGUARD_LOW_MEMORY_CHECK_INTERVAL", cfg.low_memory_check_interval),
            ("SPOTGUARD_SIGNAL_GRACE_DELAY", cfg.signal_grace_delay),
        ] {
            if value.is_zero() {
                return Err(SupervisorError::Config(format!("{name} must be greater than zero")));
            }
        }

        Ok(cfg)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool> {
    match value {
        None => Ok(false),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(SupervisorError::Config(format!("{name}: invalid boolean '{other}'"))),
        },
    }
}

fn parse_u32(name: &str, value: Option<String>) -> Result<u32> {
    match value {
        None => Ok(0),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| SupervisorError::Config(format!("{name}: {e}"))),
    }
}

fn parse_i64(name: &str, value: Option<String>) -> Result<i64> {
    match value {
        None => Ok(0),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| SupervisorError::Config(format!("{name}: {e}"))),
    }
}

/// Parse a duration like `500ms`, `90s`, `5m`, `1h`, or bare seconds.
fn parse_duration(name: &str, value: Option<String>, default: Duration) -> Result<Duration> {
    let Some(v) = value else { return Ok(default) };
    let v = v.trim();

    let (number, unit) = match v.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => v.split_at(idx),
        None => (v, "s"),
    };
    let number: u64 = number
        .parse()
        .map_err(|e| SupervisorError::Config(format!("{name}: {e}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        other => Err(SupervisorError::Config(format!("{name}: unknown duration unit '{other}'"))),
    }
}
