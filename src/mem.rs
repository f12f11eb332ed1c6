//! Memory probe — available system memory from `/proc/meminfo`.

use crate::error::{Result, SupervisorError};

/// Currently available memory in MiB, from the `MemAvailable` field.
pub fn available_mib() -> Result<i64> {
    let content = std::fs::read_to_string("/proc/meminfo")?;
    parse_available_mib(&content)
}

fn parse_available_mib(meminfo: &str) -> Result<i64> {
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            // Format: "     12345 kB"
            let kib: i64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    SupervisorError::Probe("malformed MemAvailable line in /proc/meminfo".into())
                })?;
            return Ok(kib / 1024);
        }
    }
    Err(SupervisorError::Probe("MemAvailable not found in /proc/meminfo".into()))
}
