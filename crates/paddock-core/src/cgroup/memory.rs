//! Memory resource control via cgroups v2.
//!
//! Manages `memory.max` and `memory.swap.max`, and reads `memory.current`
//! and `memory.events`.

use std::path::Path;

use paddock_common::error::{PaddockError, Result};
use paddock_common::metrics::MemoryStat;

use super::write_control;

/// Sets the hard memory limit for a cgroup. Zero writes `max`.
///
/// # Errors
///
/// Returns an error if writing to `memory.max` fails.
pub fn set_memory_max(cgroup_path: &Path, bytes: u64) -> Result<()> {
    let value = if bytes == 0 {
        "max".to_owned()
    } else {
        bytes.to_string()
    };
    write_control(&cgroup_path.join("memory.max"), &value)?;
    tracing::debug!(path = %cgroup_path.display(), bytes, "memory max set");
    Ok(())
}

/// Disables swap so that exceeding `memory.max` reaches the OOM killer.
///
/// Kernels without swap accounting have no `memory.swap.max`; that is fine.
///
/// # Errors
///
/// Returns an error if the file exists but rejects the write.
pub fn disable_swap(cgroup_path: &Path) -> Result<()> {
    let file = cgroup_path.join("memory.swap.max");
    if file.exists() {
        write_control(&file, "0")?;
    }
    Ok(())
}

/// Reads usage, ceiling and OOM kill count. Missing files read as zero.
///
/// # Errors
///
/// Returns an error if a present file cannot be read.
pub fn read_stat(cgroup_path: &Path) -> Result<MemoryStat> {
    let current = read_optional(&cgroup_path.join("memory.current"))?;
    let max = read_optional(&cgroup_path.join("memory.max"))?;
    let events = read_optional(&cgroup_path.join("memory.events"))?;
    Ok(MemoryStat {
        usage_in_bytes: current.trim().parse().unwrap_or(0),
        limit_in_bytes: parse_max(&max),
        oom_kills: parse_event(&events, "oom_kill"),
    })
}

fn read_optional(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// `max` and empty both mean no ceiling.
fn parse_max(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

/// Extracts one counter from a flat-keyed file such as `memory.events`.
fn parse_event(raw: &str, key: &str) -> u64 {
    raw.lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}
