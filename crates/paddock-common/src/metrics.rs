//! Metrics and capacity snapshots. Computed on demand, never cached.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Memory accounting of one container cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStat {
    /// Bytes currently charged to the cgroup.
    pub usage_in_bytes: u64,
    /// Configured ceiling, zero when unlimited.
    pub limit_in_bytes: u64,
    /// Number of processes killed by the OOM killer.
    pub oom_kills: u64,
}

/// Disk accounting of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    /// Bytes written by the container's processes.
    pub exclusive_bytes_used: u64,
    /// `exclusive_bytes_used` plus the image bytes.
    pub total_bytes_used: u64,
    /// Bytes in the writable layer broken down by owning uid.
    pub bytes_by_user: BTreeMap<u32, u64>,
}

/// Point-in-time metrics of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Memory usage.
    pub memory: MemoryStat,
    /// Disk usage.
    pub disk: DiskStat,
    /// Supervised processes still running.
    pub process_count: usize,
}

/// Leak-detection counters for the whole server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Supervision tasks currently alive (reapers and stream relays).
    pub live_workers: usize,
    /// OS threads of the server process.
    pub threads: usize,
    /// One line per live worker, oldest first.
    pub stacks: String,
}

/// Host capacity as seen by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Physical memory of the host.
    pub memory_in_bytes: u64,
    /// Size of the filesystem holding container data.
    pub disk_in_bytes: u64,
    /// Configured container ceiling.
    pub max_containers: usize,
    /// Leak-detection counters.
    pub diagnostics: Diagnostics,
}
