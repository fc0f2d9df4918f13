//! System-wide constants and default paths.

use std::path::PathBuf;

/// Default base directory for Paddock data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/paddock";

/// Returns the data directory: `/var/lib/paddock` when writable, otherwise
/// `$HOME/.paddock`.
pub fn resolve_data_dir() -> PathBuf {
    let system = PathBuf::from(SYSTEM_DATA_DIR);
    if std::fs::create_dir_all(&system).is_ok() {
        return system;
    }
    std::env::var("HOME").map_or(system, |home| PathBuf::from(home).join(".paddock"))
}

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Parent cgroup of every container cgroup.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/paddock";

/// `PATH` given to processes whose environment lacks one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Name of the host bridge containers attach to.
pub const BRIDGE_NAME: &str = "paddock0";

/// Prefix of every iptables chain the server owns.
pub const CHAIN_PREFIX: &str = "PADDOCK";

/// First project quota id handed out to containers.
pub const DEFAULT_QUOTA_PROJECT_BASE: u32 = 70_000;

/// Block size used by project quota accounting.
pub const QUOTA_BLOCK_SIZE: u64 = 512;

/// Application name used in logs and state files.
pub const APP_NAME: &str = "paddock";
