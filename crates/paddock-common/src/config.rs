//! Server configuration model.
//!
//! Loaded from a JSON file where every field is optional; missing fields take
//! the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{PaddockError, Result};

/// How containers are isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Namespaces, chroot, user switching, cgroups and project quotas.
    #[default]
    Linux,
    /// Processes run directly on the host. Development only.
    Host,
}

/// Root configuration for the Paddock server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddockConfig {
    /// Base directory for state, images and container layers.
    pub data_dir: PathBuf,
    /// Durable registry snapshot. Defaults to `<data_dir>/state.json`.
    pub state_file: Option<PathBuf>,
    /// Rootfs used when a spec names none. Defaults to `<data_dir>/rootfs/default`.
    pub default_rootfs: Option<PathBuf>,
    /// Isolation mode.
    pub isolation: IsolationMode,
    /// Parent cgroup of container cgroups.
    pub cgroup_root: PathBuf,
    /// First project quota id.
    pub quota_project_base: u32,
    /// IPv4 block containers are addressed from (`a.b.c.d/nn`).
    pub network_pool: String,
    /// First host port of the NetIn pool.
    pub port_pool_start: u16,
    /// Number of ports in the NetIn pool.
    pub port_pool_size: u16,
    /// Maximum number of live containers.
    pub max_containers: usize,
    /// Upper bound for any single backend call.
    pub backend_timeout_ms: u64,
    /// Upper bound for killing and awaiting processes on destroy.
    pub destroy_timeout_ms: u64,
    /// Time stream relays get to reach EOF after a process leader exits.
    pub stream_drain_ms: u64,
    /// Interval between metrics reports.
    pub metrics_interval_secs: u64,
}

impl Default for PaddockConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::SYSTEM_DATA_DIR),
            state_file: None,
            default_rootfs: None,
            isolation: IsolationMode::Linux,
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            quota_project_base: constants::DEFAULT_QUOTA_PROJECT_BASE,
            network_pool: "10.254.0.0/22".into(),
            port_pool_start: 61_001,
            port_pool_size: 4_000,
            max_containers: 256,
            backend_timeout_ms: 30_000,
            destroy_timeout_ms: 10_000,
            stream_drain_ms: 250,
            metrics_interval_secs: 30,
        }
    }
}

impl PaddockConfig {
    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.port_pool_size == 0 {
            return Err(PaddockError::Config {
                message: "port_pool_size must be positive".into(),
            });
        }
        if u32::from(self.port_pool_start) + u32::from(self.port_pool_size) > u32::from(u16::MAX) + 1 {
            return Err(PaddockError::Config {
                message: "port pool extends past port 65535".into(),
            });
        }
        if self.max_containers == 0 {
            return Err(PaddockError::Config {
                message: "max_containers must be positive".into(),
            });
        }
        if !self.network_pool.contains('/') {
            return Err(PaddockError::Config {
                message: format!("network_pool must be a CIDR block: {}", self.network_pool),
            });
        }
        Ok(())
    }

    /// Durable snapshot path.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.json"))
    }

    /// Rootfs used for specs without a source.
    #[must_use]
    pub fn default_rootfs(&self) -> PathBuf {
        self.default_rootfs
            .clone()
            .unwrap_or_else(|| self.data_dir.join("rootfs").join("default"))
    }

    /// Directory holding extracted image archives.
    #[must_use]
    pub fn image_store(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Directory holding per-container layers.
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    /// Backend call bound as a [`Duration`].
    #[must_use]
    pub const fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Destroy bound as a [`Duration`].
    #[must_use]
    pub const fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }

    /// Stream drain window as a [`Duration`].
    #[must_use]
    pub const fn stream_drain(&self) -> Duration {
        Duration::from_millis(self.stream_drain_ms)
    }
}
