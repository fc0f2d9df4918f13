//! Cgroup backend for hosts without a delegated cgroup tree.
//!
//! Ceilings are remembered and reported back but never enforced, and
//! processes are not placed anywhere. Used with host isolation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use paddock_common::error::Result;
use paddock_common::metrics::MemoryStat;
use paddock_common::types::ContainerHandle;

use super::CgroupBackend;

/// Records memory ceilings without a kernel cgroup behind them.
#[derive(Debug, Default)]
pub struct Unconfined {
    limits: Mutex<HashMap<ContainerHandle, u64>>,
}

impl Unconfined {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CgroupBackend for Unconfined {
    fn create(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), 0);
        Ok(())
    }

    fn set_memory_limit(&self, handle: &ContainerHandle, bytes: u64) -> Result<()> {
        let _ = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), bytes);
        Ok(())
    }

    fn memory_stat(&self, handle: &ContainerHandle) -> Result<MemoryStat> {
        let limit = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .copied()
            .unwrap_or(0);
        Ok(MemoryStat {
            limit_in_bytes: limit,
            ..MemoryStat::default()
        })
    }

    fn procs_file(&self, _handle: &ContainerHandle) -> Option<PathBuf> {
        None
    }

    fn kill_all(&self, _handle: &ContainerHandle) -> Result<()> {
        Ok(())
    }

    fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        Ok(())
    }
}
