//! Resource limiting: memory through the container cgroup, disk through a
//! quota on the writable layer.
//!
//! Disk ceilings come in two scopes. An exclusive ceiling counts only what
//! the container writes. A total ceiling also counts the image, so the
//! quota is the ceiling minus the image size; an image larger than the
//! ceiling is rejected before anything is created. A quota of zero would
//! mean unlimited to the filesystem, so a fully consumed ceiling becomes
//! the smallest enforceable one instead.
//!
//! Limits recorded here change only after the backend accepted them.

use std::path::PathBuf;
use std::sync::Arc;

use paddock_common::constants::QUOTA_BLOCK_SIZE;
use paddock_common::error::{PaddockError, Result};
use paddock_common::metrics::{DiskStat, MemoryStat};
use paddock_common::types::{ContainerHandle, DiskLimitScope, DiskLimits, Limits, MemoryLimits};
use paddock_core::cgroup::CgroupBackend;
use paddock_core::quota::{ByteLimits, QuotaBackend, QuotaId, usage};
use paddock_image::provider::ProvisionedRootfs;

/// Translates caller disk limits into quota ceilings for the writable layer.
///
/// # Errors
///
/// Returns [`PaddockError::QuotaExceeded`] if a total hard ceiling is below
/// the image size.
pub fn effective_quota(limits: &DiskLimits, image_bytes: u64) -> Result<ByteLimits> {
    match limits.scope {
        DiskLimitScope::Exclusive => Ok(ByteLimits {
            soft: limits.byte_soft,
            hard: limits.byte_hard,
        }),
        DiskLimitScope::Total => {
            if limits.byte_hard != 0 && image_bytes > limits.byte_hard {
                return Err(PaddockError::QuotaExceeded);
            }
            Ok(ByteLimits {
                soft: minus_image(limits.byte_soft, image_bytes),
                hard: minus_image(limits.byte_hard, image_bytes),
            })
        }
    }
}

fn minus_image(ceiling: u64, image_bytes: u64) -> u64 {
    if ceiling == 0 {
        return 0;
    }
    ceiling.saturating_sub(image_bytes).max(QUOTA_BLOCK_SIZE)
}

/// Limits and accounting handles of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterState {
    /// Limits currently in effect.
    pub limits: Limits,
    /// Quota id of the writable layer.
    pub quota: QuotaId,
    /// Writable layer charged to `quota`.
    pub writable: PathBuf,
    /// Image bytes counted by total-scope ceilings.
    pub image_bytes: u64,
}

/// Applies and reads container limits.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    cgroups: Arc<dyn CgroupBackend>,
    quota: Arc<dyn QuotaBackend>,
}

impl ResourceLimiter {
    /// Creates a limiter over the given backends.
    #[must_use]
    pub fn new(cgroups: Arc<dyn CgroupBackend>, quota: Arc<dyn QuotaBackend>) -> Self {
        Self { cgroups, quota }
    }

    /// Cgroup backend, for process placement and kills.
    #[must_use]
    pub fn cgroups(&self) -> &Arc<dyn CgroupBackend> {
        &self.cgroups
    }

    /// Sets up the cgroup and quota of a new container.
    ///
    /// Either everything is set up or nothing is left behind.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::QuotaExceeded`] before touching any backend
    /// if the image does not fit a total ceiling, otherwise the first
    /// backend error.
    pub fn install(&self, handle: &ContainerHandle, limits: Limits, rootfs: &ProvisionedRootfs) -> Result<LimiterState> {
        let disk = effective_quota(&limits.disk, rootfs.image_bytes)?;

        self.cgroups.create(handle)?;
        let cgroup = scopeguard::guard((), |()| {
            if let Err(e) = self.cgroups.destroy(handle) {
                tracing::warn!(%handle, error = %e, "cgroup rollback failed");
            }
        });
        self.cgroups.set_memory_limit(handle, limits.memory.limit_in_bytes)?;

        let quota = self.quota.assign(&rootfs.quota_root)?;
        let assigned = scopeguard::guard((), |()| {
            if let Err(e) = self.quota.release(quota) {
                tracing::warn!(%handle, %quota, error = %e, "quota rollback failed");
            }
        });
        self.quota.set_limits(quota, disk)?;

        scopeguard::ScopeGuard::into_inner(assigned);
        scopeguard::ScopeGuard::into_inner(cgroup);
        tracing::info!(
            %handle,
            %quota,
            memory = limits.memory.limit_in_bytes,
            disk_hard = disk.hard,
            scope = %limits.disk.scope,
            "limits installed"
        );
        Ok(LimiterState {
            limits,
            quota,
            writable: rootfs.writable.clone(),
            image_bytes: rootfs.image_bytes,
        })
    }

    /// Replaces the memory ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::LimitApplication`] if the cgroup rejects it;
    /// the previous ceiling stays in effect.
    pub fn set_memory(&self, handle: &ContainerHandle, state: &mut LimiterState, limits: MemoryLimits) -> Result<()> {
        self.cgroups
            .set_memory_limit(handle, limits.limit_in_bytes)
            .map_err(|e| PaddockError::LimitApplication { message: e.to_string() })?;
        state.limits.memory = limits;
        tracing::info!(%handle, bytes = limits.limit_in_bytes, "memory limit updated");
        Ok(())
    }

    /// Replaces the disk ceilings. The scope cannot change.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::LimitApplication`] if the scope differs, the
    /// ceiling is below the image size, or the backend rejects it; the
    /// previous ceilings stay in effect.
    pub fn set_disk(&self, handle: &ContainerHandle, state: &mut LimiterState, limits: DiskLimits) -> Result<()> {
        if limits.scope != state.limits.disk.scope {
            return Err(PaddockError::LimitApplication {
                message: format!(
                    "disk limit scope is fixed at creation ({}), got {}",
                    state.limits.disk.scope, limits.scope
                ),
            });
        }
        let quota = effective_quota(&limits, state.image_bytes).map_err(|e| PaddockError::LimitApplication {
            message: e.to_string(),
        })?;
        self.quota
            .set_limits(state.quota, quota)
            .map_err(|e| PaddockError::LimitApplication { message: e.to_string() })?;
        state.limits.disk = limits;
        tracing::info!(%handle, hard = limits.byte_hard, soft = limits.byte_soft, "disk limit updated");
        Ok(())
    }

    /// Memory accounting of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be read.
    pub fn memory_stat(&self, handle: &ContainerHandle) -> Result<MemoryStat> {
        self.cgroups.memory_stat(handle)
    }

    /// Disk accounting of a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the quota usage or the writable layer cannot be read.
    pub fn disk_stat(&self, state: &LimiterState) -> Result<DiskStat> {
        let exclusive = self.quota.usage(state.quota)?;
        Ok(DiskStat {
            exclusive_bytes_used: exclusive,
            total_bytes_used: exclusive + state.image_bytes,
            bytes_by_user: usage::bytes_by_owner(&state.writable)?,
        })
    }

    /// Kills every process in the container cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup refuses the kill.
    pub fn kill_all(&self, handle: &ContainerHandle) -> Result<()> {
        self.cgroups.kill_all(handle)
    }

    /// Removes the cgroup and releases the quota. Both are attempted; the
    /// first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first backend error.
    pub fn release(&self, handle: &ContainerHandle, quota: Option<QuotaId>) -> Result<()> {
        let cgroup = self.cgroups.destroy(handle);
        let quota = quota.map_or(Ok(()), |id| self.quota.release(id));
        cgroup.and(quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn total(hard: u64) -> DiskLimits {
        DiskLimits {
            byte_soft: 0,
            byte_hard: hard,
            scope: DiskLimitScope::Total,
        }
    }

    #[test]
    fn total_ceiling_subtracts_the_image() {
        let quota = effective_quota(&total(10 * MIB), 4 * MIB).unwrap();
        assert_eq!(quota.hard, 6 * MIB);
        assert_eq!(quota.soft, 0);
    }

    #[test]
    fn image_larger_than_total_ceiling_is_rejected() {
        let err = effective_quota(&total(MIB), 2 * MIB).unwrap_err();
        assert!(matches!(err, PaddockError::QuotaExceeded));
    }

    #[test]
    fn exhausted_total_ceiling_keeps_one_block() {
        let quota = effective_quota(&total(MIB), MIB).unwrap();
        assert_eq!(quota.hard, QUOTA_BLOCK_SIZE);
    }

    #[test]
    fn exclusive_ceiling_ignores_the_image() {
        let limits = DiskLimits {
            byte_soft: MIB,
            byte_hard: 2 * MIB,
            scope: DiskLimitScope::Exclusive,
        };
        let quota = effective_quota(&limits, 50 * MIB).unwrap();
        assert_eq!(quota, ByteLimits { soft: MIB, hard: 2 * MIB });
    }

    #[test]
    fn zero_means_unlimited_in_both_scopes() {
        assert_eq!(effective_quota(&total(0), 5 * MIB).unwrap(), ByteLimits::default());
        let exclusive = DiskLimits {
            scope: DiskLimitScope::Exclusive,
            ..DiskLimits::default()
        };
        assert_eq!(effective_quota(&exclusive, 5 * MIB).unwrap(), ByteLimits::default());
    }
}
