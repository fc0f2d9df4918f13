//! Per-subtree disk accounting and enforcement.
//!
//! A container's writable layer is tagged with its own quota id; every
//! byte written beneath it, by any user, is charged to that id and capped by
//! the id's limits. The Linux backend uses filesystem project quotas
//! (XFS, or ext4 mounted with `prjquota`). [`ScanQuota`] only accounts,
//! for hosts without quota support.

pub mod project;
pub mod scan;
pub mod usage;

use std::fmt;
use std::path::Path;

use paddock_common::error::Result;

pub use project::ProjectQuota;
pub use scan::ScanQuota;

/// Quota id assigned to one subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuotaId(u32);

impl QuotaId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QuotaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte ceilings handed to a backend. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteLimits {
    /// Advisory ceiling.
    pub soft: u64,
    /// Enforced ceiling.
    pub hard: u64,
}

/// Disk accounting and enforcement for filesystem subtrees.
pub trait QuotaBackend: Send + Sync + fmt::Debug {
    /// Tags `subtree` with a fresh quota id. Files created beneath it inherit the id.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtree cannot be tagged.
    fn assign(&self, subtree: &Path) -> Result<QuotaId>;

    /// Replaces the limits of an id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the limits; the previous
    /// limits then stay in effect.
    fn set_limits(&self, id: QuotaId, limits: ByteLimits) -> Result<()>;

    /// Bytes currently charged to an id.
    ///
    /// # Errors
    ///
    /// Returns an error if the usage cannot be read.
    fn usage(&self, id: QuotaId) -> Result<u64>;

    /// Clears an id's limits so it can be reused.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the request.
    fn release(&self, id: QuotaId) -> Result<()>;
}
