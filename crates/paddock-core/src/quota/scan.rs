//! Accounting-only quota backend.
//!
//! Usage is measured by walking the subtree; limits are recorded but not
//! enforced. Meant for development hosts whose filesystem has no project
//! quota support.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use paddock_common::error::{PaddockError, Result};

use super::{ByteLimits, QuotaBackend, QuotaId, usage};

/// Subtree-walking quota backend.
#[derive(Debug)]
pub struct ScanQuota {
    next_id: AtomicU32,
    subtrees: Mutex<HashMap<QuotaId, (PathBuf, ByteLimits)>>,
}

impl ScanQuota {
    /// Creates a backend handing out ids from `first_id`.
    #[must_use]
    pub fn new(first_id: u32) -> Self {
        Self {
            next_id: AtomicU32::new(first_id),
            subtrees: Mutex::new(HashMap::new()),
        }
    }

    /// Limits last recorded for an id.
    #[must_use]
    pub fn limits(&self, id: QuotaId) -> Option<ByteLimits> {
        self.subtrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|(_, limits)| *limits)
    }

    fn subtree(&self, id: QuotaId) -> Result<PathBuf> {
        self.subtrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|(path, _)| path.clone())
            .ok_or_else(|| PaddockError::NotFound {
                kind: "quota",
                id: id.to_string(),
            })
    }
}

impl QuotaBackend for ScanQuota {
    fn assign(&self, subtree: &Path) -> Result<QuotaId> {
        let id = QuotaId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self
            .subtrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (subtree.to_path_buf(), ByteLimits::default()));
        tracing::debug!(%id, subtree = %subtree.display(), "accounting-only quota assigned");
        Ok(id)
    }

    fn set_limits(&self, id: QuotaId, limits: ByteLimits) -> Result<()> {
        let mut subtrees = self.subtrees.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = subtrees.get_mut(&id).ok_or_else(|| PaddockError::LimitApplication {
            message: format!("quota {id} is not assigned"),
        })?;
        entry.1 = limits;
        Ok(())
    }

    fn usage(&self, id: QuotaId) -> Result<u64> {
        usage::tree_bytes(&self.subtree(id)?)
    }

    fn release(&self, id: QuotaId) -> Result<()> {
        let _ = self
            .subtrees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        Ok(())
    }
}
