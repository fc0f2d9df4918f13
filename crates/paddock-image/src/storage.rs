//! Local image store.
//!
//! Archives are unpacked once into `<root>/layers/<sha256>` and shared
//! read-only by every container created from them. Unpacking goes through a
//! temporary sibling directory and a rename, so a crash never leaves a
//! half-extracted layer under its final name.

use std::path::{Path, PathBuf};

use paddock_common::error::{PaddockError, Result};

/// Manages the on-disk cache of unpacked archives.
#[derive(Debug, Clone)]
pub struct ImageStore {
    /// Root directory for all stored data.
    root: PathBuf,
}

impl ImageStore {
    /// Opens or initializes the store at the given root.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("layers")).map_err(|e| PaddockError::Io {
            path: root.clone(),
            source: e,
        })?;
        tracing::info!(path = %root.display(), "image store opened");
        Ok(Self { root })
    }

    /// Returns the path to a layer's directory given its hash.
    #[must_use]
    pub fn layer_path(&self, hash: &str) -> PathBuf {
        self.root.join("layers").join(hash)
    }

    /// Checks whether a layer exists in the local cache.
    #[must_use]
    pub fn has_layer(&self, hash: &str) -> bool {
        self.layer_path(hash).is_dir()
    }

    /// Returns the unpacked directory of an archive, unpacking it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing or unpacking fails.
    pub fn unpacked(&self, archive: &Path) -> Result<PathBuf> {
        let hash = crate::hash::hash_file(archive)?;
        let target = self.layer_path(&hash);
        if target.is_dir() {
            tracing::debug!(archive = %archive.display(), sha256 = %hash, "archive cache hit");
            return Ok(target);
        }
        let staging = self.root.join("layers").join(format!(".{hash}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(|e| PaddockError::Io {
                path: staging.clone(),
                source: e,
            })?;
        }
        if let Err(e) = crate::layer::unpack_archive(archive, &staging) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }
        match std::fs::rename(&staging, &target) {
            Ok(()) => {}
            // Another caller finished the same archive first.
            Err(_) if target.is_dir() => {
                let _ = std::fs::remove_dir_all(&staging);
            }
            Err(e) => {
                return Err(PaddockError::Io {
                    path: target,
                    source: e,
                });
            }
        }
        tracing::info!(archive = %archive.display(), sha256 = %hash, "archive cached");
        Ok(target)
    }

    /// Returns the root storage path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
