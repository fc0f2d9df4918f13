//! Per-container root filesystems.
//!
//! A provider turns a rootfs source into a directory a container can use as
//! `/`, and reports which subtree takes the container's writes (the quota
//! target) and how many bytes the image itself occupies (the Total-scope
//! baseline).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use paddock_common::error::{PaddockError, Result};
use paddock_common::types::ContainerHandle;
use paddock_core::filesystem::overlayfs::{self, OverlayLayout};
use paddock_core::quota::usage;
use serde::{Deserialize, Serialize};

use crate::source::{RootfsSource, resolve_source};
use crate::storage::ImageStore;

/// A provisioned container root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedRootfs {
    /// Directory the container sees as `/`.
    pub root: PathBuf,
    /// Subtree receiving every write made in the container.
    pub writable: PathBuf,
    /// Directory the disk quota is attached to. Contains `writable` and
    /// any scratch space the filesystem moves writes through.
    pub quota_root: PathBuf,
    /// Bytes occupied by the image before the container writes anything.
    pub image_bytes: u64,
}

/// Source of container root filesystems.
pub trait RootfsProvider: Send + Sync + fmt::Debug {
    /// Builds the root for a new container.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is invalid or the root cannot be built.
    fn provision(&self, handle: &ContainerHandle, source: &str) -> Result<ProvisionedRootfs>;

    /// Removes a container's root. Missing roots are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be unmounted or removed.
    fn release(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Overlay-backed provider: the image is the lower layer, each container
/// gets a private upper layer.
#[derive(Debug)]
pub struct OverlayProvider {
    default_rootfs: PathBuf,
    store: ImageStore,
    containers_dir: PathBuf,
    image_sizes: Mutex<HashMap<PathBuf, u64>>,
}

impl OverlayProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(default_rootfs: PathBuf, store: ImageStore, containers_dir: PathBuf) -> Self {
        Self {
            default_rootfs,
            store,
            containers_dir,
            image_sizes: Mutex::new(HashMap::new()),
        }
    }

    fn lower_dir(&self, source: &str) -> Result<PathBuf> {
        match resolve_source(source)? {
            RootfsSource::Default => {
                if !self.default_rootfs.is_dir() {
                    return Err(PaddockError::NotFound {
                        kind: "default rootfs",
                        id: self.default_rootfs.display().to_string(),
                    });
                }
                Ok(self.default_rootfs.clone())
            }
            RootfsSource::Directory(path) => Ok(path),
            RootfsSource::Archive(path) => self.store.unpacked(&path),
        }
    }

    /// Image size, measured once per image directory.
    fn image_bytes(&self, lower: &Path) -> Result<u64> {
        let cached = self
            .image_sizes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(lower)
            .copied();
        if let Some(bytes) = cached {
            return Ok(bytes);
        }
        let bytes = usage::tree_bytes(lower)?;
        tracing::info!(image = %lower.display(), bytes, "image measured");
        let _ = self
            .image_sizes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(lower.to_path_buf(), bytes);
        Ok(bytes)
    }
}

impl RootfsProvider for OverlayProvider {
    fn provision(&self, handle: &ContainerHandle, source: &str) -> Result<ProvisionedRootfs> {
        let lower = self.lower_dir(source)?;
        let image_bytes = self.image_bytes(&lower)?;
        let container_dir = self.containers_dir.join(handle.as_str());
        if container_dir.exists() {
            return Err(PaddockError::Creation {
                message: format!("stale layer directory {}", container_dir.display()),
            });
        }
        let layout = OverlayLayout::under(&container_dir, lower);
        let mounted = layout.create_dirs().and_then(|()| overlayfs::mount_overlay(&layout));
        if let Err(e) = mounted {
            let _ = std::fs::remove_dir_all(&container_dir);
            return Err(e);
        }
        Ok(ProvisionedRootfs {
            root: layout.merged_dir,
            writable: layout.upper_dir,
            quota_root: layout.layer_dir,
            image_bytes,
        })
    }

    fn release(&self, handle: &ContainerHandle) -> Result<()> {
        let container_dir = self.containers_dir.join(handle.as_str());
        overlayfs::unmount_overlay(&container_dir.join("rootfs"))?;
        remove_tree(&container_dir)
    }
}

/// Provider handing each container an empty directory. Used with host
/// isolation, where programs come from the host and the image is irrelevant.
#[derive(Debug, Clone)]
pub struct ScratchProvider {
    containers_dir: PathBuf,
}

impl ScratchProvider {
    /// Creates a provider placing roots under `containers_dir`.
    #[must_use]
    pub fn new(containers_dir: impl Into<PathBuf>) -> Self {
        Self {
            containers_dir: containers_dir.into(),
        }
    }
}

impl RootfsProvider for ScratchProvider {
    fn provision(&self, handle: &ContainerHandle, source: &str) -> Result<ProvisionedRootfs> {
        if !source.is_empty() {
            tracing::debug!(handle = %handle, source, "scratch provider ignores rootfs source");
        }
        let root = self.containers_dir.join(handle.as_str()).join("rootfs");
        if root.exists() {
            return Err(PaddockError::Creation {
                message: format!("stale rootfs directory {}", root.display()),
            });
        }
        std::fs::create_dir_all(&root).map_err(|e| PaddockError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(ProvisionedRootfs {
            writable: root.clone(),
            quota_root: root.clone(),
            root,
            image_bytes: 0,
        })
    }

    fn release(&self, handle: &ContainerHandle) -> Result<()> {
        remove_tree(&self.containers_dir.join(handle.as_str()))
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
