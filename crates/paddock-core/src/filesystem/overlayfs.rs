//! `OverlayFS` management for layered container filesystems.
//!
//! A container root is one read-only image directory with a private
//! writable upper layer on top. Upper and work directories share one layer
//! directory, which is the subtree disk quotas are attached to: copy-up
//! renames entries from work into upper, and project quota filesystems
//! refuse renames between directories of different projects.

use std::path::{Path, PathBuf};

use paddock_common::error::{PaddockError, Result};

/// Directory layout of one overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    /// Read-only image directory.
    pub lower_dir: PathBuf,
    /// Parent of the upper and work directories.
    pub layer_dir: PathBuf,
    /// Writable upper layer.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Mount point of the merged view.
    pub merged_dir: PathBuf,
}

impl OverlayLayout {
    /// Lays out `layer/upper`, `layer/work` and `rootfs` under a container directory.
    #[must_use]
    pub fn under(container_dir: &Path, lower_dir: impl Into<PathBuf>) -> Self {
        let layer_dir = container_dir.join("layer");
        Self {
            lower_dir: lower_dir.into(),
            upper_dir: layer_dir.join("upper"),
            work_dir: layer_dir.join("work"),
            layer_dir,
            merged_dir: container_dir.join("rootfs"),
        }
    }

    /// Creates the upper, work and merged directories.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn create_dirs(&self) -> Result<()> {
        for dir in [&self.upper_dir, &self.work_dir, &self.merged_dir] {
            std::fs::create_dir_all(dir).map_err(|e| PaddockError::Io {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Mount options string for `mount(2)`.
    #[must_use]
    pub fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// Mounts the overlay described by `layout`. Directories must exist.
///
/// # Errors
///
/// Returns an error if the mount syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_overlay(layout: &OverlayLayout) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let opts = layout.options();
    mount(
        Some("overlay"),
        &layout.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| PaddockError::PermissionDenied {
        message: format!("overlay mount at {} failed: {e}", layout.merged_dir.display()),
    })?;

    tracing::info!(merged = %layout.merged_dir.display(), "overlayfs mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `OverlayFS` mounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_layout: &OverlayLayout) -> Result<()> {
    Err(PaddockError::Config {
        message: "Linux required for native container operations".into(),
    })
}

/// Lazily detaches the overlay at `merged_dir`. Not being mounted is fine.
///
/// # Errors
///
/// Returns an error if the unmount syscall fails for another reason.
#[cfg(target_os = "linux")]
pub fn unmount_overlay(merged_dir: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    match umount2(merged_dir, MntFlags::MNT_DETACH) {
        Ok(()) => {
            tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
            Ok(())
        }
        Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(e) => Err(PaddockError::PermissionDenied {
            message: format!("unmount of {} failed: {e}", merged_dir.display()),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `OverlayFS` unmounting requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount_overlay(_merged_dir: &Path) -> Result<()> {
    Err(PaddockError::Config {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_places_layers_under_container_dir() {
        let layout = OverlayLayout::under(Path::new("/data/containers/c1"), "/data/images/base");
        assert_eq!(layout.upper_dir, PathBuf::from("/data/containers/c1/layer/upper"));
        assert_eq!(layout.merged_dir, PathBuf::from("/data/containers/c1/rootfs"));
        assert_eq!(
            layout.options(),
            "lowerdir=/data/images/base,upperdir=/data/containers/c1/layer/upper,workdir=/data/containers/c1/layer/work"
        );
    }

    #[test]
    fn upper_and_work_share_a_layer_dir_outside_the_mount() {
        let layout = OverlayLayout::under(Path::new("/data/containers/c1"), "/data/images/base");
        assert!(layout.upper_dir.starts_with(&layout.layer_dir));
        assert!(layout.work_dir.starts_with(&layout.layer_dir));
        assert!(!layout.merged_dir.starts_with(&layout.layer_dir));
    }

    #[test]
    fn create_dirs_builds_all_three() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OverlayLayout::under(dir.path(), dir.path().join("lower"));
        layout.create_dirs().unwrap();
        assert!(layout.upper_dir.is_dir());
        assert!(layout.work_dir.is_dir());
        assert!(layout.merged_dir.is_dir());
    }
}
