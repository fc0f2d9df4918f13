//! Mounts applied inside a container's mount namespace.
//!
//! A [`MountPlan`] is computed and its mount points created in the parent,
//! then applied by the namespace holder right after `unshare(2)`. Applying
//! allocates nothing, so it is safe between `fork(2)` and the holder's idle
//! loop.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use paddock_common::error::{PaddockError, Result};

/// Host device nodes bind-mounted into every container.
const DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// One mount to perform.
#[derive(Debug, Clone)]
struct MountSpec {
    source: CString,
    target: CString,
    target_path: PathBuf,
    target_is_file: bool,
    fstype: Option<CString>,
    flags: MsFlags,
    data: Option<CString>,
}

/// Ordered mounts for one container root.
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    mounts: Vec<MountSpec>,
}

impl MountPlan {
    /// `/proc`, a private `/dev/shm` tmpfs and the basic device nodes under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path contains a NUL byte.
    pub fn for_container(root: &Path) -> Result<Self> {
        let mut mounts = vec![
            MountSpec {
                source: cstring("proc")?,
                target: path_cstring(&root.join("proc"))?,
                target_path: root.join("proc"),
                target_is_file: false,
                fstype: Some(cstring("proc")?),
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                data: None,
            },
            MountSpec {
                source: cstring("shm")?,
                target: path_cstring(&root.join("dev/shm"))?,
                target_path: root.join("dev/shm"),
                target_is_file: false,
                fstype: Some(cstring("tmpfs")?),
                flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                data: Some(cstring("mode=1777")?),
            },
        ];
        for device in DEVICES {
            let host = Path::new("/dev").join(device);
            if !host.exists() {
                continue;
            }
            let target = root.join("dev").join(device);
            mounts.push(MountSpec {
                source: path_cstring(&host)?,
                target: path_cstring(&target)?,
                target_path: target,
                target_is_file: true,
                fstype: None,
                flags: MsFlags::MS_BIND,
                data: None,
            });
        }
        Ok(Self { mounts })
    }

    /// Number of mounts in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Whether the plan is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Creates every mount point. Runs in the parent before the holder forks.
    ///
    /// # Errors
    ///
    /// Returns an error if a mount point cannot be created.
    pub fn prepare(&self) -> Result<()> {
        for spec in &self.mounts {
            let path = &spec.target_path;
            let io_err = |e| PaddockError::Io {
                path: path.clone(),
                source: e,
            };
            if spec.target_is_file {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(io_err)?;
                }
                if !path.exists() {
                    let _ = std::fs::File::create(path).map_err(io_err)?;
                }
            } else {
                std::fs::create_dir_all(path).map_err(io_err)?;
            }
        }
        Ok(())
    }

    /// Makes every mount private, then performs the plan.
    ///
    /// Async-signal-safe.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the first failing mount.
    #[cfg(target_os = "linux")]
    pub fn apply(&self) -> io::Result<()> {
        use std::ffi::CStr;

        use nix::mount::mount;

        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )?;
        for spec in &self.mounts {
            mount(
                Some(spec.source.as_c_str()),
                spec.target.as_c_str(),
                spec.fstype.as_deref(),
                spec.flags,
                spec.data.as_deref(),
            )?;
        }
        Ok(())
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: mount namespaces require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self) -> io::Result<()> {
        Err(io::Error::other("Linux required for container mounts"))
    }
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| PaddockError::Config {
        message: format!("NUL byte in {value:?}"),
    })
}

pub(crate) fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| PaddockError::Config {
        message: format!("NUL byte in path {}", path.display()),
    })
}
