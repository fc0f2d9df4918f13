//! Cgroups v2 memory control.
//!
//! Every container gets its own cgroup under a configurable parent
//! (`/sys/fs/cgroup/paddock/<handle>` by default). Processes enroll by
//! writing `0` to the cgroup's `cgroup.procs` before they exec, so the
//! whole process tree is charged from its first allocation.

pub mod memory;
pub mod unconfined;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use paddock_common::error::{PaddockError, Result};
use paddock_common::metrics::MemoryStat;
use paddock_common::types::ContainerHandle;

pub use unconfined::Unconfined;

/// Per-container memory accounting and enforcement.
pub trait CgroupBackend: Send + Sync + fmt::Debug {
    /// Creates the container's cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be created.
    fn create(&self, handle: &ContainerHandle) -> Result<()>;

    /// Sets the memory ceiling. Zero removes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the control file rejects the value; the previous
    /// ceiling then stays in place.
    fn set_memory_limit(&self, handle: &ContainerHandle, bytes: u64) -> Result<()>;

    /// Reads current memory accounting.
    ///
    /// # Errors
    ///
    /// Returns an error if the control files cannot be read.
    fn memory_stat(&self, handle: &ContainerHandle) -> Result<MemoryStat>;

    /// File a new process writes `0` to in order to join the cgroup.
    fn procs_file(&self, handle: &ContainerHandle) -> Option<PathBuf>;

    /// Sends `SIGKILL` to every process in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill request cannot be issued.
    fn kill_all(&self, handle: &ContainerHandle) -> Result<()>;

    /// Removes the cgroup. Missing cgroups are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup still has members after a grace period.
    fn destroy(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Cgroup v2 backend rooted at a parent directory.
#[derive(Debug, Clone)]
pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    /// Creates a backend whose container cgroups live under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of one container's cgroup.
    #[must_use]
    pub fn path(&self, handle: &ContainerHandle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    /// Delegates the memory controller from the parent to container cgroups.
    fn delegate_memory(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(|e| PaddockError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let mut dirs = vec![self.root.as_path()];
        if let Some(parent) = self.root.parent() {
            dirs.insert(0, parent);
        }
        for dir in dirs {
            let control = dir.join("cgroup.subtree_control");
            if !control.exists() {
                continue;
            }
            let enabled = std::fs::read_to_string(&control).unwrap_or_default();
            if enabled.split_whitespace().any(|c| c == "memory") {
                continue;
            }
            write_control(&control, "+memory")?;
            tracing::debug!(path = %control.display(), "memory controller delegated");
        }
        Ok(())
    }
}

impl CgroupBackend for CgroupV2 {
    fn create(&self, handle: &ContainerHandle) -> Result<()> {
        self.delegate_memory()?;
        let path = self.path(handle);
        std::fs::create_dir_all(&path).map_err(|e| PaddockError::Io {
            path: path.clone(),
            source: e,
        })?;
        tracing::info!(handle = %handle, path = %path.display(), "cgroup created");
        Ok(())
    }

    fn set_memory_limit(&self, handle: &ContainerHandle, bytes: u64) -> Result<()> {
        let path = self.path(handle);
        memory::set_memory_max(&path, bytes)?;
        memory::disable_swap(&path)?;
        Ok(())
    }

    fn memory_stat(&self, handle: &ContainerHandle) -> Result<MemoryStat> {
        memory::read_stat(&self.path(handle))
    }

    fn procs_file(&self, handle: &ContainerHandle) -> Option<PathBuf> {
        Some(self.path(handle).join("cgroup.procs"))
    }

    fn kill_all(&self, handle: &ContainerHandle) -> Result<()> {
        let path = self.path(handle);
        let kill = path.join("cgroup.kill");
        if kill.exists() {
            return write_control(&kill, "1");
        }
        for pid in member_pids(&path)? {
            kill_pid(pid);
        }
        Ok(())
    }

    fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        let path = self.path(handle);
        if !path.exists() {
            return Ok(());
        }
        // Members need a moment to exit after cgroup.kill; rmdir fails with
        // EBUSY until they have.
        let mut last_err = None;
        for _ in 0..50 {
            match std::fs::remove_dir(&path) {
                Ok(()) => {
                    tracing::info!(handle = %handle, path = %path.display(), "cgroup destroyed");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Err(PaddockError::Io {
            path,
            source: last_err.unwrap_or_else(|| std::io::Error::other("cgroup busy")),
        })
    }
}

/// Writes a single value to a cgroup control file.
pub(crate) fn write_control(path: &Path, value: &str) -> Result<()> {
    std::fs::write(path, value).map_err(|e| PaddockError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Pids listed in a cgroup's `cgroup.procs`.
fn member_pids(cgroup: &Path) -> Result<Vec<i32>> {
    let procs = cgroup.join("cgroup.procs");
    match std::fs::read_to_string(&procs) {
        Ok(raw) => Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PaddockError::Io {
            path: procs,
            source: e,
        }),
    }
}

#[cfg(target_os = "linux")]
fn kill_pid(pid: i32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "kill of cgroup member failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_pid(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_makes_container_directory() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(dir.path().join("paddock"));
        let handle = ContainerHandle::new("c1");

        backend.create(&handle).unwrap();
        assert!(dir.path().join("paddock/c1").is_dir());
        assert_eq!(
            backend.procs_file(&handle).unwrap(),
            dir.path().join("paddock/c1/cgroup.procs")
        );
    }

    #[test]
    fn memory_limit_lands_in_control_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(dir.path());
        let handle = ContainerHandle::new("c1");
        backend.create(&handle).unwrap();

        backend.set_memory_limit(&handle, 64 * 1024 * 1024).unwrap();
        let written = std::fs::read_to_string(dir.path().join("c1/memory.max")).unwrap();
        assert_eq!(written, "67108864");
    }

    #[test]
    fn delegation_skips_missing_control_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.subtree_control"), "cpu io").unwrap();
        let backend = CgroupV2::new(dir.path().join("paddock"));

        backend.create(&ContainerHandle::new("c1")).unwrap();
        let control = std::fs::read_to_string(dir.path().join("cgroup.subtree_control")).unwrap();
        assert_eq!(control, "+memory");
        assert!(!dir.path().join("paddock/cgroup.subtree_control").exists());
    }

    #[test]
    fn destroy_removes_empty_cgroup_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(dir.path());
        let handle = ContainerHandle::new("c1");
        backend.create(&handle).unwrap();

        backend.destroy(&handle).unwrap();
        assert!(!dir.path().join("c1").exists());
        backend.destroy(&handle).unwrap();
    }

    #[test]
    fn kill_all_prefers_cgroup_kill() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CgroupV2::new(dir.path());
        let handle = ContainerHandle::new("c1");
        backend.create(&handle).unwrap();
        std::fs::write(dir.path().join("c1/cgroup.kill"), "0").unwrap();

        backend.kill_all(&handle).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("c1/cgroup.kill")).unwrap(), "1");
    }
}
