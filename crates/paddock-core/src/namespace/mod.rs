//! Linux namespace management for container isolation.
//!
//! A container's namespaces are owned by an idle [`holder::Holder`]
//! process. Processes run in the container join them through a
//! [`NamespaceSet`] of descriptors opened once at container creation.
//!
//! PID namespaces are not used: `setns(2)` into a PID namespace only affects
//! children of the caller, not the caller's own exec.

pub mod holder;

use std::fs::File;
use std::io;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use paddock_common::error::{PaddockError, Result};

/// Namespaces a holder unshares, in the order processes join them.
/// Mount comes last so the other `/proc` paths were already resolved.
const NAMESPACES: &[(&str, CloneFlags)] = &[
    ("ipc", CloneFlags::CLONE_NEWIPC),
    ("uts", CloneFlags::CLONE_NEWUTS),
    ("net", CloneFlags::CLONE_NEWNET),
    ("mnt", CloneFlags::CLONE_NEWNS),
];

/// Flags passed to `unshare(2)` by a holder.
#[must_use]
pub fn holder_flags() -> CloneFlags {
    NAMESPACES
        .iter()
        .fold(CloneFlags::empty(), |acc, (_, flag)| acc | *flag)
}

/// Open descriptors to a holder's namespaces.
#[derive(Debug)]
pub struct NamespaceSet {
    files: Vec<(CloneFlags, File)>,
}

impl NamespaceSet {
    /// Opens `/proc/<pid>/ns/*` for every holder namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if any namespace file cannot be opened.
    pub fn open(pid: u32) -> Result<Self> {
        let mut files = Vec::with_capacity(NAMESPACES.len());
        for (name, flag) in NAMESPACES {
            let path = PathBuf::from(format!("/proc/{pid}/ns/{name}"));
            let file = File::open(&path).map_err(|e| PaddockError::Io {
                path: path.clone(),
                source: e,
            })?;
            files.push((*flag, file));
        }
        tracing::debug!(pid, count = files.len(), "namespace descriptors opened");
        Ok(Self { files })
    }

    /// Moves the calling thread into every namespace of the set.
    ///
    /// Async-signal-safe; meant for the window between `fork(2)` and
    /// `execve(2)`.
    ///
    /// # Errors
    ///
    /// Returns the OS error of the first failing `setns(2)`.
    #[cfg(target_os = "linux")]
    pub fn enter(&self) -> io::Result<()> {
        for (flag, file) in &self.files {
            nix::sched::setns(file, *flag)?;
        }
        Ok(())
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: namespaces require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn enter(&self) -> io::Result<()> {
        Err(io::Error::other("Linux required for namespaces"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_flags_cover_all_joined_namespaces() {
        let flags = holder_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWPID));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_namespaces_can_be_opened() {
        let set = NamespaceSet::open(std::process::id()).unwrap();
        assert_eq!(set.files.len(), 4);
    }
}
