//! Apparent disk usage of a directory tree.
//!
//! Used to size root filesystem images and to break a writable layer's
//! usage down by owning uid. Hard-linked files are counted once and the walk
//! never crosses into other filesystems.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use paddock_common::error::{PaddockError, Result};
use walkdir::WalkDir;

/// Total apparent size in bytes of regular files and symlinks under `root`.
///
/// # Errors
///
/// Returns an error if the tree cannot be traversed.
pub fn tree_bytes(root: &Path) -> Result<u64> {
    Ok(bytes_by_owner(root)?.values().sum())
}

/// Apparent size in bytes of regular files and symlinks under `root`, keyed
/// by owning uid.
///
/// # Errors
///
/// Returns an error if the tree cannot be traversed. Entries that vanish
/// mid-walk are skipped.
pub fn bytes_by_owner(root: &Path) -> Result<BTreeMap<u32, u64>> {
    let mut owners = BTreeMap::new();
    let mut seen_links = HashSet::new();
    for entry in WalkDir::new(root).same_file_system(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                continue;
            }
            Err(e) => {
                return Err(PaddockError::Io {
                    path: e.path().unwrap_or(root).to_path_buf(),
                    source: e
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
                });
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.nlink() > 1 && !seen_links.insert((metadata.dev(), metadata.ino())) {
            continue;
        }
        *owners.entry(metadata.uid()).or_insert(0) += metadata.len();
    }
    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("a/b/deep"), vec![0u8; 1_000]).unwrap();

        assert_eq!(tree_bytes(dir.path()).unwrap(), 1_100);
    }

    #[test]
    fn hard_links_count_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), vec![0u8; 4_096]).unwrap();
        std::fs::hard_link(dir.path().join("file"), dir.path().join("link")).unwrap();

        assert_eq!(tree_bytes(dir.path()).unwrap(), 4_096);
    }

    #[test]
    fn owner_breakdown_uses_file_uid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mine"), vec![0u8; 10]).unwrap();
        let uid = std::fs::metadata(dir.path().join("mine")).unwrap().uid();

        let owners = bytes_by_owner(dir.path()).unwrap();
        assert_eq!(owners.get(&uid), Some(&10));
    }

    #[test]
    fn empty_tree_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(tree_bytes(dir.path()).unwrap(), 0);
    }
}
