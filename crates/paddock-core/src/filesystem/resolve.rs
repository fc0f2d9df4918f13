//! Path resolution inside a container root without chrooting.
//!
//! Symlinks are followed the way the kernel would follow them after
//! `chroot(2)`: absolute targets restart at the container root and `..`
//! never climbs above it.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Same limit as the kernel's `MAXSYMLINKS`.
const MAX_SYMLINKS: usize = 40;

/// Resolves `path`, as seen inside the container, to a host path under `root`.
///
/// Missing trailing components are kept as they are, so the result can be
/// used to create a directory. Returns `None` on a symlink loop.
#[must_use]
pub fn resolve_in_root(root: &Path, path: &Path) -> Option<PathBuf> {
    let mut pending: VecDeque<OsString> = components(path);
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(name) = pending.pop_front() {
        if name == ".." {
            let _ = resolved.pop();
            continue;
        }
        let candidate = join(root, &resolved).join(&name);
        match std::fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINKS {
                    return None;
                }
                let target = std::fs::read_link(&candidate).ok()?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for part in components(&target).into_iter().rev() {
                    pending.push_front(part);
                }
            }
            _ => resolved.push(name),
        }
    }
    Some(join(root, &resolved))
}

fn components(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

fn join(root: &Path, parts: &[OsString]) -> PathBuf {
    parts.iter().fold(root.to_path_buf(), |acc, p| acc.join(p))
}
