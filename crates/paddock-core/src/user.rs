//! User lookup inside a container root filesystem.
//!
//! Reads `<root>/etc/passwd` on every call so users added by processes in
//! the container (`adduser`) are visible to the next run. The path is
//! resolved inside the root, so symlinks in the image cannot point the
//! lookup at host files.

use std::path::Path;

use paddock_common::error::{PaddockError, Result};

use crate::filesystem::resolve::resolve_in_root;

/// Credentials and home directory of a container user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory, as seen inside the container.
    pub home: String,
}

impl UserEntry {
    /// Root, used when the rootfs has no passwd entry for it.
    #[must_use]
    pub fn root() -> Self {
        Self {
            name: "root".into(),
            uid: 0,
            gid: 0,
            home: "/root".into(),
        }
    }
}

/// Resolves a user name or numeric uid against the container's passwd file.
///
/// `None` means root. A numeric uid without a passwd entry resolves to
/// that uid with an equal gid and `/` as home.
///
/// # Errors
///
/// Returns [`PaddockError::Spawn`] if a named user does not exist, or an
/// I/O error if the passwd file exists but cannot be read.
pub fn lookup(root: &Path, user: Option<&str>) -> Result<UserEntry> {
    let name = user.unwrap_or("root");
    let passwd = match resolve_in_root(root, Path::new("/etc/passwd")) {
        Some(path) => read_passwd(&path)?,
        None => Vec::new(),
    };
    if let Some(entry) = passwd.iter().find(|e| e.name == name) {
        return Ok(entry.clone());
    }
    if let Ok(uid) = name.parse::<u32>() {
        if let Some(entry) = passwd.iter().find(|e| e.uid == uid) {
            return Ok(entry.clone());
        }
        return Ok(UserEntry {
            name: name.to_owned(),
            uid,
            gid: uid,
            home: "/".into(),
        });
    }
    if name == "root" {
        return Ok(UserEntry::root());
    }
    Err(PaddockError::Spawn {
        message: format!("unknown user: {name}"),
    })
}

fn read_passwd(path: &Path) -> Result<Vec<UserEntry>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(parse_passwd(&raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Parses `name:password:uid:gid:gecos:home:shell` lines, skipping malformed ones.
fn parse_passwd(raw: &str) -> Vec<UserEntry> {
    raw.lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(UserEntry {
                name: fields[0].to_owned(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: if fields[5].is_empty() { "/" } else { fields[5] }.to_owned(),
            })
        })
        .collect()
}
