//! Rootfs source identifiers.
//!
//! `""` selects the server's default rootfs, `file:///dir` an unpacked
//! directory and `tar:///archive` a (optionally gzipped) tarball. Registry
//! sources such as `docker://` are recognised and rejected: fetching images
//! is not part of the server.

use std::path::PathBuf;

use paddock_common::error::{PaddockError, Result};

/// A parsed rootfs source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootfsSource {
    /// The configured default rootfs.
    Default,
    /// Unpacked directory (`file:///path/to/rootfs`).
    Directory(PathBuf),
    /// Tar archive (`tar:///path/to/image.tar`).
    Archive(PathBuf),
}

/// Parses a rootfs source identifier and checks that it exists.
///
/// # Errors
///
/// Returns [`PaddockError::NotFound`] if the path is missing and
/// [`PaddockError::Config`] for unsupported schemes.
pub fn resolve_source(uri: &str) -> Result<RootfsSource> {
    if uri.is_empty() {
        return Ok(RootfsSource::Default);
    }
    if let Some(path_str) = uri.strip_prefix("file://") {
        let path = PathBuf::from(path_str);
        if !path.is_dir() {
            return Err(PaddockError::NotFound {
                kind: "rootfs directory",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved file:// source");
        return Ok(RootfsSource::Directory(path));
    }
    if let Some(path_str) = uri.strip_prefix("tar://") {
        let path = PathBuf::from(path_str);
        if !path.is_file() {
            return Err(PaddockError::NotFound {
                kind: "tar archive",
                id: path_str.to_string(),
            });
        }
        tracing::debug!(path = %path.display(), "resolved tar:// source");
        return Ok(RootfsSource::Archive(path));
    }
    if uri.starts_with("docker://") || uri.starts_with("oci://") {
        return Err(PaddockError::Config {
            message: format!("registry image sources are not supported: {uri}"),
        });
    }
    Err(PaddockError::Config {
        message: format!("unsupported rootfs source URI scheme: {uri}"),
    })
}
