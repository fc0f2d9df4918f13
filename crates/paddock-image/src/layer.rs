//! Archive extraction into image directories.
//!
//! Entries keep their permissions and, when running as root, their owners,
//! so an unpacked image behaves like the filesystem it was exported from.

use std::io::Read;
use std::path::Path;

use paddock_common::error::{PaddockError, Result};

/// Unpacks a plain or gzip-compressed tar archive into `target`.
///
/// Gzip is detected by the `.gz` / `.tgz` extension.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened or an entry cannot be
/// written.
pub fn unpack_archive(archive_path: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        archive = %archive_path.display(),
        target = %target.display(),
        "unpacking archive"
    );

    std::fs::create_dir_all(target).map_err(|e| PaddockError::Io {
        path: target.to_path_buf(),
        source: e,
    })?;
    let file = std::fs::File::open(archive_path).map_err(|e| PaddockError::Io {
        path: archive_path.to_path_buf(),
        source: e,
    })?;

    if is_gzip_archive(archive_path) {
        unpack(flate2::read::GzDecoder::new(file), target)
    } else {
        unpack(file, target)
    }
}

fn unpack(reader: impl Read, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(is_root());
    archive.set_unpack_xattrs(false);
    archive.unpack(target).map_err(|e| PaddockError::Io {
        path: target.to_path_buf(),
        source: e,
    })
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}
