//! SHA-256 content hashing for the archive cache.

use std::io::Read;
use std::path::Path;

use paddock_common::error::{PaddockError, Result};
use sha2::{Digest, Sha256};

/// Computes the hex-encoded SHA-256 digest of a file, streaming it in chunks.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    let io_err = |e| PaddockError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    tracing::debug!(path = %path.display(), sha256 = %hex, "file hashed");
    Ok(hex)
}
