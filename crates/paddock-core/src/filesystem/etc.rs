//! Name-resolution files inside a container root.

use std::net::Ipv4Addr;
use std::path::Path;

use paddock_common::error::{PaddockError, Result};

/// Writes `<root>/etc/hosts` resolving `localhost` and the container's own hostname.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_hosts(root: &Path, hostname: &str, address: Option<Ipv4Addr>) -> Result<()> {
    let own = address.unwrap_or(Ipv4Addr::LOCALHOST);
    let contents = format!("127.0.0.1 localhost\n::1 localhost ip6-localhost\n{own} {hostname}\n");
    replace_file(&root.join("etc/hosts"), contents.as_bytes())
}

/// Copies the host resolver configuration to `<root>/etc/resolv.conf`.
///
/// A missing host file leaves the container's file untouched.
///
/// # Errors
///
/// Returns an error if the host file exists but cannot be read, or the copy
/// cannot be written.
pub fn copy_resolv_conf(root: &Path, host_resolv_conf: &Path) -> Result<()> {
    let contents = match std::fs::read(host_resolv_conf) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(PaddockError::Io {
                path: host_resolv_conf.to_path_buf(),
                source: e,
            });
        }
    };
    replace_file(&root.join("etc/resolv.conf"), &contents)
}

/// Replaces `path` without following a symlink planted at it.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let io_err = |e| PaddockError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_file() => std::fs::remove_file(path).map_err(io_err)?,
        _ => {}
    }
    std::fs::write(path, contents).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosts_maps_localhost_and_hostname() {
        let dir = tempfile::tempdir().unwrap();
        write_hosts(dir.path(), "c1", Some(Ipv4Addr::new(10, 254, 0, 2))).unwrap();
        let hosts = std::fs::read_to_string(dir.path().join("etc/hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1 localhost"));
        assert!(hosts.contains("10.254.0.2 c1"));
    }

    #[test]
    fn planted_symlink_is_replaced_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::write(&outside, "keep").unwrap();
        std::fs::create_dir_all(dir.path().join("root/etc")).unwrap();
        std::os::unix::fs::symlink(&outside, dir.path().join("root/etc/hosts")).unwrap();

        write_hosts(&dir.path().join("root"), "c1", None).unwrap();
        assert_eq!(std::fs::read_to_string(&outside).unwrap(), "keep");
        assert!(std::fs::read_to_string(dir.path().join("root/etc/hosts")).unwrap().contains("127.0.0.1 c1"));
    }

    #[test]
    fn resolv_conf_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("resolv.conf");
        std::fs::write(&host, "nameserver 1.1.1.1\n").unwrap();

        copy_resolv_conf(&dir.path().join("root"), &host).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("root/etc/resolv.conf")).unwrap(),
            "nameserver 1.1.1.1\n"
        );
        copy_resolv_conf(dir.path(), &dir.path().join("absent")).unwrap();
    }
}
