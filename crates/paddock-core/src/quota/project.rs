//! Project quota backend.
//!
//! Tags a directory tree with a project id (`FS_IOC_FSSETXATTR`, plus
//! `FS_XFLAG_PROJINHERIT` on directories) and manages that project's block limits with
//! `quotactl(2)` on the backing device. Limits are kept in 512-byte basic
//! blocks and rounded up, so a write ending exactly on the ceiling fits.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use paddock_common::constants::QUOTA_BLOCK_SIZE;
use paddock_common::error::{PaddockError, Result};
use walkdir::WalkDir;

use super::{ByteLimits, QuotaBackend, QuotaId};

/// Filesystems known to implement project quotas.
const PROJECT_QUOTA_FILESYSTEMS: &[&str] = &["xfs", "ext4"];

/// One line of `/proc/self/mountinfo`, reduced to what quota setup needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount source, usually the block device.
    pub source: String,
}

/// Project quota backend bound to one block device.
#[derive(Debug)]
pub struct ProjectQuota {
    device: CString,
    next_id: AtomicU32,
}

impl ProjectQuota {
    /// Binds to the filesystem holding `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the mount table cannot be read, or if the
    /// filesystem does not support project quotas.
    pub fn for_path(path: &Path, first_id: u32) -> Result<Self> {
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
            PaddockError::Io {
                path: PathBuf::from("/proc/self/mountinfo"),
                source: e,
            }
        })?;
        let canonical = std::fs::canonicalize(path).map_err(|e| PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let entry = find_mount(&mountinfo, &canonical).ok_or_else(|| PaddockError::Config {
            message: format!("no mount found for {}", canonical.display()),
        })?;
        if !PROJECT_QUOTA_FILESYSTEMS.contains(&entry.fs_type.as_str()) {
            return Err(PaddockError::Config {
                message: format!(
                    "{} is on {} ({}), which has no project quota support",
                    canonical.display(),
                    entry.mount_point.display(),
                    entry.fs_type
                ),
            });
        }
        tracing::info!(
            device = %entry.source,
            mount_point = %entry.mount_point.display(),
            fs_type = %entry.fs_type,
            "project quotas enabled"
        );
        Self::with_device(&entry.source, first_id)
    }

    /// Binds to an explicit block device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device path contains a NUL byte.
    pub fn with_device(device: &str, first_id: u32) -> Result<Self> {
        let device = CString::new(device).map_err(|_| PaddockError::Config {
            message: format!("invalid device path: {device}"),
        })?;
        Ok(Self {
            device,
            next_id: AtomicU32::new(first_id),
        })
    }

    /// Ensures future ids are allocated above `id`.
    pub fn reserve_through(&self, id: QuotaId) {
        let _ = self.next_id.fetch_max(id.as_u32().saturating_add(1), Ordering::SeqCst);
    }
}

impl QuotaBackend for ProjectQuota {
    fn assign(&self, subtree: &Path) -> Result<QuotaId> {
        let id = QuotaId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let targets = tagging_targets(subtree)?;
        for target in &targets {
            sys::set_project(&target.path, id.as_u32(), target.is_dir)?;
        }
        tracing::debug!(path = %subtree.display(), project = %id, entries = targets.len(), "project id assigned");
        Ok(id)
    }

    fn set_limits(&self, id: QuotaId, limits: ByteLimits) -> Result<()> {
        sys::set_block_limits(
            &self.device,
            id.as_u32(),
            bytes_to_blocks(limits.soft),
            bytes_to_blocks(limits.hard),
        )
        .map_err(|e| PaddockError::LimitApplication {
            message: format!("quotactl for project {id}: {e}"),
        })?;
        tracing::debug!(project = %id, soft = limits.soft, hard = limits.hard, "project limits set");
        Ok(())
    }

    fn usage(&self, id: QuotaId) -> Result<u64> {
        let blocks = sys::used_blocks(&self.device, id.as_u32()).map_err(|e| {
            PaddockError::backend(format!("reading usage of project {id}: {e}"))
        })?;
        Ok(blocks.saturating_mul(QUOTA_BLOCK_SIZE))
    }

    fn release(&self, id: QuotaId) -> Result<()> {
        self.set_limits(id, ByteLimits::default())
    }
}

/// An entry that must carry its subtree's project id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTarget {
    /// Entry path.
    pub path: PathBuf,
    /// Directories also get `PROJINHERIT` so new children inherit the id.
    pub is_dir: bool,
}

/// Entries of `subtree` to tag, the subtree itself first.
///
/// Entries that already exist do not inherit an id set on their parent
/// later, so each one is tagged. Symlinks cannot be opened without
/// following them and are skipped, as is anything on another filesystem.
///
/// # Errors
///
/// Returns an error if the tree cannot be traversed.
pub fn tagging_targets(subtree: &Path) -> Result<Vec<TagTarget>> {
    let mut targets = Vec::new();
    for entry in WalkDir::new(subtree).same_file_system(true) {
        let entry = entry.map_err(|e| PaddockError::Io {
            path: e.path().unwrap_or(subtree).to_path_buf(),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;
        let kind = entry.file_type();
        if kind.is_dir() || kind.is_file() {
            targets.push(TagTarget {
                is_dir: kind.is_dir(),
                path: entry.into_path(),
            });
        }
    }
    Ok(targets)
}

/// Converts a byte ceiling to basic blocks, rounding up. Zero stays zero.
#[must_use]
pub const fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(QUOTA_BLOCK_SIZE)
}

/// Finds the mount holding `path`: the entry with the longest mount point
/// that is a component-wise prefix of it.
#[must_use]
pub fn find_mount(mountinfo: &str, path: &Path) -> Option<MountEntry> {
    mountinfo
        .lines()
        .filter_map(parse_mountinfo_line)
        .filter(|entry| path.starts_with(&entry.mount_point))
        .max_by_key(|entry| entry.mount_point.components().count())
}

fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (left, right) = line.split_once(" - ")?;
    let mount_point = left.split_whitespace().nth(4)?;
    let mut right = right.split_whitespace();
    let fs_type = right.next()?;
    let source = right.next()?;
    Some(MountEntry {
        mount_point: PathBuf::from(unescape_octal(mount_point)),
        fs_type: fs_type.to_owned(),
        source: unescape_octal(source),
    })
}

/// Undoes the `\040`-style escaping the kernel applies to mountinfo fields.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|digits| {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                u8::try_from(value).ok()
            });
        if let Some(value) = escaped {
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(target_os = "linux")]
mod sys {
    use std::ffi::CStr;
    use std::io;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    use paddock_common::error::{PaddockError, Result};

    const FS_IOC_FSGETXATTR: libc::c_ulong = 0x801c_581f;
    const FS_IOC_FSSETXATTR: libc::c_ulong = 0x401c_5820;
    const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

    const Q_XGETQUOTA: i32 = 0x5803;
    const Q_XSETQLIM: i32 = 0x5804;
    const PRJQUOTA: i32 = 2;

    const FS_DQUOT_VERSION: i8 = 1;
    const FS_PROJ_QUOTA: i8 = 2;
    const FS_DQ_BSOFT: u16 = 1 << 2;
    const FS_DQ_BHARD: u16 = 1 << 3;

    /// `struct fsxattr` from `<linux/fs.h>`.
    #[repr(C)]
    #[derive(Debug, Default)]
    pub(super) struct FsXattr {
        pub xflags: u32,
        pub extsize: u32,
        pub nextents: u32,
        pub projid: u32,
        pub cowextsize: u32,
        pub pad: [u8; 8],
    }

    /// `struct fs_disk_quota` from `<linux/dqblk_xfs.h>`.
    #[repr(C)]
    #[derive(Debug, Default)]
    pub(super) struct FsDiskQuota {
        pub version: i8,
        pub flags: i8,
        pub fieldmask: u16,
        pub id: u32,
        pub blk_hardlimit: u64,
        pub blk_softlimit: u64,
        pub ino_hardlimit: u64,
        pub ino_softlimit: u64,
        pub bcount: u64,
        pub icount: u64,
        pub itimer: i32,
        pub btimer: i32,
        pub iwarns: u16,
        pub bwarns: u16,
        pub itimer_hi: i8,
        pub btimer_hi: i8,
        pub rtbtimer_hi: i8,
        pub padding2: i8,
        pub rtb_hardlimit: u64,
        pub rtb_softlimit: u64,
        pub rtbcount: u64,
        pub rtbtimer: i32,
        pub rtbwarns: u16,
        pub padding3: i16,
        pub padding4: [u8; 8],
    }

    const fn qcmd(cmd: i32, kind: i32) -> i32 {
        (cmd << 8) | (kind & 0x00ff)
    }

    pub(super) fn set_project(path: &Path, project: u32, inherit: bool) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| PaddockError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut attr = FsXattr::default();
        // SAFETY: the fd is open for the duration of the call and `attr` is a
        // correctly sized `struct fsxattr`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSGETXATTR as _, &raw mut attr) };
        if rc != 0 {
            return Err(PaddockError::Io {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        attr.projid = project;
        if inherit {
            attr.xflags |= FS_XFLAG_PROJINHERIT;
        }
        // SAFETY: as above; the kernel only reads `attr`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FSSETXATTR as _, &raw const attr) };
        if rc != 0 {
            return Err(PaddockError::Io {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn raw_id(project: u32) -> io::Result<libc::c_int> {
        libc::c_int::try_from(project).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    }

    pub(super) fn set_block_limits(device: &CStr, project: u32, soft: u64, hard: u64) -> io::Result<()> {
        let id = raw_id(project)?;
        let mut quota = FsDiskQuota {
            version: FS_DQUOT_VERSION,
            flags: FS_PROJ_QUOTA,
            fieldmask: FS_DQ_BSOFT | FS_DQ_BHARD,
            id: project,
            blk_hardlimit: hard,
            blk_softlimit: soft,
            ..FsDiskQuota::default()
        };
        // SAFETY: `device` is NUL-terminated and `quota` is a correctly laid
        // out `struct fs_disk_quota` that outlives the call.
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_XSETQLIM, PRJQUOTA),
                device.as_ptr(),
                id,
                (&raw mut quota).cast(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn used_blocks(device: &CStr, project: u32) -> io::Result<u64> {
        let id = raw_id(project)?;
        let mut quota = FsDiskQuota::default();
        // SAFETY: see `set_block_limits`; the kernel fills `quota`.
        let rc = unsafe {
            libc::quotactl(
                qcmd(Q_XGETQUOTA, PRJQUOTA),
                device.as_ptr(),
                id,
                (&raw mut quota).cast(),
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // No dquot yet: nothing has been written under this project.
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(quota.bcount)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn kernel_structs_have_abi_sizes() {
            assert_eq!(std::mem::size_of::<FsXattr>(), 28);
            assert_eq!(std::mem::size_of::<FsDiskQuota>(), 112);
        }

        #[test]
        fn qcmd_packs_subcommand_and_type() {
            assert_eq!(qcmd(Q_XSETQLIM, PRJQUOTA), 0x0058_0402);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::ffi::CStr;
    use std::io;
    use std::path::Path;

    use paddock_common::error::{PaddockError, Result};

    pub(super) fn set_project(_path: &Path, _project: u32, _inherit: bool) -> Result<()> {
        Err(PaddockError::Config {
            message: "Linux required for project quotas".into(),
        })
    }

    pub(super) fn set_block_limits(_device: &CStr, _project: u32, _soft: u64, _hard: u64) -> io::Result<()> {
        Err(io::Error::other("Linux required for project quotas"))
    }

    pub(super) fn used_blocks(_device: &CStr, _project: u32) -> io::Result<u64> {
        Err(io::Error::other("Linux required for project quotas"))
    }
}
