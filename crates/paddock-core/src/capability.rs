//! Linux capability bounding-set reduction.
//!
//! Every container loses `CAP_SYS_RESOURCE`, which would otherwise let root
//! write past its disk quota. Unprivileged containers additionally lose the
//! capabilities that reach outside the container (mounting, module loading,
//! raw devices, clocks). Privileged containers keep those.

use std::io;

/// Linux capability identifiers, numbered as in `<linux/capability.h>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Capability {
    /// Reconfigure network interfaces and firewalls.
    NetAdmin = 12,
    /// Load kernel modules.
    SysModule = 16,
    /// Raw I/O on devices.
    SysRawio = 17,
    /// Trace arbitrary processes.
    SysPtrace = 19,
    /// Mount filesystems and much more.
    SysAdmin = 21,
    /// Reboot the host.
    SysBoot = 22,
    /// Override resource limits, including disk quotas.
    SysResource = 24,
    /// Set the system clock.
    SysTime = 25,
    /// Create device nodes.
    Mknod = 27,
    /// Configure the audit subsystem.
    AuditControl = 30,
    /// Override mandatory access control.
    MacOverride = 32,
    /// Configure mandatory access control.
    MacAdmin = 33,
}

const ALWAYS_DROPPED: &[Capability] = &[Capability::SysResource];

const UNPRIVILEGED_DROPPED: &[Capability] = &[
    Capability::NetAdmin,
    Capability::SysModule,
    Capability::SysRawio,
    Capability::SysPtrace,
    Capability::SysAdmin,
    Capability::SysBoot,
    Capability::SysTime,
    Capability::Mknod,
    Capability::AuditControl,
    Capability::MacOverride,
    Capability::MacAdmin,
];

/// Capabilities removed from the bounding set of every process in a container.
#[must_use]
pub fn dropped_for(privileged: bool) -> Vec<Capability> {
    let mut caps = ALWAYS_DROPPED.to_vec();
    if !privileged {
        caps.extend_from_slice(UNPRIVILEGED_DROPPED);
    }
    caps
}

/// Removes capabilities from the calling process's bounding set.
///
/// Async-signal-safe; meant for the window between `fork(2)` and
/// `execve(2)`, before credentials are switched. Capabilities the running
/// kernel does not know are skipped.
///
/// # Errors
///
/// Returns the OS error of the first failing `prctl(2)`.
#[cfg(target_os = "linux")]
pub fn drop_bounding(caps: &[Capability]) -> io::Result<()> {
    for cap in caps {
        // SAFETY: PR_CAPBSET_DROP takes a capability number and no pointers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, *cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                continue;
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: capability bounding sets require Linux.
#[cfg(not(target_os = "linux"))]
pub fn drop_bounding(_caps: &[Capability]) -> io::Result<()> {
    Err(io::Error::other("Linux required for capability management"))
}
