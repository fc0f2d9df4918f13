//! Namespace holder process.
//!
//! The holder is forked from the server, unshares the container's
//! namespaces, sets the hostname, applies the mount plan and then idles in
//! `pause(2)` until killed at container destruction. It never execs, so
//! everything it does after `fork(2)` is async-signal-safe.

use std::io::Read;

use paddock_common::error::{PaddockError, Result};

use crate::filesystem::mount::MountPlan;

/// Setup stages reported back when the holder fails.
const STAGES: &[&str] = &["unshare", "sethostname", "mount", "close fds"];

/// A running holder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pid: u32,
    start_time: u64,
}

impl Holder {
    /// Re-identifies a holder recorded before a restart.
    #[must_use]
    pub const fn from_parts(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }

    /// Pid of the holder.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Kernel start time of the holder, in clock ticks since boot.
    #[must_use]
    pub const fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Whether `pid` still names this holder rather than a recycled pid.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        process_start_time(self.pid) == Some(self.start_time)
    }
}

#[cfg(target_os = "linux")]
impl Holder {
    /// Forks a holder owning fresh mount, UTS, IPC and network namespaces.
    ///
    /// Mount points of `mounts` must already exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the fork fails or the holder reports a failed
    /// setup stage.
    pub fn spawn(hostname: &str, mounts: &MountPlan) -> Result<Self> {
        use std::os::fd::IntoRawFd;

        use nix::fcntl::OFlag;
        use nix::unistd::{ForkResult, fork, pipe2};

        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|e| PaddockError::backend(format!("pipe: {e}")))?;

        // SAFETY: the child only performs async-signal-safe calls (unshare,
        // sethostname, mount, close, write, pause, _exit) and never returns
        // into Rust code that could allocate or take locks.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let status_fd = write_end.into_raw_fd();
                drop(read_end);
                let (stage, errno) = match holder_setup(hostname, mounts, status_fd) {
                    Ok(()) => (0u8, 0i32),
                    Err((stage, errno)) => (stage, errno),
                };
                let mut message = [0u8; 5];
                message[0] = stage;
                message[1..].copy_from_slice(&errno.to_le_bytes());
                // SAFETY: writing a stack buffer to our own pipe.
                let _ = unsafe { libc::write(HOLDER_STATUS_FD, message.as_ptr().cast(), message.len()) };
                if errno != 0 {
                    // SAFETY: terminating the forked child without unwinding.
                    unsafe { libc::_exit(1) };
                }
                loop {
                    // SAFETY: pause has no preconditions.
                    let _ = unsafe { libc::pause() };
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_end);
                let pid = child.as_raw().unsigned_abs();
                let mut message = [0u8; 5];
                let mut reader = std::fs::File::from(read_end);
                let status = reader.read_exact(&mut message);
                let errno = i32::from_le_bytes([message[1], message[2], message[3], message[4]]);
                if status.is_err() || errno != 0 {
                    reap(pid);
                    let stage = STAGES.get(usize::from(message[0])).copied().unwrap_or("startup");
                    let cause = if status.is_err() {
                        "holder exited before reporting".to_owned()
                    } else {
                        std::io::Error::from_raw_os_error(errno).to_string()
                    };
                    return Err(PaddockError::backend(format!("namespace holder {stage} failed: {cause}")));
                }
                let start_time = process_start_time(pid).unwrap_or(0);
                tracing::info!(pid, hostname, "namespace holder started");
                Ok(Self { pid, start_time })
            }
            Err(e) => Err(PaddockError::backend(format!("fork: {e}"))),
        }
    }

    /// Kills and reaps the holder, releasing its namespaces once no process remains in them.
    ///
    /// A holder that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill is refused.
    pub fn terminate(&self) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if !self.is_alive() {
            return Ok(());
        }
        let pid = Pid::from_raw(i32::try_from(self.pid).map_err(|_| PaddockError::backend("pid out of range"))?);
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(PaddockError::backend(format!("kill holder {}: {e}", self.pid))),
        }
        reap(self.pid);
        tracing::info!(pid = self.pid, "namespace holder terminated");
        Ok(())
    }
}

/// Descriptor the holder reports its status on after closing everything else.
#[cfg(target_os = "linux")]
const HOLDER_STATUS_FD: i32 = 3;

/// Runs in the forked child. Returns the failing stage index and errno.
#[cfg(target_os = "linux")]
fn holder_setup(hostname: &str, mounts: &MountPlan, status_fd: i32) -> std::result::Result<(), (u8, i32)> {
    use nix::sched::unshare;
    use nix::unistd::sethostname;

    let errno = |e: std::io::Error| e.raw_os_error().unwrap_or(libc::EIO);

    // SAFETY: duplicating our own descriptor onto a fixed slot.
    if status_fd != HOLDER_STATUS_FD && unsafe { libc::dup2(status_fd, HOLDER_STATUS_FD) } < 0 {
        return Err((3, std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)));
    }
    // Drop every inherited descriptor so pipes of other containers' processes
    // are not held open by the holder.
    // SAFETY: close_range only closes descriptors.
    let closed = unsafe { libc::syscall(libc::SYS_close_range, HOLDER_STATUS_FD + 1, u32::MAX, 0) };
    if closed != 0 {
        for fd in (HOLDER_STATUS_FD + 1)..4096 {
            // SAFETY: closing a possibly unused descriptor is harmless.
            let _ = unsafe { libc::close(fd) };
        }
    }

    unshare(super::holder_flags()).map_err(|e| (0, e as i32))?;
    sethostname(hostname).map_err(|e| (1, e as i32))?;
    mounts.apply().map_err(|e| (2, errno(e)))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn reap(pid: u32) {
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        let _ = waitpid(Pid::from_raw(raw), None);
    }
}

#[cfg(not(target_os = "linux"))]
impl Holder {
    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: namespaces require Linux.
    pub fn spawn(_hostname: &str, _mounts: &MountPlan) -> Result<Self> {
        Err(PaddockError::Config {
            message: "Linux required for native container operations".into(),
        })
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error: namespaces require Linux.
    pub fn terminate(&self) -> Result<()> {
        Err(PaddockError::Config {
            message: "Linux required for native container operations".into(),
        })
    }
}

/// Field 22 of `/proc/<pid>/stat`: start time in clock ticks since boot.
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}
