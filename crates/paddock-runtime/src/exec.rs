//! The part of process startup that runs in the forked child.
//!
//! Everything the child needs is prepared by the parent: strings are
//! already NUL-terminated, the cgroup control file is already open and the
//! namespace descriptors were opened at container creation. Between
//! `fork(2)` and `execve(2)` the child only issues system calls.
//!
//! The child calls `execve(2)` itself instead of returning to the standard
//! library, which would rebuild the environment in sorted order.

use std::ffi::{CString, c_char};
use std::fs::File;
use std::io::{self, Write as _};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use paddock_common::error::{PaddockError, Result};
use paddock_core::capability;

use crate::backend::Sandbox;

/// NUL-terminated strings and the pointer array `execve(2)` takes.
struct CStringArray {
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

// SAFETY: the pointers address heap buffers owned by `_strings`, which are
// never mutated or dropped while the array exists.
unsafe impl Send for CStringArray {}
// SAFETY: as above; the array is only read.
unsafe impl Sync for CStringArray {}

impl CStringArray {
    fn new(items: &[String]) -> Result<Self> {
        let strings = items.iter().map(|s| to_cstring(s)).collect::<Result<Vec<_>>>()?;
        let mut pointers: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        pointers.push(std::ptr::null());
        Ok(Self {
            _strings: strings,
            pointers,
        })
    }

    fn as_ptr(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }
}

/// Credentials the child switches to before exec.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Fully prepared child-side startup.
pub(crate) struct ExecPlan {
    program: CString,
    argv: CStringArray,
    envp: CStringArray,
    sandbox: Arc<Sandbox>,
    cgroup_procs: Option<File>,
    chroot_dir: Option<CString>,
    credentials: Option<Credentials>,
    workdir: CString,
    workdir_error: Vec<u8>,
}

impl ExecPlan {
    /// Prepares the child side of a launch.
    ///
    /// `program` and `workdir` are paths as the child sees them, after any
    /// chroot.
    pub(crate) fn new(
        program: &str,
        argv: &[String],
        envp: &[String],
        sandbox: Arc<Sandbox>,
        cgroup_procs: Option<File>,
        credentials: Option<Credentials>,
        workdir: &str,
    ) -> Result<Self> {
        let chroot_dir = if sandbox.chroot {
            Some(to_cstring(&sandbox.root.to_string_lossy())?)
        } else {
            None
        };
        Ok(Self {
            program: to_cstring(program)?,
            argv: CStringArray::new(argv)?,
            envp: CStringArray::new(envp)?,
            sandbox,
            cgroup_procs,
            chroot_dir,
            credentials,
            workdir: to_cstring(workdir)?,
            workdir_error: format!("paddock: cannot enter working directory {workdir}: ").into_bytes(),
        })
    }

    /// Runs in the forked child. Returns only on failure.
    ///
    /// Async-signal-safe: no allocation, no locks.
    pub(crate) fn run_in_child(&self) -> io::Result<()> {
        if let Some(procs) = &self.cgroup_procs {
            // Writing "0" moves the writing process itself.
            // SAFETY: writes a static buffer to an open descriptor.
            let rc = unsafe { libc::write(procs.as_raw_fd(), b"0".as_ptr().cast(), 1) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        // SAFETY: setsid has no preconditions; failure only means we already lead a session.
        let _ = unsafe { libc::setsid() };

        if let Some(namespaces) = &self.sandbox.namespaces {
            namespaces.enter()?;
        }

        if let Some(root) = &self.chroot_dir {
            // SAFETY: both paths are valid NUL-terminated strings.
            if unsafe { libc::chroot(root.as_ptr()) } != 0 || unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        capability::drop_bounding(&self.sandbox.dropped_capabilities)?;

        if let Some(creds) = self.credentials {
            let groups = [creds.gid];
            // SAFETY: one-element group list on the stack; plain id arguments.
            unsafe {
                if libc::setgroups(1, groups.as_ptr()) != 0
                    || libc::setgid(creds.gid) != 0
                    || libc::setuid(creds.uid) != 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        // SAFETY: valid NUL-terminated path.
        if unsafe { libc::chdir(self.workdir.as_ptr()) } != 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            let mut stderr = RawStderr;
            let _ = stderr.write_all(&self.workdir_error);
            let _ = stderr.write_all(errno_text(errno));
            let _ = stderr.write_all(b"\n");
            // SAFETY: terminates the child without running parent-owned destructors.
            unsafe { libc::_exit(1) };
        }

        // SAFETY: program, argv and envp are NUL-terminated and the arrays are
        // null-terminated; they stay alive because `self` outlives the call.
        unsafe { libc::execve(self.program.as_ptr(), self.argv.as_ptr(), self.envp.as_ptr()) };
        Err(io::Error::last_os_error())
    }
}

/// Unbuffered writer on fd 2.
struct RawStderr;

impl io::Write for RawStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: writes a borrowed buffer to fd 2.
        let rc = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), buf.len()) };
        usize::try_from(rc).map_err(|_| io::Error::last_os_error())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn errno_text(errno: i32) -> &'static [u8] {
    match errno {
        libc::ENOENT => b"No such file or directory",
        libc::EACCES => b"Permission denied",
        libc::ENOTDIR => b"Not a directory",
        libc::ELOOP => b"Too many levels of symbolic links",
        _ => b"cannot change directory",
    }
}

fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| PaddockError::Spawn {
        message: format!("value contains a NUL byte: {value:?}"),
    })
}
