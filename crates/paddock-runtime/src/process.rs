//! Process supervision.
//!
//! A [`Supervisor`] starts processes inside a container sandbox and gives
//! back a [`Process`] handle. Each process gets one reaper task that owns
//! the child, records its exit status, and then gives the output relays a
//! short drain window before publishing the exit code. Exit codes follow
//! shell convention: a process killed by signal `N` exits with `128 + N`.
//!
//! Only the process leader is ever signalled or awaited. Background
//! children it leaves behind do not delay the exit code; they are cleaned
//! up when the container is destroyed.

use std::fs::OpenOptions;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use paddock_common::error::{PaddockError, Result};
use paddock_common::types::{ProcessId, ProcessSpec, Signal};
use paddock_core::filesystem::resolve::resolve_in_root;
use paddock_core::user::{self, UserEntry};
use tokio::sync::watch;

use crate::backend::Sandbox;
use crate::diagnostics::WorkerTracker;
use crate::env;
use crate::exec::{Credentials, ExecPlan};
use crate::stream::{self, ProcessIo};

/// Exit code reported when the exit status itself could not be collected.
const UNKNOWN_EXIT: i32 = 255;

/// Starts and tracks processes.
#[derive(Debug)]
pub struct Supervisor {
    workers: WorkerTracker,
    stream_drain: Duration,
    next_id: AtomicU64,
}

/// Where and how one process is launched.
#[derive(Debug, Clone, Copy)]
pub struct Launch<'a> {
    /// Sandbox of the container.
    pub sandbox: &'a Arc<Sandbox>,
    /// `cgroup.procs` of the container's cgroup, if it has one.
    pub cgroup_procs: Option<&'a Path>,
    /// Environment every process of the container starts from.
    pub container_env: &'a [String],
}

impl Supervisor {
    /// Creates a supervisor whose output relays get `stream_drain` to
    /// reach EOF once a leader has exited.
    #[must_use]
    pub fn new(workers: WorkerTracker, stream_drain: Duration) -> Self {
        Self {
            workers,
            stream_drain,
            next_id: AtomicU64::new(1),
        }
    }

    /// Tracker of this supervisor's tasks.
    #[must_use]
    pub const fn workers(&self) -> &WorkerTracker {
        &self.workers
    }

    /// Starts `spec` inside the sandbox of `launch`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Spawn`] if the user, working directory or
    /// executable cannot be resolved, or if the kernel refuses to start the
    /// process.
    pub fn spawn(&self, launch: Launch<'_>, spec: &ProcessSpec, io: ProcessIo) -> Result<Process> {
        if spec.path.is_empty() {
            return Err(PaddockError::Spawn {
                message: "no executable given".into(),
            });
        }
        env::validate(&spec.env, |message| PaddockError::Spawn { message })?;

        let sandbox = launch.sandbox;
        let user = if sandbox.switch_user {
            user::lookup(&sandbox.root, spec.user.as_deref())?
        } else {
            host_user()
        };
        let environment = env::with_defaults(env::merge(launch.container_env, &spec.env), &user);

        let default_dir = if sandbox.switch_user { user.home.as_str() } else { "/" };
        let dir = spec.dir.as_deref().unwrap_or(default_dir);
        let host_dir = prepare_workdir(sandbox, dir, &user)?;
        let child_dir = if sandbox.chroot {
            dir.to_owned()
        } else {
            host_dir.to_string_lossy().into_owned()
        };

        let program = resolve_program(sandbox, &spec.path, &environment, Path::new(&child_dir))?;
        let mut argv = Vec::with_capacity(spec.args.len() + 1);
        argv.push(spec.path.clone());
        argv.extend(spec.args.iter().cloned());

        let cgroup_procs = match launch.cgroup_procs {
            Some(path) => Some(OpenOptions::new().write(true).open(path).map_err(|e| PaddockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?),
            None => None,
        };
        let credentials = sandbox.switch_user.then_some(Credentials {
            uid: user.uid,
            gid: user.gid,
        });
        let plan = ExecPlan::new(
            &program,
            &argv,
            &environment,
            Arc::clone(sandbox),
            cgroup_procs,
            credentials,
            &child_dir,
        )?;

        let mut command = tokio::process::Command::new(&program);
        let _ = command
            .stdin(if io.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(if io.stdout.is_some() { Stdio::piped() } else { Stdio::null() })
            .stderr(if io.stderr.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(false);
        // SAFETY: `run_in_child` is async-signal-safe: it only issues system
        // calls on data prepared before the fork.
        unsafe {
            let _ = command.pre_exec(move || plan.run_in_child());
        }

        let mut child = command.spawn().map_err(|e| PaddockError::Spawn {
            message: format!("{}: {e}", spec.path),
        })?;
        let pid = child.id().ok_or_else(|| PaddockError::Spawn {
            message: format!("{}: exited before it could be tracked", spec.path),
        })?;
        let id = ProcessId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pidfd = open_pidfd(pid);
        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut relays = Vec::with_capacity(2);
        if let (Some(pipe), Some(sink)) = (child.stdout.take(), io.stdout) {
            let guard = self.workers.track(format!("stdout relay process={id} pid={pid}"));
            relays.push(stream::relay_output(pipe, sink, guard));
        }
        if let (Some(pipe), Some(sink)) = (child.stderr.take(), io.stderr) {
            let guard = self.workers.track(format!("stderr relay process={id} pid={pid}"));
            relays.push(stream::relay_output(pipe, sink, guard));
        }
        if let (Some(pipe), Some(source)) = (child.stdin.take(), io.stdin) {
            let guard = self.workers.track(format!("stdin relay process={id} pid={pid}"));
            stream::relay_input(source, pipe, exit_rx.clone(), guard);
        }

        let reaper_guard = self.workers.track(format!("reaper process={id} pid={pid}"));
        let drain = self.stream_drain;
        let leader_exited = Arc::clone(&exited);
        drop(tokio::spawn(async move {
            let _guard = reaper_guard;
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(process = %id, pid, error = %e, "failed to collect exit status");
                    UNKNOWN_EXIT
                }
            };
            leader_exited.store(true, Ordering::Release);
            let drained = async {
                for relay in relays {
                    let _ = relay.await;
                }
            };
            if tokio::time::timeout(drain, drained).await.is_err() {
                tracing::debug!(process = %id, pid, "output still open after exit, relays continue");
            }
            tracing::info!(process = %id, pid, code, "process exited");
            let _ = exit_tx.send_replace(Some(code));
        }));

        tracing::info!(process = %id, pid, path = %spec.path, dir = %dir, user = %user.name, "process started");
        Ok(Process {
            inner: Arc::new(ProcessInner {
                id,
                pid,
                pidfd,
                exited,
                exit: exit_rx,
            }),
        })
    }
}

#[derive(Debug)]
struct ProcessInner {
    id: ProcessId,
    pid: u32,
    pidfd: Option<OwnedFd>,
    exited: Arc<AtomicBool>,
    exit: watch::Receiver<Option<i32>>,
}

/// Handle to a supervised process. Clones refer to the same process.
#[derive(Debug, Clone)]
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    /// Server-assigned id.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    /// Host pid of the leader.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Exit code, if the process has finished and its output has drained.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit.borrow()
    }

    /// Whether the leader is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.exited.load(Ordering::Acquire)
    }

    /// Waits for the leader to exit and its output to drain.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the reaper stopped without reporting.
    pub async fn wait(&self) -> Result<i32> {
        let mut exit = self.inner.exit.clone();
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| PaddockError::backend(format!("reaper of process {} stopped", self.inner.id)))?;
        code.ok_or_else(|| PaddockError::backend("exit code missing"))
    }

    /// Delivers `signal` to the leader. Signalling an exited process does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::PermissionDenied`] or a backend error if the
    /// kernel refuses the signal.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let signo = signal_number(signal);
        tracing::debug!(process = %self.inner.id, pid = self.inner.pid, ?signal, "signalling process");
        if let Some(pidfd) = &self.inner.pidfd {
            return send_via_pidfd(pidfd, signo);
        }
        if !self.is_running() {
            return Ok(());
        }
        let pid = i32::try_from(self.inner.pid).map_err(|_| PaddockError::backend("pid out of range"))?;
        // SAFETY: kill takes plain integers; the exited flag guards against a recycled pid.
        let rc = unsafe { libc::kill(pid, signo) };
        if rc == 0 {
            Ok(())
        } else {
            signal_error(&std::io::Error::last_os_error())
        }
    }
}

/// Kills every member of the process group `pgid`. Each leader starts its
/// own session, so its pid names the group its background children share.
/// A group with no members left is ignored.
pub(crate) fn kill_group(pgid: u32) -> Result<()> {
    let pgid = libc::pid_t::try_from(pgid).map_err(|_| PaddockError::backend("pgid out of range"))?;
    // SAFETY: kill takes plain integers; a negative pid addresses a process group.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        signal_error(&std::io::Error::last_os_error())
    }
}

fn send_via_pidfd(pidfd: &OwnedFd, signo: i32) -> Result<()> {
    use std::os::fd::AsRawFd;

    // SAFETY: the descriptor is a live pidfd and no siginfo is passed.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            signo,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        signal_error(&std::io::Error::last_os_error())
    }
}

fn signal_error(err: &std::io::Error) -> Result<()> {
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        Some(libc::EPERM) => Err(PaddockError::PermissionDenied {
            message: err.to_string(),
        }),
        _ => Err(PaddockError::backend(format!("signal delivery failed: {err}"))),
    }
}

/// Opens a pidfd so later signals cannot hit a recycled pid.
fn open_pidfd(pid: u32) -> Option<OwnedFd> {
    let pid = libc::pid_t::try_from(pid).ok()?;
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor.
    let rc = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
    let fd = RawFd::try_from(rc).ok().filter(|fd| *fd >= 0)?;
    // SAFETY: the kernel just returned this descriptor and nothing else owns it.
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

const fn signal_number(signal: Signal) -> i32 {
    match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
        Signal::Interrupt => libc::SIGINT,
        Signal::Quit => libc::SIGQUIT,
        Signal::Hangup => libc::SIGHUP,
        Signal::User1 => libc::SIGUSR1,
        Signal::User2 => libc::SIGUSR2,
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(UNKNOWN_EXIT)
}

/// The server's own user, for sandboxes that do not switch users.
fn host_user() -> UserEntry {
    let uid = nix::unistd::geteuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(entry)) => UserEntry {
            name: entry.name,
            uid: entry.uid.as_raw(),
            gid: entry.gid.as_raw(),
            home: entry.dir.to_string_lossy().into_owned(),
        },
        _ => UserEntry {
            name: uid.to_string(),
            uid: uid.as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            home: "/".into(),
        },
    }
}

/// Makes sure the working directory exists, creating missing components
/// owned by `user`. Returns its host path.
fn prepare_workdir(sandbox: &Sandbox, dir: &str, user: &UserEntry) -> Result<PathBuf> {
    let host_dir = resolve_in_root(&sandbox.root, Path::new(dir)).ok_or_else(|| PaddockError::Spawn {
        message: format!("working directory {dir}: too many levels of symbolic links"),
    })?;
    if host_dir.exists() {
        return Ok(host_dir);
    }

    let missing: Vec<PathBuf> = host_dir
        .ancestors()
        .take_while(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();
    std::fs::create_dir_all(&host_dir).map_err(|e| PaddockError::Io {
        path: host_dir.clone(),
        source: e,
    })?;
    if sandbox.switch_user {
        for path in missing.iter().rev() {
            nix::unistd::chown(
                path,
                Some(nix::unistd::Uid::from_raw(user.uid)),
                Some(nix::unistd::Gid::from_raw(user.gid)),
            )
            .map_err(|e| PaddockError::Spawn {
                message: format!("chown {}: {e}", path.display()),
            })?;
        }
    }
    tracing::debug!(dir = %host_dir.display(), created = missing.len(), "working directory created");
    Ok(host_dir)
}

/// Finds the executable for `path` and returns it as the child will see it.
fn resolve_program(sandbox: &Sandbox, path: &str, environment: &[String], child_dir: &Path) -> Result<String> {
    let lookup_root = if sandbox.chroot { sandbox.root.as_path() } else { Path::new("/") };
    let candidates: Vec<PathBuf> = if path.contains('/') {
        vec![child_dir.join(path)]
    } else {
        env::lookup(environment, "PATH")
            .unwrap_or_default()
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| child_dir.join(dir).join(path))
            .collect()
    };

    candidates
        .into_iter()
        .find(|candidate| resolve_in_root(lookup_root, candidate).is_some_and(|host| is_executable(&host)))
        .map(|candidate| candidate.to_string_lossy().into_owned())
        .ok_or_else(|| PaddockError::Spawn {
            message: format!("executable not found: {path}"),
        })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::OutputBuffer;

    fn host_sandbox(root: &Path) -> Arc<Sandbox> {
        Arc::new(Sandbox {
            root: root.to_path_buf(),
            chroot: false,
            switch_user: false,
            namespaces: None,
            holder: None,
            dropped_capabilities: Vec::new(),
        })
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(WorkerTracker::new(), Duration::from_millis(250))
    }

    fn launch<'a>(sandbox: &'a Arc<Sandbox>, env: &'a [String]) -> Launch<'a> {
        Launch {
            sandbox,
            cgroup_procs: None,
            container_env: env,
        }
    }

    #[test]
    fn created_workdir_components_belong_to_the_user() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("home")).unwrap();
        let existing = std::fs::metadata(dir.path().join("home")).unwrap();
        let (uid, gid) = if nix::unistd::getuid().is_root() {
            (4242, 4242)
        } else {
            (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
        };
        let user = UserEntry {
            name: "worker".into(),
            uid,
            gid,
            home: "/home/worker".into(),
        };
        let sandbox = Sandbox {
            root: dir.path().to_path_buf(),
            chroot: true,
            switch_user: true,
            namespaces: None,
            holder: None,
            dropped_capabilities: Vec::new(),
        };

        let host_dir = prepare_workdir(&sandbox, "/home/worker/jobs/1", &user).unwrap();
        assert_eq!(host_dir, dir.path().join("home/worker/jobs/1"));
        for created in ["home/worker", "home/worker/jobs", "home/worker/jobs/1"] {
            let meta = std::fs::metadata(dir.path().join(created)).unwrap();
            assert_eq!((meta.uid(), meta.gid()), (uid, gid), "{created}");
        }
        let home = std::fs::metadata(dir.path().join("home")).unwrap();
        assert_eq!((home.uid(), home.gid()), (existing.uid(), existing.gid()));

        assert_eq!(prepare_workdir(&sandbox, "/home/worker/jobs/1", &user).unwrap(), host_dir);
    }

    #[test]
    fn signals_map_to_shell_exit_codes() {
        assert_eq!(128 + signal_number(Signal::Kill), 137);
        assert_eq!(128 + signal_number(Signal::Terminate), 143);
    }

    #[test]
    fn programs_resolve_through_path_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("opt/tools");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join("tool"), b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(bin.join("tool"), std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(bin.join("data"), b"").unwrap();
        let sandbox = Sandbox {
            root: dir.path().to_path_buf(),
            chroot: true,
            switch_user: false,
            namespaces: None,
            holder: None,
            dropped_capabilities: Vec::new(),
        };
        let env = vec!["PATH=/usr/bin:/opt/tools".to_owned()];

        let found = resolve_program(&sandbox, "tool", &env, Path::new("/")).unwrap();
        assert_eq!(found, "/opt/tools/tool");
        assert!(resolve_program(&sandbox, "data", &env, Path::new("/")).is_err());
        assert!(resolve_program(&sandbox, "/opt/tools/missing", &env, Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn exit_code_and_output_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let stdout = OutputBuffer::new();
        let spec = ProcessSpec::new("sh").args(["-c", "echo hi; exit 3"]);

        let process = supervisor()
            .spawn(launch(&sandbox, &[]), &spec, ProcessIo::new().with_stdout(stdout.clone()))
            .unwrap();
        assert_eq!(process.wait().await.unwrap(), 3);
        assert_eq!(stdout.text(), "hi\n");
        assert_eq!(process.exit_code(), Some(3));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn killed_processes_exit_with_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let spec = ProcessSpec::new("sleep").arg("30");

        let process = supervisor().spawn(launch(&sandbox, &[]), &spec, ProcessIo::new()).unwrap();
        process.signal(Signal::Kill).unwrap();
        assert_eq!(process.wait().await.unwrap(), 137);
        process.signal(Signal::Terminate).unwrap();
    }

    #[tokio::test]
    async fn stdin_is_fed_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let stdout = OutputBuffer::new();
        let io = ProcessIo::new()
            .with_stdin(std::io::Cursor::new(b"from stdin".to_vec()))
            .with_stdout(stdout.clone());

        let process = supervisor()
            .spawn(launch(&sandbox, &[]), &ProcessSpec::new("cat"), io)
            .unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);
        assert_eq!(stdout.text(), "from stdin");
    }

    #[tokio::test]
    async fn missing_executables_fail_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let err = supervisor()
            .spawn(launch(&sandbox, &[]), &ProcessSpec::new("does-not-exist-anywhere"), ProcessIo::new())
            .unwrap_err();
        assert!(matches!(err, PaddockError::Spawn { .. }));
    }

    #[tokio::test]
    async fn host_working_directories_live_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = host_sandbox(dir.path());
        let stdout = OutputBuffer::new();
        let spec = ProcessSpec::new("pwd").dir("/work/nested");

        let process = supervisor()
            .spawn(launch(&sandbox, &[]), &spec, ProcessIo::new().with_stdout(stdout.clone()))
            .unwrap();
        assert_eq!(process.wait().await.unwrap(), 0);
        assert!(dir.path().join("work/nested").is_dir());
        assert!(stdout.text().trim_end().ends_with("/work/nested"));
    }
}
