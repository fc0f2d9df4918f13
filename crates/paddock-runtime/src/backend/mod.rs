//! Isolation backends: how a container's processes are separated from the host.
//!
//! A backend turns a provisioned root filesystem into a [`Sandbox`], the
//! description the supervisor needs to place a new process inside the
//! container. Blocking backend calls are funnelled through [`call`] so
//! none of them can stall the engine past the configured timeout.

pub mod host;
pub mod linux;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use paddock_common::error::{PaddockError, Result};
use paddock_common::types::ContainerHandle;
use paddock_core::capability::Capability;
use paddock_core::namespace::NamespaceSet;
use paddock_core::namespace::holder::Holder;
use paddock_image::provider::ProvisionedRootfs;
use serde::{Deserialize, Serialize};

pub use host::HostIsolation;
pub use linux::LinuxIsolation;

/// Everything needed to start a process inside one container.
#[derive(Debug)]
pub struct Sandbox {
    /// Host path of the directory the container sees as `/`.
    pub root: PathBuf,
    /// Whether processes `chroot(2)` into `root`.
    pub chroot: bool,
    /// Whether processes switch to the requested user.
    pub switch_user: bool,
    /// Namespaces new processes join, if any.
    pub namespaces: Option<NamespaceSet>,
    /// Process owning the namespaces.
    pub holder: Option<Holder>,
    /// Capabilities removed from the bounding set of every process.
    pub dropped_capabilities: Vec<Capability>,
}

impl Sandbox {
    /// Durable part of the sandbox, enough to tear it down after a restart.
    #[must_use]
    pub fn record(&self) -> SandboxRecord {
        SandboxRecord {
            holder_pid: self.holder.map(|h| h.pid()),
            holder_start_time: self.holder.map(|h| h.start_time()),
        }
    }
}

/// Persisted identity of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRecord {
    /// Pid of the namespace holder.
    pub holder_pid: Option<u32>,
    /// Kernel start time of the holder, guarding against pid reuse.
    pub holder_start_time: Option<u64>,
}

impl SandboxRecord {
    /// The recorded holder, if the sandbox had one.
    #[must_use]
    pub fn holder(&self) -> Option<Holder> {
        Some(Holder::from_parts(self.holder_pid?, self.holder_start_time?))
    }
}

/// Isolation strategy for containers.
pub trait IsolationBackend: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Builds the sandbox of a new container.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespaces or mounts cannot be set up.
    /// Nothing is left behind on failure.
    fn create(
        &self,
        handle: &ContainerHandle,
        rootfs: &ProvisionedRootfs,
        privileged: bool,
    ) -> Result<Sandbox>;

    /// Tears down a sandbox from its durable record. Already gone is success.
    ///
    /// # Errors
    ///
    /// Returns an error if a live holder cannot be stopped.
    fn reclaim(&self, record: &SandboxRecord) -> Result<()>;

    /// Tears down a live sandbox.
    ///
    /// # Errors
    ///
    /// Same as [`IsolationBackend::reclaim`].
    fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        self.reclaim(&sandbox.record())
    }
}

/// Information about the host's isolation facilities.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    /// Host operating system name.
    pub os: String,
    /// Host CPU architecture.
    pub arch: String,
    /// Whether namespaces, cgroups and quotas can be used.
    pub native_available: bool,
    /// Whether `iptables` and `ip` are installed.
    pub firewall_available: bool,
}

/// Returns information about the current platform.
#[must_use]
pub fn platform_info() -> PlatformInfo {
    PlatformInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        native_available: cfg!(target_os = "linux") && nix::unistd::geteuid().is_root(),
        firewall_available: which::which("iptables").is_ok() && which::which("ip").is_ok(),
    }
}

/// Runs a blocking backend call on the blocking pool, bounded by `timeout`.
///
/// On timeout the call keeps running in the background and its result is
/// dropped.
///
/// # Errors
///
/// Returns the call's own error, [`PaddockError::Timeout`] if it did not
/// finish in time, or a backend error if it panicked.
pub async fn call<T, F>(operation: &str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    call_or_undo(operation, timeout, f, drop).await
}

/// Like [`call`], but a call that succeeds after its caller timed out is
/// handed to `undo` on the blocking pool, so whatever it acquired is
/// released instead of leaked.
///
/// # Errors
///
/// Same as [`call`].
pub async fn call_or_undo<T, F, U>(operation: &str, timeout: Duration, f: F, undo: U) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    U: FnOnce(T) + Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(PaddockError::backend(format!("{operation} aborted: {e}"))),
        Err(_) => {
            tracing::warn!(operation, timeout_ms = timeout.as_millis(), "backend call timed out");
            let late = operation.to_owned();
            drop(tokio::spawn(async move {
                if let Ok(Ok(value)) = task.await {
                    tracing::warn!(operation = %late, "timed-out backend call finished late, undoing it");
                    let _ = tokio::task::spawn_blocking(move || undo(value)).await;
                }
            }));
            Err(PaddockError::Timeout {
                operation: operation.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_info_names_os_and_arch() {
        let info = platform_info();
        assert!(!info.os.is_empty());
        assert!(!info.arch.is_empty());
    }

    #[test]
    fn record_without_holder_has_no_holder() {
        let record = SandboxRecord::default();
        assert!(record.holder().is_none());
        let record = SandboxRecord {
            holder_pid: Some(42),
            holder_start_time: Some(7),
        };
        assert_eq!(record.holder(), Some(Holder::from_parts(42, 7)));
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result = call("sleepy", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PaddockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn late_results_are_undone() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result = call_or_undo(
            "late",
            Duration::from_millis(20),
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(11)
            },
            move |value| {
                let _ = tx.send(value);
            },
        )
        .await;
        assert!(matches!(result, Err(PaddockError::Timeout { .. })));
        let undone = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
        assert_eq!(undone, 11);
    }

    #[tokio::test]
    async fn timely_results_are_not_undone() {
        let result = call_or_undo("timely", Duration::from_secs(5), || Ok(3), |_| unreachable!()).await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn call_passes_results_through() {
        let value = call("quick", Duration::from_secs(5), || Ok(7)).await.unwrap();
        assert_eq!(value, 7);
        let err = call::<(), _>("failing", Duration::from_secs(5), || {
            Err(PaddockError::backend("boom"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, PaddockError::Backend { .. }));
    }
}
