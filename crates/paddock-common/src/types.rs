//! Domain primitive types used across the Paddock workspace.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// String-keyed container properties. Keys are unique; iteration is sorted.
pub type Properties = BTreeMap<String, String>;

/// Unique identifier for a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    /// Creates a handle from a caller-supplied string.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Generates a random handle (12 lowercase hex characters).
    ///
    /// Short enough to double as the container hostname.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(12);
        Self(id)
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a process within the server. Never reused while the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Wraps a raw process identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory ceiling for a container. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    /// Hard ceiling in bytes; exceeding it invokes the OOM killer.
    pub limit_in_bytes: u64,
}

/// Which bytes count against a container's disk ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskLimitScope {
    /// Image bytes plus bytes written by the container.
    #[default]
    Total,
    /// Only bytes written by the container.
    Exclusive,
}

impl fmt::Display for DiskLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => write!(f, "total"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Disk ceilings for a container. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLimits {
    /// Advisory threshold in bytes.
    pub byte_soft: u64,
    /// Enforced threshold in bytes; writes past it fail.
    pub byte_hard: u64,
    /// Accounting scope, fixed at creation.
    pub scope: DiskLimitScope,
}

/// Resource limits for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Memory ceiling.
    pub memory: MemoryLimits,
    /// Disk ceilings.
    pub disk: DiskLimits,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSpec {
    /// Caller-chosen handle; generated when absent.
    pub handle: Option<String>,
    /// Rootfs source: empty for the default rootfs, `file:///dir` or `tar:///archive`.
    pub rootfs: String,
    /// Whether the container runs with extended privileges.
    pub privileged: bool,
    /// Initial properties.
    pub properties: Properties,
    /// Ordered `NAME=VALUE` entries given to every process.
    pub env: Vec<String>,
    /// Initial limits.
    pub limits: Limits,
}

/// Description of a process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    /// Executable path or name looked up on `PATH`.
    pub path: String,
    /// Arguments, excluding the program name.
    pub args: Vec<String>,
    /// User name or numeric uid; root when absent.
    pub user: Option<String>,
    /// Working directory inside the container; the user's home when absent.
    pub dir: Option<String>,
    /// Ordered `NAME=VALUE` entries overriding the container environment.
    pub env: Vec<String>,
}

impl ProcessSpec {
    /// Starts a spec for the given executable.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs as the given user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Runs in the given working directory.
    #[must_use]
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Adds one `NAME=VALUE` environment entry.
    #[must_use]
    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }
}

/// Signals deliverable to a process leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// `SIGTERM`; the process may trap it.
    Terminate,
    /// `SIGKILL`.
    Kill,
    /// `SIGINT`.
    Interrupt,
    /// `SIGQUIT`.
    Quit,
    /// `SIGHUP`.
    Hangup,
    /// `SIGUSR1`.
    User1,
    /// `SIGUSR2`.
    User2,
}

/// Lifecycle state of a container as reported by `info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Accepting operations.
    Active,
    /// Teardown in progress; new processes are refused.
    Destroying,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

/// Splits a `NAME=VALUE` entry. Returns `None` when there is no `=` or the name is empty.
#[must_use]
pub fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    let (name, value) = entry.split_once('=')?;
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_handles_are_short_and_distinct() {
        let a = ContainerHandle::generate();
        let b = ContainerHandle::generate();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn default_disk_scope_is_total() {
        assert_eq!(DiskLimits::default().scope, DiskLimitScope::Total);
    }

    #[test]
    fn process_spec_builder_accumulates() {
        let spec = ProcessSpec::new("sh")
            .args(["-c", "echo hi"])
            .user("alice")
            .dir("/tmp")
            .env("A=1");
        assert_eq!(spec.args, vec!["-c", "echo hi"]);
        assert_eq!(spec.user.as_deref(), Some("alice"));
        assert_eq!(spec.dir.as_deref(), Some("/tmp"));
        assert_eq!(spec.env, vec!["A=1"]);
    }

    #[test]
    fn env_entries_split_on_first_equals() {
        assert_eq!(split_env_entry("A=b=c"), Some(("A", "b=c")));
        assert_eq!(split_env_entry("EMPTY="), Some(("EMPTY", "")));
        assert_eq!(split_env_entry("=x"), None);
        assert_eq!(split_env_entry("novalue"), None);
    }

    #[test]
    fn container_spec_deserializes_with_defaults() {
        let spec: ContainerSpec =
            serde_json::from_str(r#"{"limits":{"disk":{"byte_hard":10,"byte_soft":0,"scope":"exclusive"},"memory":{"limit_in_bytes":0}}}"#)
                .unwrap();
        assert!(spec.handle.is_none());
        assert_eq!(spec.limits.disk.scope, DiskLimitScope::Exclusive);
        assert_eq!(spec.limits.disk.byte_hard, 10);
    }
}
