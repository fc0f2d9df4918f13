//! Unified error type for the Paddock workspace.
//!
//! Runtime failures of a supervised process (non-zero exits, OOM kills,
//! `EDQUOT` on a write) are never represented here: they surface only as
//! process exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PaddockError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A container or process handle does not reference a live object.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Container creation failed; nothing was registered.
    #[error("container creation failed: {message}")]
    Creation {
        /// Description of the failed step.
        message: String,
    },

    /// The provisioned root filesystem already exceeds the hard disk ceiling.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// A caller-supplied handle is already registered.
    #[error("handle already exists: {handle}")]
    AlreadyExists {
        /// The conflicting handle.
        handle: String,
    },

    /// The server refuses more containers.
    #[error("container capacity exhausted ({max} containers)")]
    CapacityExhausted {
        /// Configured maximum.
        max: usize,
    },

    /// A process could not be started.
    #[error("failed to spawn process: {message}")]
    Spawn {
        /// Description of the spawn failure.
        message: String,
    },

    /// A limit update was rejected; the previous limit remains in effect.
    #[error("failed to apply limit: {message}")]
    LimitApplication {
        /// Description of the rejected update.
        message: String,
    },

    /// A network rule could not be programmed.
    #[error("network error: {message}")]
    Network {
        /// Description of the failure.
        message: String,
    },

    /// An isolation, cgroup, quota or rootfs backend reported a fault.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the fault.
        message: String,
    },

    /// A backend call did not complete in time.
    #[error("timed out waiting for {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl PaddockError {
    /// Shorthand for a missing container.
    #[must_use]
    pub fn container_not_found(handle: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "container",
            id: handle.into(),
        }
    }

    /// Shorthand for a backend fault carrying a displayable cause.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns `true` when the error means the handle is gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PaddockError>;
