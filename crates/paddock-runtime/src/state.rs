//! Persistent state management.
//!
//! Maintains a JSON index of every live container and the host resources
//! it holds, so a restarted server can find and release what a previous
//! run left behind. The index is rewritten atomically on every change.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use paddock_common::error::{PaddockError, Result};
use paddock_common::types::{ContainerHandle, ContainerSpec, Limits};
use paddock_image::provider::ProvisionedRootfs;
use serde::{Deserialize, Serialize};

use crate::backend::SandboxRecord;
use crate::network::NetworkState;

/// Persistent record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Container handle.
    pub handle: ContainerHandle,
    /// Spec the container was created from.
    pub spec: ContainerSpec,
    /// Limits in effect.
    pub limits: Limits,
    /// Quota id of the writable layer.
    pub quota: Option<u32>,
    /// Provisioned root.
    pub rootfs: ProvisionedRootfs,
    /// Namespace holder identity.
    pub sandbox: SandboxRecord,
    /// Programmed network state.
    pub network: NetworkState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// On-disk layout of the index.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    containers: Vec<StateEntry>,
}

/// Loads the state index from disk. A missing file is an empty index.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<Vec<StateEntry>> {
    tracing::debug!(path = %path.display(), "loading state index");
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PaddockError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    let file: StateFile = serde_json::from_str(&raw)?;
    Ok(file.containers)
}

/// Persists the state index to disk atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(path: &Path, entries: &[StateEntry]) -> Result<()> {
    tracing::debug!(path = %path.display(), count = entries.len(), "saving state index");
    let io_err = |source| PaddockError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(&StateFile {
        containers: entries.to_vec(),
    })?;
    let staging = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&staging).map_err(io_err)?;
    file.write_all(&body).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    std::fs::rename(&staging, path).map_err(io_err)
}

/// In-memory copy of the index, written through on every change.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<ContainerHandle, StateEntry>>,
}

impl StateStore {
    /// Opens the index at `path`, returning the store and the entries a
    /// previous run left behind. The store itself starts empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the existing index cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<StateEntry>)> {
        let path = path.into();
        let leftovers = load_state(&path)?;
        Ok((
            Self {
                path,
                entries: Mutex::new(BTreeMap::new()),
            },
            leftovers,
        ))
    }

    /// Index file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds or replaces an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written; the entry is then
    /// not recorded.
    pub fn put(&self, entry: StateEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = entry.handle.clone();
        let previous = entries.insert(handle.clone(), entry);
        if let Err(e) = self.flush(&entries) {
            match previous {
                Some(previous) => {
                    let _ = entries.insert(handle, previous);
                }
                None => {
                    let _ = entries.remove(&handle);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Changes an existing entry in place. Unknown handles are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn update(&self, handle: &ContainerHandle, change: impl FnOnce(&mut StateEntry)) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(handle) else {
            return Ok(());
        };
        change(entry);
        self.flush(&entries)
    }

    /// Drops an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(handle).is_none() {
            return Ok(());
        }
        self.flush(&entries)
    }

    /// Writes the current (empty or not) index, replacing leftovers.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be written.
    pub fn persist(&self) -> Result<()> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.flush(&entries)
    }

    fn flush(&self, entries: &BTreeMap<ContainerHandle, StateEntry>) -> Result<()> {
        let list: Vec<StateEntry> = entries.values().cloned().collect();
        save_state(&self.path, &list)
    }
}
