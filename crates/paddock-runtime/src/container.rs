//! A live container and the per-container state guarded by its own locks.
//!
//! The lifecycle gate fences process starts against destroy: `run` holds
//! it shared while spawning, destroy takes it exclusively just long enough
//! to flip the state to `Destroying`. Limit updates queue on their own
//! lock so each one applies and records its limits as a unit.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use paddock_common::error::{PaddockError, Result};
use paddock_common::network::PortMapping;
use paddock_common::types::{ContainerHandle, ContainerSpec, ContainerState, Limits, ProcessId, Properties};
use paddock_image::provider::ProvisionedRootfs;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, RwLock, RwLockReadGuard};

use crate::backend::Sandbox;
use crate::limiter::LimiterState;
use crate::network::NetworkState;
use crate::process::Process;
use crate::state::StateEntry;

/// Snapshot of a container as reported by `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container handle.
    pub handle: ContainerHandle,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Current properties.
    pub properties: Properties,
    /// Ids of processes still running.
    pub process_ids: Vec<ProcessId>,
    /// Address of the container, if it has its own network.
    pub container_ip: Option<Ipv4Addr>,
    /// Address of the host side of the container network.
    pub host_ip: Option<Ipv4Addr>,
    /// Host path of the container root.
    pub container_path: PathBuf,
    /// Live NetIn mappings.
    pub mapped_ports: Vec<PortMapping>,
    /// Limits in effect.
    pub limits: Limits,
    /// Notable events, such as `out of memory`.
    pub events: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A registered container.
#[derive(Debug)]
pub struct Container {
    handle: ContainerHandle,
    spec: ContainerSpec,
    rootfs: ProvisionedRootfs,
    sandbox: Arc<Sandbox>,
    created_at: DateTime<Utc>,
    gate: RwLock<()>,
    limit_updates: AsyncMutex<()>,
    state: Mutex<ContainerState>,
    properties: Mutex<Properties>,
    limiter: Mutex<LimiterState>,
    processes: Mutex<BTreeMap<ProcessId, Process>>,
    groups: Mutex<BTreeSet<u32>>,
    network: Mutex<NetworkState>,
}

impl Container {
    /// Assembles a container from its provisioned parts.
    #[must_use]
    pub fn new(
        handle: ContainerHandle,
        spec: ContainerSpec,
        rootfs: ProvisionedRootfs,
        sandbox: Sandbox,
        limiter: LimiterState,
        network: NetworkState,
    ) -> Self {
        let properties = spec.properties.clone();
        Self {
            handle,
            spec,
            rootfs,
            sandbox: Arc::new(sandbox),
            created_at: Utc::now(),
            gate: RwLock::new(()),
            limit_updates: AsyncMutex::new(()),
            state: Mutex::new(ContainerState::Active),
            properties: Mutex::new(properties),
            limiter: Mutex::new(limiter),
            processes: Mutex::new(BTreeMap::new()),
            groups: Mutex::new(BTreeSet::new()),
            network: Mutex::new(network),
        }
    }

    /// Container handle.
    #[must_use]
    pub const fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Spec the container was created from.
    #[must_use]
    pub const fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// Provisioned root.
    #[must_use]
    pub const fn rootfs(&self) -> &ProvisionedRootfs {
        &self.rootfs
    }

    /// Sandbox processes are started in.
    #[must_use]
    pub const fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Holds off destroy while a process is being started.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] once destroy has begun.
    pub(crate) async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self.gate.read().await;
        if self.state() == ContainerState::Destroying {
            return Err(PaddockError::container_not_found(self.handle.as_str()));
        }
        Ok(guard)
    }

    /// Held from reading the current limits until the new ones are stored.
    pub(crate) async fn updating_limits(&self) -> AsyncMutexGuard<'_, ()> {
        self.limit_updates.lock().await
    }

    /// Marks the container as being destroyed once in-flight starts finish.
    /// Returns `false` if another destroy got there first.
    pub(crate) async fn begin_destroy(&self) -> bool {
        let _fence = self.gate.write().await;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == ContainerState::Destroying {
            return false;
        }
        *state = ContainerState::Destroying;
        true
    }

    /// All properties.
    #[must_use]
    pub fn properties(&self) -> Properties {
        self.properties.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// One property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Sets a property, replacing any previous value.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        let _ = self
            .properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Removes a property. Returns whether it existed.
    pub fn remove_property(&self, key: &str) -> bool {
        self.properties
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Whether every filter entry is present with the same value.
    #[must_use]
    pub fn matches(&self, filter: &Properties) -> bool {
        let properties = self.properties.lock().unwrap_or_else(PoisonError::into_inner);
        filter.iter().all(|(k, v)| properties.get(k) == Some(v))
    }

    /// Limiter state, locked.
    pub(crate) fn limiter(&self) -> MutexGuard<'_, LimiterState> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Network state, locked.
    pub(crate) fn network(&self) -> MutexGuard<'_, NetworkState> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a started process and forgets processes that have exited.
    ///
    /// The leader's process group is remembered until destroy, since
    /// background children outlive the leader.
    pub(crate) fn track(&self, process: Process) {
        let _ = self
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(process.pid());
        let mut processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes.retain(|_, p| p.exit_code().is_none());
        let _ = processes.insert(process.id(), process);
    }

    /// Process groups started in this container, one per process leader.
    pub(crate) fn process_groups(&self) -> Vec<u32> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// A tracked process.
    #[must_use]
    pub fn process(&self, id: ProcessId) -> Option<Process> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Every tracked process, running or not.
    #[must_use]
    pub fn processes(&self) -> Vec<Process> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of processes whose leader is still running.
    #[must_use]
    pub fn running_processes(&self) -> usize {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|p| p.is_running())
            .count()
    }

    /// Snapshot for `info`. `oom_kills` comes from the memory cgroup.
    #[must_use]
    pub fn info(&self, oom_kills: u64) -> ContainerInfo {
        let network = self.network().clone();
        let limits = self.limiter().limits;
        let process_ids = self
            .processes()
            .into_iter()
            .filter(Process::is_running)
            .map(|p| p.id())
            .collect();
        let mut events = Vec::new();
        if oom_kills > 0 {
            events.push("out of memory".to_owned());
        }
        ContainerInfo {
            handle: self.handle.clone(),
            state: self.state(),
            properties: self.properties(),
            process_ids,
            container_ip: network.attachment.container_ip,
            host_ip: network.attachment.host_ip,
            container_path: self.rootfs.root.clone(),
            mapped_ports: network.mappings,
            limits,
            events,
            created_at: self.created_at,
        }
    }

    /// Durable record of the container.
    #[must_use]
    pub fn state_entry(&self) -> StateEntry {
        let limiter = self.limiter().clone();
        let mut spec = self.spec.clone();
        spec.properties = self.properties();
        StateEntry {
            handle: self.handle.clone(),
            spec,
            limits: limiter.limits,
            quota: Some(limiter.quota.as_u32()),
            rootfs: self.rootfs.clone(),
            sandbox: self.sandbox.record(),
            network: self.network().clone(),
            created_at: self.created_at,
        }
    }
}
