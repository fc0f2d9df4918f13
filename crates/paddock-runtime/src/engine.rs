//! The container engine: registry, lifecycle, and every operation clients call.
//!
//! An [`Engine`] is an explicit value. It owns the registry of live
//! containers and the backends that provision them; nothing lives in
//! process-wide globals, so tests build engines over fake backends with
//! [`EngineBuilder`].
//!
//! The registry lock is held only for lookups, inserts, and removals.
//! Everything slow runs on the blocking pool through [`backend::call`]
//! with the per-container locks doing the rest.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use paddock_common::config::{IsolationMode, PaddockConfig};
use paddock_common::error::{PaddockError, Result};
use paddock_common::metrics::{Capacity, Metrics};
use paddock_common::network::{NetOutRule, PortMapping};
use paddock_common::types::{
    ContainerHandle, ContainerSpec, ContainerState, DiskLimits, MemoryLimits, ProcessId, ProcessSpec, Properties,
    Signal,
};
use paddock_core::cgroup::{CgroupBackend, CgroupV2, Unconfined};
use paddock_core::filesystem::etc;
use paddock_core::quota::{ProjectQuota, QuotaBackend, QuotaId, ScanQuota};
use paddock_image::provider::{OverlayProvider, ProvisionedRootfs, RootfsProvider, ScratchProvider};
use paddock_image::storage::ImageStore;
use tokio::sync::RwLock;

use crate::backend::{self, HostIsolation, IsolationBackend, LinuxIsolation, Sandbox, SandboxRecord};
use crate::container::{Container, ContainerInfo};
use crate::diagnostics::WorkerTracker;
use crate::env;
use crate::limiter::{LimiterState, ResourceLimiter};
use crate::network::{HostNetwork, IptablesNetwork, NetworkBackend, NetworkManager, NetworkState, PortPool};
use crate::process::{self, Launch, Process, Supervisor};
use crate::state::{StateEntry, StateStore};
use crate::stream::ProcessIo;

/// Resolver configuration copied into every container.
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Backends a container is built from. Cheap to clone into blocking calls.
#[derive(Debug, Clone)]
struct Backends {
    rootfs: Arc<dyn RootfsProvider>,
    isolation: Arc<dyn IsolationBackend>,
    limiter: ResourceLimiter,
    network: NetworkManager,
}

/// Resources of a fully provisioned container.
struct Provisioned {
    rootfs: ProvisionedRootfs,
    sandbox: Sandbox,
    limiter: LimiterState,
    network: NetworkState,
}

impl Backends {
    /// Provisions every resource of a new container, or none of them.
    fn provision(&self, handle: &ContainerHandle, spec: &ContainerSpec) -> Result<Provisioned> {
        let rootfs = self.rootfs.provision(handle, &spec.rootfs)?;
        let rootfs_guard = scopeguard::guard((), |()| {
            if let Err(e) = self.rootfs.release(handle) {
                tracing::warn!(%handle, error = %e, "rootfs rollback failed");
            }
        });

        let sandbox = self.isolation.create(handle, &rootfs, spec.privileged)?;
        let sandbox = scopeguard::guard(sandbox, |sandbox| {
            if let Err(e) = self.isolation.destroy(&sandbox) {
                tracing::warn!(%handle, error = %e, "sandbox rollback failed");
            }
        });

        let limiter = self.limiter.install(handle, spec.limits, &rootfs)?;
        let limiter = scopeguard::guard(limiter, |limiter| {
            if let Err(e) = self.limiter.release(handle, Some(limiter.quota)) {
                tracing::warn!(%handle, error = %e, "limit rollback failed");
            }
        });

        let network = self.network.attach(handle, sandbox.holder.map(|h| h.pid()))?;
        let network = scopeguard::guard(network, |network| {
            if let Err(e) = self.network.detach(handle, &network) {
                tracing::warn!(%handle, error = %e, "network rollback failed");
            }
        });

        etc::write_hosts(&rootfs.root, handle.as_str(), network.attachment.container_ip)?;
        etc::copy_resolv_conf(&rootfs.root, Path::new(HOST_RESOLV_CONF))?;

        let network = scopeguard::ScopeGuard::into_inner(network);
        let limiter = scopeguard::ScopeGuard::into_inner(limiter);
        let sandbox = scopeguard::ScopeGuard::into_inner(sandbox);
        scopeguard::ScopeGuard::into_inner(rootfs_guard);
        Ok(Provisioned {
            rootfs,
            sandbox,
            limiter,
            network,
        })
    }

    /// Releases everything a container holds. Every step runs; the first
    /// error is returned.
    fn teardown(
        &self,
        handle: &ContainerHandle,
        network: &NetworkState,
        isolation: impl FnOnce(&dyn IsolationBackend) -> Result<()>,
        quota: Option<QuotaId>,
    ) -> Result<()> {
        let mut first_error = None;
        let mut step = |name: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(%handle, step = name, error = %e, "teardown step failed");
                let _ = first_error.get_or_insert(e);
            }
        };
        step("network", self.network.detach(handle, network));
        step("isolation", isolation(self.isolation.as_ref()));
        step("limits", self.limiter.release(handle, quota));
        step("rootfs", self.rootfs.release(handle));
        first_error.map_or(Ok(()), Err)
    }
}

/// Builds an [`Engine`], with any backend replaceable.
///
/// Backends not supplied are chosen from the configured isolation mode.
#[derive(Debug)]
#[must_use]
pub struct EngineBuilder {
    config: PaddockConfig,
    isolation: Option<Arc<dyn IsolationBackend>>,
    cgroups: Option<Arc<dyn CgroupBackend>>,
    quota: Option<Arc<dyn QuotaBackend>>,
    rootfs: Option<Arc<dyn RootfsProvider>>,
    network: Option<Arc<dyn NetworkBackend>>,
}

impl EngineBuilder {
    /// Uses `backend` for sandboxes.
    pub fn isolation(mut self, backend: Arc<dyn IsolationBackend>) -> Self {
        self.isolation = Some(backend);
        self
    }

    /// Uses `backend` for memory control.
    pub fn cgroups(mut self, backend: Arc<dyn CgroupBackend>) -> Self {
        self.cgroups = Some(backend);
        self
    }

    /// Uses `backend` for disk quotas.
    pub fn quota(mut self, backend: Arc<dyn QuotaBackend>) -> Self {
        self.quota = Some(backend);
        self
    }

    /// Uses `provider` for root filesystems.
    pub fn rootfs(mut self, provider: Arc<dyn RootfsProvider>) -> Self {
        self.rootfs = Some(provider);
        self
    }

    /// Uses `backend` for network rules.
    pub fn network(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(backend);
        self
    }

    /// Opens the durable state and assembles the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the data
    /// directory cannot be prepared, the state file cannot be read, or a
    /// default backend cannot be initialised.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let containers_dir = config.containers_dir();
        std::fs::create_dir_all(&containers_dir).map_err(|e| PaddockError::Io {
            path: containers_dir.clone(),
            source: e,
        })?;
        let (state, leftovers) = StateStore::open(config.state_file())?;
        let host = config.isolation == IsolationMode::Host;

        let isolation: Arc<dyn IsolationBackend> = match self.isolation {
            Some(isolation) => isolation,
            None if host => Arc::new(HostIsolation::new()),
            None => Arc::new(LinuxIsolation::new()),
        };
        let cgroups: Arc<dyn CgroupBackend> = match self.cgroups {
            Some(cgroups) => cgroups,
            None if host => Arc::new(Unconfined::new()),
            None => Arc::new(CgroupV2::new(&config.cgroup_root)),
        };
        let quota = match self.quota {
            Some(quota) => quota,
            None => default_quota(&config, host, &leftovers),
        };
        let rootfs: Arc<dyn RootfsProvider> = match self.rootfs {
            Some(rootfs) => rootfs,
            None if host => Arc::new(ScratchProvider::new(containers_dir)),
            None => Arc::new(OverlayProvider::new(
                config.default_rootfs(),
                ImageStore::open(config.image_store())?,
                containers_dir,
            )),
        };
        let network: Arc<dyn NetworkBackend> = match self.network {
            Some(network) => network,
            None if host => Arc::new(HostNetwork::new()),
            None => Arc::new(IptablesNetwork::new(&config.network_pool)?),
        };

        tracing::info!(
            isolation = isolation.name(),
            data_dir = %config.data_dir.display(),
            leftovers = leftovers.len(),
            "engine ready"
        );
        Ok(Engine {
            backends: Backends {
                rootfs,
                isolation,
                limiter: ResourceLimiter::new(cgroups, quota),
                network: NetworkManager::new(
                    network,
                    PortPool::new(config.port_pool_start, config.port_pool_size),
                ),
            },
            supervisor: Supervisor::new(WorkerTracker::new(), config.stream_drain()),
            registry: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            state,
            leftovers: Mutex::new(leftovers),
            config,
        })
    }
}

/// Project quotas where the filesystem has them, directory scans otherwise.
/// Ids recorded by a previous run are not handed out again before recovery.
fn default_quota(config: &PaddockConfig, host: bool, leftovers: &[StateEntry]) -> Arc<dyn QuotaBackend> {
    let base = config.quota_project_base;
    let highest = leftovers.iter().filter_map(|e| e.quota).max();
    if !host {
        match ProjectQuota::for_path(&config.containers_dir(), base) {
            Ok(quota) => {
                if let Some(id) = highest {
                    quota.reserve_through(QuotaId::new(id));
                }
                return Arc::new(quota);
            }
            Err(e) => {
                tracing::warn!(error = %e, "project quotas unavailable, disk limits are accounted but not enforced");
            }
        }
    }
    let first = highest.map_or(base, |id| id.saturating_add(1).max(base));
    Arc::new(ScanQuota::new(first))
}

/// The container server core.
#[derive(Debug)]
pub struct Engine {
    config: PaddockConfig,
    backends: Backends,
    supervisor: Supervisor,
    registry: RwLock<HashMap<ContainerHandle, Arc<Container>>>,
    reserved: Mutex<HashSet<ContainerHandle>>,
    state: StateStore,
    leftovers: Mutex<Vec<StateEntry>>,
}

impl Engine {
    /// Starts building an engine for `config`.
    pub fn builder(config: PaddockConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            isolation: None,
            cgroups: None,
            quota: None,
            rootfs: None,
            network: None,
        }
    }

    /// Builds an engine with the default backends for `config`.
    ///
    /// # Errors
    ///
    /// See [`EngineBuilder::build`].
    pub fn new(config: PaddockConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &PaddockConfig {
        &self.config
    }

    /// Tracker of supervision tasks.
    #[must_use]
    pub const fn workers(&self) -> &WorkerTracker {
        self.supervisor.workers()
    }

    // ── Registry ─────────────────────────────────────────────────

    /// Creates a container. Either the container is fully provisioned and
    /// listed, or nothing of it remains.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::AlreadyExists`] for a taken handle,
    /// [`PaddockError::CapacityExhausted`] when the registry is full,
    /// [`PaddockError::QuotaExceeded`] when the image does not fit a total
    /// disk ceiling, [`PaddockError::Timeout`] when a backend hangs, and
    /// [`PaddockError::Creation`] for any other provisioning failure.
    pub async fn create(&self, spec: ContainerSpec) -> Result<ContainerHandle> {
        env::validate(&spec.env, |message| PaddockError::Creation { message })?;
        let handle = match spec.handle.as_deref() {
            Some(handle) if !handle.is_empty() => ContainerHandle::new(handle),
            _ => ContainerHandle::generate(),
        };

        self.reserve(&handle).await?;
        let _reservation = scopeguard::guard(handle.clone(), |handle| {
            let _ = self
                .reserved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&handle);
        });

        let provisioned = {
            let backends = self.backends.clone();
            let undo = self.backends.clone();
            let target = handle.clone();
            let spec = spec.clone();
            let late = handle.clone();
            backend::call_or_undo(
                "create",
                self.config.backend_timeout(),
                move || backends.provision(&target, &spec),
                move |provisioned: Provisioned| {
                    let _ = undo.teardown(
                        &late,
                        &provisioned.network,
                        |isolation| isolation.destroy(&provisioned.sandbox),
                        Some(provisioned.limiter.quota),
                    );
                },
            )
            .await
        };
        let provisioned = match provisioned {
            Ok(provisioned) => provisioned,
            Err(e) => {
                tracing::warn!(%handle, error = %e, "container creation failed");
                return Err(creation_error(e));
            }
        };

        let container = Arc::new(Container::new(
            handle.clone(),
            spec,
            provisioned.rootfs,
            provisioned.sandbox,
            provisioned.limiter,
            provisioned.network,
        ));
        if let Err(e) = self.state.put(container.state_entry()) {
            tracing::warn!(%handle, error = %e, "state write failed, rolling back");
            let _ = self.teardown(&container).await;
            return Err(creation_error(e));
        }
        let _ = self.registry.write().await.insert(handle.clone(), Arc::clone(&container));
        tracing::info!(
            %handle,
            root = %container.rootfs().root.display(),
            ip = ?container.network().attachment.container_ip,
            "container created"
        );
        Ok(handle)
    }

    /// Claims `handle` for a create in progress.
    async fn reserve(&self, handle: &ContainerHandle) -> Result<()> {
        let registry = self.registry.read().await;
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if registry.contains_key(handle) || reserved.contains(handle) {
            return Err(PaddockError::AlreadyExists {
                handle: handle.to_string(),
            });
        }
        if registry.len() + reserved.len() >= self.config.max_containers {
            return Err(PaddockError::CapacityExhausted {
                max: self.config.max_containers,
            });
        }
        let _ = reserved.insert(handle.clone());
        Ok(())
    }

    /// Destroys a container: new runs fail at once, every process is
    /// killed, and all resources are released.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle, otherwise
    /// the first teardown error. The container is gone either way.
    pub async fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        let container = self.lookup(handle).await?;
        if !container.begin_destroy().await {
            return Err(PaddockError::container_not_found(handle.as_str()));
        }
        tracing::info!(%handle, "destroying container");

        let mut first_error = None;
        for process in container.processes() {
            if let Err(e) = process.signal(Signal::Kill) {
                tracing::warn!(%handle, process = %process.id(), error = %e, "kill failed");
            }
        }
        for pgid in container.process_groups() {
            if let Err(e) = process::kill_group(pgid) {
                tracing::warn!(%handle, pgid, error = %e, "process group kill failed");
            }
        }
        let limiter = self.backends.limiter.clone();
        let target = handle.clone();
        if let Err(e) = backend::call("kill container", self.config.backend_timeout(), move || {
            limiter.kill_all(&target)
        })
        .await
        {
            tracing::warn!(%handle, error = %e, "cgroup kill failed");
            let _ = first_error.get_or_insert(e);
        }

        let processes = container.processes();
        let drained = tokio::time::timeout(self.config.destroy_timeout(), async {
            for process in &processes {
                let _ = process.wait().await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(%handle, "processes still running after destroy timeout");
        }

        if let Err(e) = self.teardown(&container).await {
            let _ = first_error.get_or_insert(e);
        }
        if let Err(e) = self.state.remove(handle) {
            tracing::warn!(%handle, error = %e, "state write failed");
            let _ = first_error.get_or_insert(e);
        }
        let _ = self.registry.write().await.remove(handle);
        tracing::info!(%handle, clean = first_error.is_none(), "container destroyed");
        first_error.map_or(Ok(()), Err)
    }

    async fn teardown(&self, container: &Container) -> Result<()> {
        let backends = self.backends.clone();
        let handle = container.handle().clone();
        let network = container.network().clone();
        let quota = container.limiter().quota;
        let sandbox = Arc::clone(container.sandbox());
        backend::call("destroy", self.config.backend_timeout(), move || {
            backends.teardown(&handle, &network, |isolation| isolation.destroy(&sandbox), Some(quota))
        })
        .await
    }

    /// Handles of live containers whose properties include every entry of
    /// `filter`, sorted.
    pub async fn containers(&self, filter: &Properties) -> Vec<ContainerHandle> {
        let registry = self.registry.read().await;
        let mut handles: Vec<ContainerHandle> = registry
            .values()
            .filter(|c| c.state() == ContainerState::Active && c.matches(filter))
            .map(|c| c.handle().clone())
            .collect();
        handles.sort();
        handles
    }

    /// Live container by handle.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] if the handle is unknown or the
    /// container is being destroyed.
    pub async fn lookup(&self, handle: &ContainerHandle) -> Result<Arc<Container>> {
        let container = self
            .registry
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| PaddockError::container_not_found(handle.as_str()))?;
        if container.state() == ContainerState::Destroying {
            return Err(PaddockError::container_not_found(handle.as_str()));
        }
        Ok(container)
    }

    /// Snapshot of a container.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle.
    pub async fn info(&self, handle: &ContainerHandle) -> Result<ContainerInfo> {
        let container = self.lookup(handle).await?;
        let limiter = self.backends.limiter.clone();
        let target = handle.clone();
        let oom_kills = match backend::call("memory stat", self.config.backend_timeout(), move || {
            limiter.memory_stat(&target)
        })
        .await
        {
            Ok(stat) => stat.oom_kills,
            Err(e) => {
                tracing::debug!(%handle, error = %e, "memory stat unavailable");
                0
            }
        };
        Ok(container.info(oom_kills))
    }

    // ── Properties ───────────────────────────────────────────────

    /// All properties of a container.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle.
    pub async fn properties(&self, handle: &ContainerHandle) -> Result<Properties> {
        Ok(self.lookup(handle).await?.properties())
    }

    /// One property of a container.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle or key.
    pub async fn property(&self, handle: &ContainerHandle, key: &str) -> Result<String> {
        self.lookup(handle)
            .await?
            .property(key)
            .ok_or_else(|| PaddockError::NotFound {
                kind: "property",
                id: key.to_owned(),
            })
    }

    /// Sets a property. Later writes win.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle.
    pub async fn set_property(&self, handle: &ContainerHandle, key: &str, value: &str) -> Result<()> {
        let container = self.lookup(handle).await?;
        container.set_property(key, value);
        self.persist(&container);
        Ok(())
    }

    /// Removes a property.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle or key.
    pub async fn remove_property(&self, handle: &ContainerHandle, key: &str) -> Result<()> {
        let container = self.lookup(handle).await?;
        if !container.remove_property(key) {
            return Err(PaddockError::NotFound {
                kind: "property",
                id: key.to_owned(),
            });
        }
        self.persist(&container);
        Ok(())
    }

    /// Rewrites the durable entry of a container. Failures are logged; the
    /// in-memory change stands.
    fn persist(&self, container: &Container) {
        let entry = container.state_entry();
        if let Err(e) = self.state.update(container.handle(), |stored| *stored = entry) {
            tracing::warn!(handle = %container.handle(), error = %e, "state write failed");
        }
    }

    // ── Processes ────────────────────────────────────────────────

    /// Starts a process in a container.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] if the container is unknown or
    /// being destroyed, and [`PaddockError::Spawn`] if the process cannot
    /// be started.
    pub async fn run(&self, handle: &ContainerHandle, spec: &ProcessSpec, io: ProcessIo) -> Result<Process> {
        let container = self.lookup(handle).await?;
        let _entered = container.enter().await?;
        let procs = self.backends.limiter.cgroups().procs_file(handle);
        let launch = Launch {
            sandbox: container.sandbox(),
            cgroup_procs: procs.as_deref(),
            container_env: &container.spec().env,
        };
        let process = self.supervisor.spawn(launch, spec, io)?;
        container.track(process.clone());
        tracing::debug!(%handle, process = %process.id(), "process registered");
        Ok(process)
    }

    /// Re-attaches to a process started earlier.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] if the container or the process
    /// is unknown.
    pub async fn attach(&self, handle: &ContainerHandle, id: ProcessId) -> Result<Process> {
        self.lookup(handle)
            .await?
            .process(id)
            .ok_or_else(|| PaddockError::NotFound {
                kind: "process",
                id: id.to_string(),
            })
    }

    /// Waits for a process leader to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::attach`].
    pub async fn wait(&self, handle: &ContainerHandle, id: ProcessId) -> Result<i32> {
        self.attach(handle, id).await?.wait().await
    }

    /// Signals a process leader.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::attach`], plus [`Process::signal`] errors.
    pub async fn signal(&self, handle: &ContainerHandle, id: ProcessId, signal: Signal) -> Result<()> {
        self.attach(handle, id).await?.signal(signal)
    }

    // ── Limits ───────────────────────────────────────────────────

    /// Point-in-time usage of a container.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle, or the
    /// backend error if accounting cannot be read.
    pub async fn metrics(&self, handle: &ContainerHandle) -> Result<Metrics> {
        let container = self.lookup(handle).await?;
        let limiter = self.backends.limiter.clone();
        let state = container.limiter().clone();
        let target = handle.clone();
        let (memory, disk) = backend::call("metrics", self.config.backend_timeout(), move || {
            Ok((limiter.memory_stat(&target)?, limiter.disk_stat(&state)?))
        })
        .await?;
        Ok(Metrics {
            memory,
            disk,
            process_count: container.running_processes(),
        })
    }

    /// Memory limits in effect.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle.
    pub async fn current_memory_limits(&self, handle: &ContainerHandle) -> Result<MemoryLimits> {
        Ok(self.lookup(handle).await?.limiter().limits.memory)
    }

    /// Disk limits in effect.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::NotFound`] for an unknown handle.
    pub async fn current_disk_limits(&self, handle: &ContainerHandle) -> Result<DiskLimits> {
        Ok(self.lookup(handle).await?.limiter().limits.disk)
    }

    /// Replaces the memory limit.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::LimitApplication`] if the update is
    /// rejected; the previous limit stays in effect.
    pub async fn limit_memory(&self, handle: &ContainerHandle, limits: MemoryLimits) -> Result<()> {
        let container = self.lookup(handle).await?;
        let _entered = container.enter().await?;
        let _updating = container.updating_limits().await;
        let limiter = self.backends.limiter.clone();
        let mut state = container.limiter().clone();
        let target = handle.clone();
        backend::call("limit memory", self.config.backend_timeout(), move || {
            limiter.set_memory(&target, &mut state, limits)
        })
        .await?;
        container.limiter().limits.memory = limits;
        self.persist(&container);
        Ok(())
    }

    /// Replaces the disk limits. The scope is fixed at creation.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::LimitApplication`] if the update is
    /// rejected; the previous limits stay in effect.
    pub async fn limit_disk(&self, handle: &ContainerHandle, limits: DiskLimits) -> Result<()> {
        let container = self.lookup(handle).await?;
        let _entered = container.enter().await?;
        let _updating = container.updating_limits().await;
        let limiter = self.backends.limiter.clone();
        let mut state = container.limiter().clone();
        let target = handle.clone();
        backend::call("limit disk", self.config.backend_timeout(), move || {
            limiter.set_disk(&target, &mut state, limits)
        })
        .await?;
        container.limiter().limits.disk = limits;
        self.persist(&container);
        Ok(())
    }

    // ── Network ──────────────────────────────────────────────────

    /// Maps a host port to a container port. Zero host port picks one from
    /// the pool; zero container port reuses the host port.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if the port is taken or the rule
    /// cannot be installed.
    pub async fn net_in(&self, handle: &ContainerHandle, host_port: u16, container_port: u16) -> Result<PortMapping> {
        let container = self.lookup(handle).await?;
        let _entered = container.enter().await?;
        let network = self.backends.network.clone();
        let undo = self.backends.network.clone();
        let mut state = container.network().clone();
        let attachment = state.attachment.clone();
        let target = handle.clone();
        let late = handle.clone();
        let mapping = backend::call_or_undo(
            "net in",
            self.config.backend_timeout(),
            move || network.net_in(&target, &mut state, host_port, container_port),
            move |mapping| {
                if let Err(e) = undo.unmap(&late, &attachment, mapping) {
                    tracing::warn!(handle = %late, host_port = mapping.host_port, error = %e, "late port mapping not removed");
                }
            },
        )
        .await?;
        container.network().mappings.push(mapping);
        self.persist(&container);
        Ok(mapping)
    }

    /// Allows egress matching `rule`.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if the rule is malformed or cannot
    /// be installed.
    pub async fn net_out(&self, handle: &ContainerHandle, rule: NetOutRule) -> Result<()> {
        let container = self.lookup(handle).await?;
        let _entered = container.enter().await?;
        let network = self.backends.network.clone();
        let mut state = container.network().clone();
        let target = handle.clone();
        let added = rule.clone();
        backend::call("net out", self.config.backend_timeout(), move || {
            network.net_out(&target, &mut state, added)
        })
        .await?;
        container.network().rules.push(rule);
        self.persist(&container);
        Ok(())
    }

    // ── Server ───────────────────────────────────────────────────

    /// Host capacity and leak-detection counters.
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        Capacity {
            memory_in_bytes: host_memory(),
            disk_in_bytes: filesystem_size(&self.config.data_dir),
            max_containers: self.config.max_containers,
            diagnostics: self.supervisor.workers().snapshot(),
        }
    }

    /// Releases everything a previous run left behind and clears the
    /// durable state. Returns how many containers were reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cleared state cannot be written. Teardown
    /// failures of individual leftovers are logged.
    pub async fn recover(&self) -> Result<usize> {
        let leftovers = std::mem::take(&mut *self.leftovers.lock().unwrap_or_else(PoisonError::into_inner));
        let count = leftovers.len();
        for entry in leftovers {
            let backends = self.backends.clone();
            let handle = entry.handle.clone();
            let result = backend::call("recover", self.config.backend_timeout(), move || {
                let record: SandboxRecord = entry.sandbox;
                backends.teardown(
                    &entry.handle,
                    &entry.network,
                    |isolation| isolation.reclaim(&record),
                    entry.quota.map(QuotaId::new),
                )
            })
            .await;
            match result {
                Ok(()) => tracing::info!(%handle, "leftover container reclaimed"),
                Err(e) => tracing::warn!(%handle, error = %e, "leftover container only partly reclaimed"),
            }
        }
        self.state.persist()?;
        Ok(count)
    }

    /// Destroys every container. All are attempted; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first destroy error.
    pub async fn destroy_all(&self) -> Result<()> {
        let handles: Vec<ContainerHandle> = self.registry.read().await.keys().cloned().collect();
        let mut first_error = None;
        for handle in handles {
            match self.destroy(&handle).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let _ = first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Keeps the caller-facing creation errors and folds the rest into
/// [`PaddockError::Creation`].
fn creation_error(e: PaddockError) -> PaddockError {
    match e {
        PaddockError::QuotaExceeded | PaddockError::Timeout { .. } | PaddockError::Creation { .. } => e,
        other => PaddockError::Creation {
            message: other.to_string(),
        },
    }
}

/// Physical memory from `/proc/meminfo`, zero where unavailable.
fn host_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_total(&meminfo))
        .unwrap_or(0)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let kib: u64 = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

/// Size of the filesystem holding `path`, zero where unavailable.
fn filesystem_size(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => u64::from(stat.blocks()).saturating_mul(u64::from(stat.fragment_size())),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "statvfs failed");
            0
        }
    }
}
