//! Fake backends and an engine harness for integration tests.
//!
//! The harness runs containers with host isolation and host networking,
//! so processes are real but no privileges are needed. Memory, quota and
//! rootfs backends are fakes that record what they were asked and can be
//! told to fail.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use paddock_common::config::{IsolationMode, PaddockConfig};
use paddock_common::error::{PaddockError, Result};
use paddock_common::metrics::MemoryStat;
use paddock_common::network::{NetOutRule, PortMapping};
use paddock_common::types::{ContainerHandle, ContainerSpec};
use paddock_core::cgroup::CgroupBackend;
use paddock_core::quota::{ByteLimits, QuotaBackend, QuotaId};
use paddock_image::provider::{ProvisionedRootfs, RootfsProvider};
use paddock_runtime::backend::HostIsolation;
use paddock_runtime::engine::{Engine, EngineBuilder};
use paddock_runtime::network::{Attachment, HostNetwork, NetworkBackend};
use tempfile::TempDir;

// ── Rootfs ───────────────────────────────────────────────────────────

/// Hands out directories under a temp dir and reports a fixed image size.
#[derive(Debug)]
pub struct FakeRootfs {
    dir: PathBuf,
    pub image_bytes: AtomicU64,
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
    pub released: Mutex<Vec<String>>,
}

impl FakeRootfs {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            image_bytes: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn layer_of(&self, handle: &str) -> PathBuf {
        self.dir.join(handle)
    }

    pub fn root_of(&self, handle: &str) -> PathBuf {
        self.dir.join(handle).join("rootfs")
    }
}

impl RootfsProvider for FakeRootfs {
    fn provision(&self, handle: &ContainerHandle, _source: &str) -> Result<ProvisionedRootfs> {
        std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        if self.fail.load(Ordering::SeqCst) {
            return Err(PaddockError::backend("rootfs unavailable"));
        }
        let root = self.root_of(handle.as_str());
        std::fs::create_dir_all(&root).unwrap();
        Ok(ProvisionedRootfs {
            writable: root.clone(),
            quota_root: self.layer_of(handle.as_str()),
            root,
            image_bytes: self.image_bytes.load(Ordering::SeqCst),
        })
    }

    fn release(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = std::fs::remove_dir_all(self.dir.join(handle.as_str()));
        self.released.lock().unwrap().push(handle.to_string());
        Ok(())
    }
}

// ── Cgroups ──────────────────────────────────────────────────────────

/// Records memory ceilings per handle.
#[derive(Debug, Default)]
pub struct FakeCgroups {
    pub limits: Mutex<HashMap<String, u64>>,
    pub fail_limits: AtomicBool,
    pub oom_kills: AtomicU64,
    pub destroyed: Mutex<Vec<String>>,
}

impl CgroupBackend for FakeCgroups {
    fn create(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = self.limits.lock().unwrap().insert(handle.to_string(), 0);
        Ok(())
    }

    fn set_memory_limit(&self, handle: &ContainerHandle, bytes: u64) -> Result<()> {
        if self.fail_limits.load(Ordering::SeqCst) {
            return Err(PaddockError::backend("memory.max: invalid argument"));
        }
        let _ = self.limits.lock().unwrap().insert(handle.to_string(), bytes);
        Ok(())
    }

    fn memory_stat(&self, handle: &ContainerHandle) -> Result<MemoryStat> {
        Ok(MemoryStat {
            usage_in_bytes: 4096,
            limit_in_bytes: self.limits.lock().unwrap().get(handle.as_str()).copied().unwrap_or(0),
            oom_kills: self.oom_kills.load(Ordering::SeqCst),
        })
    }

    fn procs_file(&self, _handle: &ContainerHandle) -> Option<PathBuf> {
        None
    }

    fn kill_all(&self, _handle: &ContainerHandle) -> Result<()> {
        Ok(())
    }

    fn destroy(&self, handle: &ContainerHandle) -> Result<()> {
        let _ = self.limits.lock().unwrap().remove(handle.as_str());
        self.destroyed.lock().unwrap().push(handle.to_string());
        Ok(())
    }
}

// ── Quota ────────────────────────────────────────────────────────────

/// Hands out sequential ids and reports a settable usage.
#[derive(Debug)]
pub struct FakeQuota {
    next: AtomicU32,
    pub limits: Mutex<HashMap<u32, ByteLimits>>,
    pub usage: AtomicU64,
    pub fail_limits: AtomicBool,
    pub released: Mutex<Vec<u32>>,
    pub assigned: Mutex<Vec<PathBuf>>,
}

impl Default for FakeQuota {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(70_000),
            limits: Mutex::new(HashMap::new()),
            usage: AtomicU64::new(0),
            fail_limits: AtomicBool::new(false),
            released: Mutex::new(Vec::new()),
            assigned: Mutex::new(Vec::new()),
        }
    }
}

impl FakeQuota {
    pub fn live(&self) -> usize {
        self.limits.lock().unwrap().len()
    }
}

impl QuotaBackend for FakeQuota {
    fn assign(&self, subtree: &Path) -> Result<QuotaId> {
        self.assigned.lock().unwrap().push(subtree.to_path_buf());
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let _ = self.limits.lock().unwrap().insert(id, ByteLimits::default());
        Ok(QuotaId::new(id))
    }

    fn set_limits(&self, id: QuotaId, limits: ByteLimits) -> Result<()> {
        if self.fail_limits.load(Ordering::SeqCst) {
            return Err(PaddockError::backend("quotactl: invalid argument"));
        }
        let _ = self.limits.lock().unwrap().insert(id.as_u32(), limits);
        Ok(())
    }

    fn usage(&self, _id: QuotaId) -> Result<u64> {
        Ok(self.usage.load(Ordering::SeqCst))
    }

    fn release(&self, id: QuotaId) -> Result<()> {
        let _ = self.limits.lock().unwrap().remove(&id.as_u32());
        self.released.lock().unwrap().push(id.as_u32());
        Ok(())
    }
}

// ── Network ──────────────────────────────────────────────────────────

/// Host networking whose port forwards can be slowed down, recording
/// every forward and its removal.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    inner: HostNetwork,
    pub forward_delay_ms: AtomicU64,
    pub forwarded: Mutex<Vec<u16>>,
    pub unforwarded: Mutex<Vec<u16>>,
}

impl NetworkBackend for FakeNetwork {
    fn attach(&self, handle: &ContainerHandle, holder_pid: Option<u32>) -> Result<Attachment> {
        self.inner.attach(handle, holder_pid)
    }

    fn forward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        std::thread::sleep(Duration::from_millis(self.forward_delay_ms.load(Ordering::SeqCst)));
        self.forwarded.lock().unwrap().push(mapping.host_port);
        self.inner.forward(handle, attachment, mapping)
    }

    fn unforward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        self.unforwarded.lock().unwrap().push(mapping.host_port);
        self.inner.unforward(handle, attachment, mapping)
    }

    fn allow(&self, handle: &ContainerHandle, attachment: &Attachment, rule: &NetOutRule) -> Result<()> {
        self.inner.allow(handle, attachment, rule)
    }

    fn detach(&self, handle: &ContainerHandle, attachment: &Attachment) -> Result<()> {
        self.inner.detach(handle, attachment)
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// An engine over fakes, with handles to every fake.
pub struct Harness {
    pub engine: Engine,
    pub rootfs: Arc<FakeRootfs>,
    pub cgroups: Arc<FakeCgroups>,
    pub quota: Arc<FakeQuota>,
    pub network: Arc<FakeNetwork>,
    pub dir: TempDir,
}

pub fn config(dir: &Path) -> PaddockConfig {
    PaddockConfig {
        data_dir: dir.join("data"),
        isolation: IsolationMode::Host,
        port_pool_start: 62_000,
        port_pool_size: 10,
        max_containers: 8,
        backend_timeout_ms: 5_000,
        destroy_timeout_ms: 3_000,
        stream_drain_ms: 200,
        ..PaddockConfig::default()
    }
}

pub struct Fakes {
    pub rootfs: Arc<FakeRootfs>,
    pub cgroups: Arc<FakeCgroups>,
    pub quota: Arc<FakeQuota>,
    pub network: Arc<FakeNetwork>,
}

pub fn builder(dir: &Path, config: PaddockConfig) -> (EngineBuilder, Fakes) {
    let rootfs = Arc::new(FakeRootfs::new(&dir.join("roots")));
    let cgroups = Arc::new(FakeCgroups::default());
    let quota = Arc::new(FakeQuota::default());
    let network = Arc::new(FakeNetwork::default());
    let builder = Engine::builder(config)
        .isolation(Arc::new(HostIsolation::new()))
        .network(Arc::clone(&network) as Arc<dyn NetworkBackend>)
        .rootfs(Arc::clone(&rootfs) as Arc<dyn RootfsProvider>)
        .cgroups(Arc::clone(&cgroups) as Arc<dyn CgroupBackend>)
        .quota(Arc::clone(&quota) as Arc<dyn QuotaBackend>);
    let fakes = Fakes {
        rootfs,
        cgroups,
        quota,
        network,
    };
    (builder, fakes)
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut PaddockConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);
    let (builder, fakes) = builder(dir.path(), config);
    Harness {
        engine: builder.build().unwrap(),
        rootfs: fakes.rootfs,
        cgroups: fakes.cgroups,
        quota: fakes.quota,
        network: fakes.network,
        dir,
    }
}

pub fn spec(handle: &str) -> ContainerSpec {
    ContainerSpec {
        handle: Some(handle.to_owned()),
        ..ContainerSpec::default()
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
