//! Linux isolation: a namespace holder per container, `chroot(2)` and
//! user switching for every process.

use paddock_common::error::Result;
use paddock_common::types::ContainerHandle;
use paddock_core::capability;
use paddock_core::filesystem::mount::MountPlan;
use paddock_core::namespace::NamespaceSet;
use paddock_core::namespace::holder::Holder;
use paddock_image::provider::ProvisionedRootfs;

use super::{IsolationBackend, Sandbox, SandboxRecord};

/// Longest hostname `sethostname(2)` accepts.
const MAX_HOSTNAME: usize = 64;

/// Backend using mount, UTS, IPC and network namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxIsolation;

impl LinuxIsolation {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl IsolationBackend for LinuxIsolation {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn create(
        &self,
        handle: &ContainerHandle,
        rootfs: &ProvisionedRootfs,
        privileged: bool,
    ) -> Result<Sandbox> {
        let plan = MountPlan::for_container(&rootfs.root)?;
        plan.prepare()?;
        let holder = Holder::spawn(hostname(handle), &plan)?;
        let namespaces = match NamespaceSet::open(holder.pid()) {
            Ok(namespaces) => namespaces,
            Err(e) => {
                if let Err(cleanup) = holder.terminate() {
                    tracing::warn!(%handle, error = %cleanup, "holder cleanup failed");
                }
                return Err(e);
            }
        };
        tracing::info!(%handle, holder = holder.pid(), mounts = plan.len(), privileged, "sandbox created");
        Ok(Sandbox {
            root: rootfs.root.clone(),
            chroot: true,
            switch_user: true,
            namespaces: Some(namespaces),
            holder: Some(holder),
            dropped_capabilities: capability::dropped_for(privileged),
        })
    }

    fn reclaim(&self, record: &SandboxRecord) -> Result<()> {
        match record.holder() {
            Some(holder) => holder.terminate(),
            None => Ok(()),
        }
    }
}

fn hostname(handle: &ContainerHandle) -> &str {
    let name = handle.as_str();
    let mut end = name.len().min(MAX_HOSTNAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}
