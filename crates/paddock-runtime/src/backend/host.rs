//! Host isolation: processes run directly on the host, in the container's
//! root directory, as the server's own user. Development only.

use paddock_common::error::Result;
use paddock_common::types::ContainerHandle;
use paddock_image::provider::ProvisionedRootfs;

use super::{IsolationBackend, Sandbox, SandboxRecord};

/// Backend without namespaces, chroot or user switching.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostIsolation;

impl HostIsolation {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl IsolationBackend for HostIsolation {
    fn name(&self) -> &'static str {
        "host"
    }

    fn create(
        &self,
        handle: &ContainerHandle,
        rootfs: &ProvisionedRootfs,
        _privileged: bool,
    ) -> Result<Sandbox> {
        tracing::debug!(%handle, root = %rootfs.root.display(), "host sandbox created");
        Ok(Sandbox {
            root: rootfs.root.clone(),
            chroot: false,
            switch_user: false,
            namespaces: None,
            holder: None,
            dropped_capabilities: Vec::new(),
        })
    }

    fn reclaim(&self, _record: &SandboxRecord) -> Result<()> {
        Ok(())
    }
}
