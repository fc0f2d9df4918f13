//! Network backend for host isolation: containers share the host network,
//! so mappings and egress rules are recorded but nothing is programmed.

use paddock_common::error::Result;
use paddock_common::network::{NetOutRule, PortMapping};
use paddock_common::types::ContainerHandle;

use super::{Attachment, NetworkBackend};

/// Shared host network.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostNetwork;

impl HostNetwork {
    /// Creates the backend.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NetworkBackend for HostNetwork {
    fn attach(&self, _handle: &ContainerHandle, _holder_pid: Option<u32>) -> Result<Attachment> {
        Ok(Attachment::default())
    }

    fn forward(&self, handle: &ContainerHandle, _attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        tracing::debug!(%handle, host_port = mapping.host_port, "host network: port mapping recorded only");
        Ok(())
    }

    fn unforward(&self, _handle: &ContainerHandle, _attachment: &Attachment, _mapping: PortMapping) -> Result<()> {
        Ok(())
    }

    fn allow(&self, handle: &ContainerHandle, _attachment: &Attachment, _rule: &NetOutRule) -> Result<()> {
        tracing::debug!(%handle, "host network: egress is unrestricted");
        Ok(())
    }

    fn detach(&self, _handle: &ContainerHandle, _attachment: &Attachment) -> Result<()> {
        Ok(())
    }
}
