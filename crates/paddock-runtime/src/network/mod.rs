//! Network rule management: container addressing, inbound port mappings
//! (NetIn) and the egress allow-list (NetOut).
//!
//! Egress is denied by default; every NetOut rule widens the allow-list
//! and rules are never removed individually. All rules of a container are
//! removed when it is detached.

pub mod host;
pub mod iptables;

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use paddock_common::error::{PaddockError, Result};
use paddock_common::network::{NetOutRule, PortMapping};
use paddock_common::types::ContainerHandle;
use serde::{Deserialize, Serialize};

pub use host::HostNetwork;
pub use iptables::IptablesNetwork;

/// Network identity of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Address of the container.
    pub container_ip: Option<Ipv4Addr>,
    /// Address of the host side, the container's gateway.
    pub host_ip: Option<Ipv4Addr>,
    /// Host-side interface.
    pub interface: Option<String>,
    /// Per-container egress chain.
    pub chain: Option<String>,
}

/// Everything programmed for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Addressing.
    pub attachment: Attachment,
    /// Live NetIn mappings.
    pub mappings: Vec<PortMapping>,
    /// Egress rules in the order they were added.
    pub rules: Vec<NetOutRule>,
}

/// Programs container networking on the host.
pub trait NetworkBackend: Send + Sync + fmt::Debug {
    /// Connects a new container. `holder_pid` owns its network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be connected; nothing is
    /// left behind.
    fn attach(&self, handle: &ContainerHandle, holder_pid: Option<u32>) -> Result<Attachment>;

    /// Forwards a host port to a container port.
    ///
    /// # Errors
    ///
    /// Returns an error if the forwarding rule cannot be installed.
    fn forward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()>;

    /// Removes one forwarding rule. Already gone is success.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule exists but cannot be removed.
    fn unforward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()>;

    /// Adds an egress allow rule.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn allow(&self, handle: &ContainerHandle, attachment: &Attachment, rule: &NetOutRule) -> Result<()>;

    /// Removes every rule and interface of a container. Already gone is success.
    ///
    /// # Errors
    ///
    /// Returns the first teardown error; later steps are still attempted.
    fn detach(&self, handle: &ContainerHandle, attachment: &Attachment) -> Result<()>;
}

/// Host ports handed out for NetIn mappings.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    size: u16,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    in_use: BTreeSet<u16>,
    cursor: u32,
}

impl PortPool {
    /// A pool of `size` ports starting at `start`.
    #[must_use]
    pub fn new(start: u16, size: u16) -> Self {
        Self {
            start,
            size,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Takes the next free pool port. Ports are handed out round-robin so a
    /// released port is not reused right away.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if every pool port is taken.
    pub fn acquire(&self) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let size = u32::from(self.size);
        for step in 0..size {
            let offset = (state.cursor + step) % size;
            let Ok(port) = u16::try_from(u32::from(self.start) + offset) else {
                continue;
            };
            if state.in_use.insert(port) {
                state.cursor = (offset + 1) % size;
                return Ok(port);
            }
        }
        Err(PaddockError::Network {
            message: format!("no free host port in {}..{}", self.start, u32::from(self.start) + u32::from(self.size)),
        })
    }

    /// Claims a specific host port.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if the port is already mapped.
    pub fn reserve(&self, port: u16) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_use.insert(port) {
            Ok(())
        } else {
            Err(PaddockError::Network {
                message: format!("host port {port} is already mapped"),
            })
        }
    }

    /// Returns a port to the pool.
    pub fn release(&self, port: u16) {
        let _ = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .remove(&port);
    }
}

/// Network rule manager shared by all containers.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    backend: Arc<dyn NetworkBackend>,
    ports: Arc<PortPool>,
}

impl NetworkManager {
    /// Creates a manager over `backend` handing out ports from `ports`.
    #[must_use]
    pub fn new(backend: Arc<dyn NetworkBackend>, ports: PortPool) -> Self {
        Self {
            backend,
            ports: Arc::new(ports),
        }
    }

    /// Connects a new container.
    ///
    /// # Errors
    ///
    /// Returns the backend's error.
    pub fn attach(&self, handle: &ContainerHandle, holder_pid: Option<u32>) -> Result<NetworkState> {
        let attachment = self.backend.attach(handle, holder_pid)?;
        tracing::info!(%handle, ip = ?attachment.container_ip, "container network attached");
        Ok(NetworkState {
            attachment,
            ..NetworkState::default()
        })
    }

    /// Maps a host port to a container port. A zero host port takes one
    /// from the pool; a zero container port means the same as the host port.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if the host port is taken or the
    /// rule cannot be installed; the state is left unchanged.
    pub fn net_in(
        &self,
        handle: &ContainerHandle,
        state: &mut NetworkState,
        host_port: u16,
        container_port: u16,
    ) -> Result<PortMapping> {
        let host_port = if host_port == 0 {
            self.ports.acquire()?
        } else {
            self.ports.reserve(host_port)?;
            host_port
        };
        let mapping = PortMapping {
            host_port,
            container_port: if container_port == 0 { host_port } else { container_port },
        };
        if let Err(e) = self.backend.forward(handle, &state.attachment, mapping) {
            self.ports.release(host_port);
            return Err(e);
        }
        state.mappings.push(mapping);
        tracing::info!(%handle, host_port, container_port = mapping.container_port, "port mapped");
        Ok(mapping)
    }

    /// Undoes one [`net_in`](Self::net_in) that its caller gave up on: the
    /// rule is removed and the host port returns to the pool.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the port is freed regardless.
    pub fn unmap(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        let removed = self.backend.unforward(handle, attachment, mapping);
        self.ports.release(mapping.host_port);
        tracing::info!(%handle, host_port = mapping.host_port, "port unmapped");
        removed
    }

    /// Widens the egress allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Network`] if ports are given for a protocol
    /// without ports or the rule cannot be installed.
    pub fn net_out(&self, handle: &ContainerHandle, state: &mut NetworkState, rule: NetOutRule) -> Result<()> {
        if !rule.ports.is_empty() && !rule.protocol.has_ports() {
            return Err(PaddockError::Network {
                message: format!("ports cannot be matched for protocol {}", rule.protocol.as_str()),
            });
        }
        self.backend.allow(handle, &state.attachment, &rule)?;
        tracing::info!(%handle, protocol = rule.protocol.as_str(), networks = rule.networks.len(), "egress rule added");
        state.rules.push(rule);
        Ok(())
    }

    /// Removes everything programmed for a container and frees its ports.
    ///
    /// # Errors
    ///
    /// Returns the backend's first teardown error.
    pub fn detach(&self, handle: &ContainerHandle, state: &NetworkState) -> Result<()> {
        for mapping in &state.mappings {
            self.ports.release(mapping.host_port);
        }
        self.backend.detach(handle, &state.attachment)
    }
}
