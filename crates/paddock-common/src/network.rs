//! Network rule vocabulary: port mappings and egress allow-list entries.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PaddockError;

/// Transport protocol matched by an egress rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Any protocol.
    #[default]
    All,
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// ICMP only.
    Icmp,
}

impl Protocol {
    /// Name understood by iptables `-p`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        }
    }

    /// Whether port matches are meaningful for this protocol.
    #[must_use]
    pub const fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpRange {
    /// First address.
    pub start: Ipv4Addr,
    /// Last address.
    pub end: Ipv4Addr,
}

impl IpRange {
    /// A range holding one address.
    #[must_use]
    pub const fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    /// Whether `addr` lies inside the range.
    #[must_use]
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for IpRange {
    type Err = PaddockError;

    /// Accepts `a.b.c.d`, `a.b.c.d-e.f.g.h` and `a.b.c.d/nn`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PaddockError::Network {
            message: format!("invalid IP range: {s}"),
        };
        if let Some((start, end)) = s.split_once('-') {
            let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
            let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            return Ok(Self { start, end });
        }
        if let Some((addr, prefix)) = s.split_once('/') {
            let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid())?;
            let prefix: u32 = prefix.trim().parse().map_err(|_| invalid())?;
            if prefix > 32 {
                return Err(invalid());
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            let base = u32::from(addr) & mask;
            return Ok(Self {
                start: Ipv4Addr::from(base),
                end: Ipv4Addr::from(base | !mask),
            });
        }
        let addr: Ipv4Addr = s.trim().parse().map_err(|_| invalid())?;
        Ok(Self::single(addr))
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    /// First port.
    pub start: u16,
    /// Last port.
    pub end: u16,
}

impl PortRange {
    /// A range holding one port.
    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

/// Egress allow-list entry. Empty `networks` or `ports` match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOutRule {
    /// Protocol to allow.
    pub protocol: Protocol,
    /// Destination address ranges.
    pub networks: Vec<IpRange>,
    /// Destination port ranges (TCP/UDP only).
    pub ports: Vec<PortRange>,
}

/// A live NetIn mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}
