//! Bridged container networking programmed with `ip` and `iptables`.
//!
//! Each container gets a veth pair: the host end joins the bridge, the
//! other end becomes `eth0` in the container's network namespace. Traffic
//! from a container is sent to its own filter chain, which ends in `DROP`;
//! egress rules are inserted above it. Inbound mappings are DNAT rules.
//! Every rule carries a comment naming the container's slot so teardown
//! can find it again, also after a restart.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use paddock_common::constants::{BRIDGE_NAME, CHAIN_PREFIX};
use paddock_common::error::{PaddockError, Result};
use paddock_common::network::{NetOutRule, PortMapping};
use paddock_common::types::ContainerHandle;

use super::{Attachment, NetworkBackend};

/// Bridge-and-NAT backend.
#[derive(Debug)]
pub struct IptablesNetwork {
    network: Ipv4Addr,
    prefix: u8,
    allocated: Mutex<BTreeSet<u32>>,
    ready: Mutex<bool>,
}

impl IptablesNetwork {
    /// Creates a backend addressing containers from `pool` (`a.b.c.d/nn`).
    ///
    /// # Errors
    ///
    /// Returns [`PaddockError::Config`] if the block is malformed or too small.
    pub fn new(pool: &str) -> Result<Self> {
        let (network, prefix) = parse_cidr(pool)?;
        Ok(Self {
            network,
            prefix,
            allocated: Mutex::new(BTreeSet::new()),
            ready: Mutex::new(false),
        })
    }

    /// The bridge address, gateway of every container.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix)
    }

    fn slot_count(&self) -> u32 {
        1u32 << (32 - u32::from(self.prefix))
    }

    /// Reserves the lowest free slot. Slot 0 is the network, 1 the gateway
    /// and the last one the broadcast address.
    fn allocate(&self) -> Result<u32> {
        let mut allocated = self.allocated.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = (2..self.slot_count() - 1)
            .find(|slot| !allocated.contains(slot))
            .ok_or_else(|| PaddockError::Network {
                message: format!("address pool {} is exhausted", self.cidr()),
            })?;
        let _ = allocated.insert(slot);
        Ok(slot)
    }

    fn free(&self, slot: u32) {
        let _ = self
            .allocated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot);
    }

    fn slot_of(&self, ip: Ipv4Addr) -> u32 {
        u32::from(ip).wrapping_sub(u32::from(self.network))
    }

    /// Creates the bridge, NAT and jump rules once per server run.
    fn ensure_ready(&self) -> Result<()> {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        if *ready {
            return Ok(());
        }

        if run("ip", &["link", "show", BRIDGE_NAME]).is_err() {
            let _ = run("ip", &["link", "add", BRIDGE_NAME, "type", "bridge"])?;
        }
        let gateway = format!("{}/{}", self.gateway(), self.prefix);
        if !run("ip", &["addr", "show", "dev", BRIDGE_NAME])?.contains(&gateway) {
            let _ = run("ip", &["addr", "add", &gateway, "dev", BRIDGE_NAME])?;
        }
        let _ = run("ip", &["link", "set", BRIDGE_NAME, "up"])?;
        std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").map_err(|e| PaddockError::Io {
            path: "/proc/sys/net/ipv4/ip_forward".into(),
            source: e,
        })?;

        let forward = chain("FORWARD");
        let prerouting = chain("PREROUTING");
        let postrouting = chain("POSTROUTING");
        ensure_chain("filter", &forward)?;
        ensure_chain("nat", &prerouting)?;
        ensure_chain("nat", &postrouting)?;

        ensure_rule("filter", "FORWARD", &["-j", &forward])?;
        ensure_rule("nat", "PREROUTING", &["-m", "addrtype", "--dst-type", "LOCAL", "-j", &prerouting])?;
        ensure_rule("nat", "OUTPUT", &["-m", "addrtype", "--dst-type", "LOCAL", "-j", &prerouting])?;
        ensure_rule("nat", "POSTROUTING", &["-j", &postrouting])?;
        ensure_rule(
            "nat",
            &postrouting,
            &["-s", &self.cidr(), "!", "-o", BRIDGE_NAME, "-j", "MASQUERADE"],
        )?;
        ensure_rule(
            "filter",
            &forward,
            &["-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        )?;

        *ready = true;
        tracing::info!(bridge = BRIDGE_NAME, network = %self.cidr(), "container network initialised");
        Ok(())
    }

    /// The DNAT rule and the matching FORWARD accept of one mapping, as
    /// table, chain and rule arguments.
    fn forward_rules(
        &self,
        handle: &ContainerHandle,
        attachment: &Attachment,
        mapping: PortMapping,
    ) -> Result<[(String, String, Vec<String>); 2]> {
        let ip = attachment.container_ip.ok_or_else(|| PaddockError::Network {
            message: format!("container {handle} has no address"),
        })?;
        let comment = comment(self.slot_of(ip));
        let host_port = mapping.host_port.to_string();
        let container_port = mapping.container_port.to_string();
        let destination = format!("{ip}:{container_port}");
        let address = ip.to_string();
        let owned = |args: &[&str]| args.iter().map(|arg| (*arg).to_owned()).collect::<Vec<_>>();
        Ok([
            (
                "nat".to_owned(),
                chain("PREROUTING"),
                owned(&[
                    "-p", "tcp", "--dport", &host_port, "-m", "comment", "--comment", &comment,
                    "-j", "DNAT", "--to-destination", &destination,
                ]),
            ),
            (
                "filter".to_owned(),
                chain("FORWARD"),
                owned(&[
                    "-d", &address, "-p", "tcp", "--dport", &container_port, "-m", "comment",
                    "--comment", &comment, "-j", "ACCEPT",
                ]),
            ),
        ])
    }

    fn connect(&self, holder_pid: u32, slot: u32, ip: Ipv4Addr, attachment: &Attachment) -> Result<()> {
        let host_if = attachment.interface.as_deref().unwrap_or_default();
        let egress = attachment.chain.as_deref().unwrap_or_default();
        let peer = format!("pdk{slot}c");
        let pid = holder_pid.to_string();
        let address = format!("{ip}/{}", self.prefix);
        let gateway = self.gateway().to_string();
        let comment = comment(slot);

        let _ = run("ip", &["link", "add", host_if, "type", "veth", "peer", "name", &peer])?;
        let _ = run("ip", &["link", "set", host_if, "master", BRIDGE_NAME, "up"])?;
        let _ = run("ip", &["link", "set", &peer, "netns", &pid])?;
        let in_container = |args: &[&str]| {
            let mut full = vec!["--target", pid.as_str(), "--net", "--", "ip"];
            full.extend_from_slice(args);
            run("nsenter", &full)
        };
        let _ = in_container(&["link", "set", "lo", "up"])?;
        let _ = in_container(&["link", "set", &peer, "name", "eth0"])?;
        let _ = in_container(&["addr", "add", &address, "dev", "eth0"])?;
        let _ = in_container(&["link", "set", "eth0", "up"])?;
        let _ = in_container(&["route", "add", "default", "via", &gateway])?;

        let _ = run("iptables", &["-N", egress])?;
        let _ = run("iptables", &["-A", egress, "-j", "DROP"])?;
        let _ = run(
            "iptables",
            &[
                "-A",
                &chain("FORWARD"),
                "-s",
                &ip.to_string(),
                "-m",
                "comment",
                "--comment",
                &comment,
                "-j",
                egress,
            ],
        )?;
        Ok(())
    }
}

impl NetworkBackend for IptablesNetwork {
    fn attach(&self, handle: &ContainerHandle, holder_pid: Option<u32>) -> Result<Attachment> {
        let holder_pid = holder_pid.ok_or_else(|| PaddockError::Network {
            message: "bridged networking needs a network namespace".into(),
        })?;
        self.ensure_ready()?;

        let slot = self.allocate()?;
        let ip = Ipv4Addr::from(u32::from(self.network) + slot);
        let attachment = Attachment {
            container_ip: Some(ip),
            host_ip: Some(self.gateway()),
            interface: Some(format!("pdk{slot}h")),
            chain: Some(chain(&format!("O-{slot}"))),
        };
        if let Err(e) = self.connect(holder_pid, slot, ip, &attachment) {
            if let Err(cleanup) = self.detach(handle, &attachment) {
                tracing::warn!(%handle, error = %cleanup, "partial network cleanup failed");
            }
            return Err(e);
        }
        Ok(attachment)
    }

    fn forward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        for (table, chain, rule) in self.forward_rules(handle, attachment, mapping)? {
            let mut args = vec!["-t", table.as_str(), "-A", chain.as_str()];
            args.extend(rule.iter().map(String::as_str));
            let _ = run("iptables", &args)?;
        }
        Ok(())
    }

    fn unforward(&self, handle: &ContainerHandle, attachment: &Attachment, mapping: PortMapping) -> Result<()> {
        for (table, chain, rule) in self.forward_rules(handle, attachment, mapping)? {
            let mut check = vec!["-t", table.as_str(), "-C", chain.as_str()];
            check.extend(rule.iter().map(String::as_str));
            if run("iptables", &check).is_err() {
                continue;
            }
            check[2] = "-D";
            let _ = run("iptables", &check)?;
        }
        Ok(())
    }

    fn allow(&self, handle: &ContainerHandle, attachment: &Attachment, rule: &NetOutRule) -> Result<()> {
        let egress = attachment.chain.as_deref().ok_or_else(|| PaddockError::Network {
            message: format!("container {handle} has no egress chain"),
        })?;
        for args in allow_rules(egress, rule) {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            let _ = run("iptables", &args)?;
        }
        Ok(())
    }

    fn detach(&self, handle: &ContainerHandle, attachment: &Attachment) -> Result<()> {
        let mut first_error = None;
        let mut note = |result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(%handle, error = %e, "network teardown step failed");
                let _ = first_error.get_or_insert(e);
            }
        };

        if let Some(ip) = attachment.container_ip {
            let comment = comment(self.slot_of(ip));
            note(remove_commented("nat", &chain("PREROUTING"), &comment));
            note(remove_commented("filter", &chain("FORWARD"), &comment));
        }
        if let Some(egress) = &attachment.chain {
            if run("iptables", &["-n", "-L", egress]).is_ok() {
                note(run("iptables", &["-F", egress]).map(drop));
                note(run("iptables", &["-X", egress]).map(drop));
            }
        }
        if let Some(interface) = &attachment.interface {
            if run("ip", &["link", "show", interface]).is_ok() {
                note(run("ip", &["link", "del", interface]).map(drop));
            }
        }
        if let Some(ip) = attachment.container_ip {
            self.free(self.slot_of(ip));
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// `iptables` argument lists for one egress rule: one insert per
/// destination and port combination.
fn allow_rules(egress: &str, rule: &NetOutRule) -> Vec<Vec<String>> {
    let destinations: Vec<Option<Vec<String>>> = if rule.networks.is_empty() {
        vec![None]
    } else {
        rule.networks
            .iter()
            .map(|range| {
                Some(if range.start == range.end {
                    vec!["-d".into(), range.start.to_string()]
                } else {
                    vec!["-m".into(), "iprange".into(), "--dst-range".into(), format!("{}-{}", range.start, range.end)]
                })
            })
            .collect()
    };
    let ports: Vec<Option<String>> = if rule.ports.is_empty() || !rule.protocol.has_ports() {
        vec![None]
    } else {
        rule.ports.iter().map(|p| Some(p.to_string())).collect()
    };

    let mut rules = Vec::with_capacity(destinations.len() * ports.len());
    for destination in &destinations {
        for port in &ports {
            let mut args: Vec<String> = vec!["-I".into(), egress.into(), "1".into(), "-p".into(), rule.protocol.as_str().into()];
            if let Some(destination) = destination {
                args.extend(destination.iter().cloned());
            }
            if let Some(port) = port {
                args.extend(["--dport".into(), port.clone()]);
            }
            args.extend(["-j".into(), "ACCEPT".into()]);
            rules.push(args);
        }
    }
    rules
}

fn chain(suffix: &str) -> String {
    format!("{CHAIN_PREFIX}-{suffix}")
}

fn comment(slot: u32) -> String {
    format!("paddock:{slot}")
}

fn parse_cidr(pool: &str) -> Result<(Ipv4Addr, u8)> {
    let invalid = || PaddockError::Config {
        message: format!("invalid network pool {pool:?}"),
    };
    let (address, prefix) = pool.split_once('/').ok_or_else(invalid)?;
    let address: Ipv4Addr = address.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if !(8..=30).contains(&prefix) {
        return Err(invalid());
    }
    let mask = u32::MAX << (32 - u32::from(prefix));
    Ok((Ipv4Addr::from(u32::from(address) & mask), prefix))
}

/// Creates a chain unless it exists.
fn ensure_chain(table: &str, name: &str) -> Result<()> {
    if run("iptables", &["-t", table, "-n", "-L", name]).is_err() {
        let _ = run("iptables", &["-t", table, "-N", name])?;
    }
    Ok(())
}

/// Inserts a rule at the top of `chain` unless an identical one exists.
fn ensure_rule(table: &str, chain: &str, rule: &[&str]) -> Result<()> {
    let mut check = vec!["-t", table, "-C", chain];
    check.extend_from_slice(rule);
    if run("iptables", &check).is_err() {
        let mut insert = vec!["-t", table, "-I", chain, "1"];
        insert.extend_from_slice(rule);
        let _ = run("iptables", &insert)?;
    }
    Ok(())
}

/// Deletes every rule of `chain` carrying `comment`.
fn remove_commented(table: &str, chain: &str, comment: &str) -> Result<()> {
    let Ok(listing) = run("iptables", &["-t", table, "-S", chain]) else {
        return Ok(());
    };
    let marker = format!("--comment {comment}");
    for line in listing.lines() {
        let matches = line
            .find(&marker)
            .is_some_and(|at| line[at + marker.len()..].starts_with(' ') || at + marker.len() == line.len());
        if !matches {
            continue;
        }
        let Some(spec) = line.strip_prefix(&format!("-A {chain} ")) else {
            continue;
        };
        let mut args = vec!["-t", table, "-D", chain];
        args.extend(spec.split_whitespace());
        let _ = run("iptables", &args)?;
    }
    Ok(())
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program).args(args).output().map_err(|e| PaddockError::Network {
        message: format!("failed to run {program}: {e}"),
    })?;
    if !output.status.success() {
        return Err(PaddockError::Network {
            message: format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use paddock_common::network::{IpRange, PortRange, Protocol};

    use super::*;

    #[test]
    fn pool_is_normalised_to_its_network() {
        let backend = IptablesNetwork::new("10.254.1.77/22").unwrap();
        assert_eq!(backend.network, Ipv4Addr::new(10, 254, 0, 0));
        assert_eq!(backend.gateway(), Ipv4Addr::new(10, 254, 0, 1));
        assert_eq!(backend.slot_count(), 1024);
    }

    #[test]
    fn malformed_pools_are_config_errors() {
        for pool in ["10.0.0.0", "10.0.0.0/31", "nonsense/24", "10.0.0.0/x"] {
            assert!(matches!(IptablesNetwork::new(pool), Err(PaddockError::Config { .. })), "{pool}");
        }
    }

    #[test]
    fn slots_skip_network_gateway_and_broadcast() {
        let backend = IptablesNetwork::new("192.168.9.0/30").unwrap();
        assert_eq!(backend.allocate().unwrap(), 2);
        assert!(backend.allocate().is_err());
        backend.free(2);
        assert_eq!(backend.allocate().unwrap(), 2);
    }

    #[test]
    fn egress_rules_expand_networks_and_ports() {
        let rule = NetOutRule {
            protocol: Protocol::Tcp,
            networks: vec![
                IpRange::single(Ipv4Addr::new(8, 8, 8, 8)),
                "10.0.0.1-10.0.0.9".parse().unwrap(),
            ],
            ports: vec![PortRange::single(53), PortRange { start: 80, end: 90 }],
        };
        let rules = allow_rules("PADDOCK-O-2", &rule);
        assert_eq!(rules.len(), 4);
        assert_eq!(
            rules[0].join(" "),
            "-I PADDOCK-O-2 1 -p tcp -d 8.8.8.8 --dport 53:53 -j ACCEPT"
        );
        assert_eq!(
            rules[3].join(" "),
            "-I PADDOCK-O-2 1 -p tcp -m iprange --dst-range 10.0.0.1-10.0.0.9 --dport 80:90 -j ACCEPT"
        );
    }

    #[test]
    fn allow_all_is_a_single_rule() {
        let rules = allow_rules("PADDOCK-O-2", &NetOutRule::default());
        assert_eq!(rules, vec![vec!["-I", "PADDOCK-O-2", "1", "-p", "all", "-j", "ACCEPT"]]);
    }

    #[test]
    fn mapping_rules_are_tagged_with_the_slot() {
        let backend = IptablesNetwork::new("10.254.0.0/22").unwrap();
        let attachment = Attachment {
            container_ip: Some(Ipv4Addr::new(10, 254, 0, 2)),
            ..Attachment::default()
        };
        let mapping = PortMapping {
            host_port: 61_001,
            container_port: 8080,
        };
        let [(nat, prerouting, dnat), (filter, forward, accept)] =
            backend.forward_rules(&ContainerHandle::new("web"), &attachment, mapping).unwrap();
        assert_eq!((nat.as_str(), filter.as_str()), ("nat", "filter"));
        assert_eq!(prerouting, chain("PREROUTING"));
        assert_eq!(forward, chain("FORWARD"));
        assert_eq!(
            dnat.join(" "),
            format!("-p tcp --dport 61001 -m comment --comment {} -j DNAT --to-destination 10.254.0.2:8080", comment(2))
        );
        assert!(accept.join(" ").starts_with("-d 10.254.0.2 -p tcp --dport 8080"));
    }

    #[test]
    fn unforwarding_without_an_address_is_an_error() {
        let backend = IptablesNetwork::new("10.254.0.0/22").unwrap();
        let mapping = PortMapping {
            host_port: 1,
            container_port: 1,
        };
        let err = backend
            .unforward(&ContainerHandle::new("web"), &Attachment::default(), mapping)
            .unwrap_err();
        assert!(matches!(err, PaddockError::Network { .. }));
    }

    #[test]
    fn detaching_an_empty_attachment_touches_nothing() {
        let backend = IptablesNetwork::new("10.254.0.0/22").unwrap();
        backend
            .detach(&ContainerHandle::new("gone"), &Attachment::default())
            .unwrap();
    }
}
