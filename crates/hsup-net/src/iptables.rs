//! iptables NAT rules for container subnets.
//!
//! Containers get layer-3-only connectivity: outbound traffic from the
//! private dyno block is masqueraded once per host, and an optional DNAT
//! chain per container forwards one host port to the dyno's fixed in-container
//! port.

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

use ipnetwork::Ipv4Network;
use once_cell::sync::Lazy;

use crate::error::{NetError, Result};

/// The port the abspath backend hardcodes inside containers.
pub const CONTAINER_PORT: u16 = 5000;

/// Subnets this process has already ensured a MASQUERADE rule for.
static MASQUERADED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn raw(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables").args(args).output()?;
    if !output.status.success() || !output.stdout.is_empty() {
        return Err(NetError::Iptables {
            chain: args.first().copied().unwrap_or("?").to_string(),
            output: format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    Ok(())
}

fn exists(args: &[&str]) -> bool {
    let mut check = vec!["-C"];
    check.extend_from_slice(args);
    Command::new("iptables")
        .args(&check)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Enables IPv4 packet forwarding on the host.
///
/// # Errors
///
/// Returns an error if `/proc/sys/net/ipv4/ip_forward` cannot be written.
pub fn enable_packet_forwarding() -> Result<()> {
    fs::write("/proc/sys/net/ipv4/ip_forward", b"1\n")?;
    Ok(())
}

/// Ensures outbound traffic from `subnet` is masqueraded.
///
/// The rule is process-wide state: it is inserted at most once per
/// (process, subnet), and left in place on shutdown so concurrent
/// supervisors on the same host keep working.
///
/// # Errors
///
/// Returns an error if the iptables invocation fails.
pub fn ensure_masquerade(subnet: Ipv4Network) -> Result<()> {
    let key = subnet.to_string();
    let mut done = MASQUERADED.lock().unwrap_or_else(|e| e.into_inner());
    if done.contains(&key) {
        return Ok(());
    }

    let rule = ["POSTROUTING", "-t", "nat", "-s", &key, "-j", "MASQUERADE"];
    if !exists(&rule) {
        raw(&["-I", "POSTROUTING", "-t", "nat", "-s", &key, "-j", "MASQUERADE"])?;
    }
    done.insert(key);
    Ok(())
}

/// Per-container DNAT rules forwarding one host port to the dyno.
///
/// Each container must use a different `chain_id`; the allocated uid is a
/// natural fit.
#[derive(Debug, Clone)]
pub struct PortMap {
    pub chain_id: u32,
    pub port: u16,
    pub container_ip: Ipv4Addr,
}

impl PortMap {
    fn chain(&self) -> String {
        format!("dnat-{}", self.chain_id)
    }

    /// Installs the DNAT chain and its PREROUTING/OUTPUT links.
    ///
    /// # Errors
    ///
    /// Returns an error if any rule cannot be installed.
    pub fn create(&self) -> Result<()> {
        let chain = self.chain();
        let port = self.port.to_string();
        let dest = format!("{}:{}", self.container_ip, CONTAINER_PORT);

        raw(&["-t", "nat", "-N", &chain])?;
        raw(&[
            "-t", "nat", "-A", &chain, "-p", "tcp", "--dport", &port, "-j", "DNAT",
            "--to-destination", &dest,
        ])?;

        // Links from PREROUTING (remote) and OUTPUT (local connections).
        raw(&[
            "-t", "nat", "-A", "PREROUTING", "-m", "addrtype", "--dst-type", "LOCAL", "-j",
            &chain,
        ])?;
        raw(&[
            "-t", "nat", "-A", "OUTPUT", "-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst",
            "127.0.0.0/8", "-j", &chain,
        ])?;

        Ok(())
    }

    /// Removes everything installed by [`PortMap::create`].
    ///
    /// # Errors
    ///
    /// Returns an error if any rule cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        let chain = self.chain();

        raw(&[
            "-t", "nat", "-D", "OUTPUT", "-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst",
            "127.0.0.0/8", "-j", &chain,
        ])?;
        raw(&[
            "-t", "nat", "-D", "PREROUTING", "-m", "addrtype", "--dst-type", "LOCAL", "-j",
            &chain,
        ])?;
        raw(&["-t", "nat", "-F", &chain])?;
        raw(&["-t", "nat", "-X", &chain])?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_are_per_container() {
        let map = PortMap {
            chain_id: 3000,
            port: 8000,
            container_ip: Ipv4Addr::new(172, 16, 0, 30),
        };
        assert_eq!(map.chain(), "dnat-3000");
    }
}
