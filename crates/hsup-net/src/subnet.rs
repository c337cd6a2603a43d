//! Operations on single-host /30 IPv4 networks.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{NetError, Result};

/// A /30 IPv4 network holding exactly four addresses, of which only one is
/// usable for a host: 1) network address, 2) gateway ip, 3) host ip and
/// 4) broadcast ip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallSubnet {
    network: Ipv4Network,
}

impl SmallSubnet {
    /// Wraps a /30 network.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidMask`] when the prefix is not 30.
    pub fn new(network: Ipv4Network) -> Result<Self> {
        if network.prefix() != 30 {
            return Err(NetError::InvalidMask);
        }
        Ok(Self {
            network: Ipv4Network::new(network.network(), 30).expect("/30 is a valid prefix"),
        })
    }

    fn nth(&self, offset: u32) -> Ipv4Network {
        let ip = Ipv4Addr::from(u32::from(self.network.ip()) + offset);
        Ipv4Network::new(ip, 30).expect("/30 is a valid prefix")
    }

    /// The network address and mask.
    #[must_use]
    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    /// Gateway address and mask of the subnet, assigned to the host-side
    /// veth endpoint.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Network {
        self.nth(1)
    }

    /// The only unassigned (free) address in the subnet, assigned inside
    /// the container.
    #[must_use]
    pub fn host(&self) -> Ipv4Network {
        self.nth(2)
    }

    /// Broadcast address and mask of the subnet.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Network {
        self.nth(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_non_slash_30() {
        assert!(SmallSubnet::new(net("172.16.0.0/24")).is_err());
        assert!(SmallSubnet::new(net("172.16.0.0/32")).is_err());
    }

    #[test]
    fn address_layout() {
        let sn = SmallSubnet::new(net("172.16.0.28/30")).unwrap();
        assert_eq!(sn.network(), net("172.16.0.28/30"));
        assert_eq!(sn.gateway(), net("172.16.0.29/30"));
        assert_eq!(sn.host(), net("172.16.0.30/30"));
        assert_eq!(sn.broadcast(), net("172.16.0.31/30"));
    }

    #[test]
    fn normalizes_to_network_address() {
        let sn = SmallSubnet::new(net("172.16.0.30/30")).unwrap();
        assert_eq!(sn.network(), net("172.16.0.28/30"));
    }
}
