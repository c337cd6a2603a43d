//! Host networking for dyno containers.
//!
//! Each container gets a /30 subnet realized as a veth pair: the gateway
//! address lives on the host endpoint, the host (free) address is assigned
//! inside the container's network namespace, and outbound traffic is
//! masqueraded. An optional macvlan/ipvlan secondary interface and static
//! routes can be layered on top.

pub mod config;
pub mod error;
pub mod iptables;
pub mod netlink;
pub mod subnet;

pub use config::{ExtraInterface, NetConfig, StaticRoute, VlanKind};
pub use error::{NetError, Result};
pub use iptables::{ensure_masquerade, enable_packet_forwarding, PortMap, CONTAINER_PORT};
pub use netlink::{NetlinkHandle, Route};
pub use subnet::SmallSubnet;
