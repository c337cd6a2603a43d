//! Container networking policy, read from the environment at load time.

use std::env;
use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network};

use crate::error::{NetError, Result};

/// Default private block for dyno subnets: 172.16/12 (RFC1918), starting at
/// 172.16.0.28/30 to avoid clashes with IPs used by cloud providers (the
/// internal DNS server is 172.16.0.23 on ec2-classic).
pub const DEFAULT_SUBNET: &str = "172.16.0.28/12";

/// Default dyno uid range; leaves room for roughly 8K concurrent dynos.
pub const DEFAULT_UID_MIN: u32 = 3000;
pub const DEFAULT_UID_MAX: u32 = 11000;

/// Secondary interface flavors supported for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanKind {
    Macvlan,
    Ipvlan,
}

impl VlanKind {
    /// The kernel link kind string.
    #[must_use]
    pub fn kind(self) -> &'static str {
        match self {
            Self::Macvlan => "macvlan",
            Self::Ipvlan => "ipvlan",
        }
    }
}

/// Optional secondary container interface with a static address,
/// e.g. `macvlan:eth0:10.1.2.3/24`.
#[derive(Debug, Clone)]
pub struct ExtraInterface {
    pub kind: VlanKind,
    pub parent: String,
    pub address: Ipv4Network,
}

/// A static route expressed as a `dest:gateway:ifname` triple.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub destination: IpNetwork,
    pub gateway: Ipv4Addr,
    pub ifname: String,
}

/// Networking policy for the container backend.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Private block the dyno /30 subnets are carved from. The address part
    /// marks the first /30 to hand out; the prefix bounds the block.
    pub private_subnet: Ipv4Network,
    pub uid_min: u32,
    pub uid_max: u32,
    pub extra_interface: Option<ExtraInterface>,
    pub extra_routes: Vec<StaticRoute>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            private_subnet: DEFAULT_SUBNET.parse().expect("default subnet parses"),
            uid_min: DEFAULT_UID_MIN,
            uid_max: DEFAULT_UID_MAX,
            extra_interface: None,
            extra_routes: Vec::new(),
        }
    }
}

impl NetConfig {
    /// Reads custom configuration from the environment:
    /// `LIBCONTAINER_DYNO_SUBNET`, `LIBCONTAINER_DYNO_UID_MIN`,
    /// `LIBCONTAINER_DYNO_UID_MAX`, `LIBCONTAINER_DYNO_EXTRA_INTERFACE`,
    /// `LIBCONTAINER_DYNO_EXTRA_ROUTES`.
    ///
    /// # Errors
    ///
    /// Returns an error when a set variable cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(custom) = env_trimmed("LIBCONTAINER_DYNO_SUBNET") {
            config.private_subnet = custom
                .parse()
                .map_err(|e| NetError::Config(format!("LIBCONTAINER_DYNO_SUBNET: {e}")))?;
        }
        if let Some(min) = env_trimmed("LIBCONTAINER_DYNO_UID_MIN") {
            config.uid_min = min
                .parse()
                .map_err(|e| NetError::Config(format!("LIBCONTAINER_DYNO_UID_MIN: {e}")))?;
        }
        if let Some(max) = env_trimmed("LIBCONTAINER_DYNO_UID_MAX") {
            config.uid_max = max
                .parse()
                .map_err(|e| NetError::Config(format!("LIBCONTAINER_DYNO_UID_MAX: {e}")))?;
        }
        if let Some(spec) = env_trimmed("LIBCONTAINER_DYNO_EXTRA_INTERFACE") {
            config.extra_interface = Some(parse_extra_interface(&spec)?);
        }
        if let Some(spec) = env_trimmed("LIBCONTAINER_DYNO_EXTRA_ROUTES") {
            config.extra_routes = spec
                .split(',')
                .map(parse_route)
                .collect::<Result<Vec<_>>>()?;
        }

        Ok(config)
    }
}

fn env_trimmed(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn parse_extra_interface(spec: &str) -> Result<ExtraInterface> {
    let parts: Vec<&str> = spec.split(':').collect();
    let &[kind, parent, address] = parts.as_slice() else {
        return Err(NetError::Config(format!(
            "expected kind:parent:address/prefix, got {spec:?}"
        )));
    };
    let kind = match kind {
        "macvlan" => VlanKind::Macvlan,
        "ipvlan" => VlanKind::Ipvlan,
        other => {
            return Err(NetError::Config(format!(
                "unknown secondary interface kind {other:?}"
            )))
        }
    };
    Ok(ExtraInterface {
        kind,
        parent: parent.to_string(),
        address: address
            .parse()
            .map_err(|e| NetError::Config(format!("secondary interface address: {e}")))?,
    })
}

fn parse_route(spec: &str) -> Result<StaticRoute> {
    let parts: Vec<&str> = spec.trim().split(':').collect();
    let &[dest, gateway, ifname] = parts.as_slice() else {
        return Err(NetError::Config(format!(
            "expected dest:gateway:ifname, got {spec:?}"
        )));
    };
    Ok(StaticRoute {
        destination: dest
            .parse()
            .map_err(|e| NetError::Config(format!("route destination: {e}")))?,
        gateway: gateway
            .parse()
            .map_err(|e| NetError::Config(format!("route gateway: {e}")))?,
        ifname: ifname.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_starts_past_reserved_addresses() {
        let config = NetConfig::default();
        assert_eq!(config.private_subnet.ip(), Ipv4Addr::new(172, 16, 0, 28));
        assert_eq!(config.private_subnet.prefix(), 12);
        assert_eq!(config.uid_min, 3000);
        assert_eq!(config.uid_max, 11000);
    }

    #[test]
    fn extra_interface_parses() {
        let iface = parse_extra_interface("macvlan:eth0:10.1.2.3/24").unwrap();
        assert_eq!(iface.kind, VlanKind::Macvlan);
        assert_eq!(iface.parent, "eth0");
        assert_eq!(iface.address.to_string(), "10.1.2.3/24");

        assert!(parse_extra_interface("bridge:eth0:10.1.2.3/24").is_err());
        assert!(parse_extra_interface("macvlan:eth0").is_err());
    }

    #[test]
    fn routes_parse() {
        let route = parse_route("10.0.0.0/8:10.1.2.1:eth1").unwrap();
        assert_eq!(route.destination.to_string(), "10.0.0.0/8");
        assert_eq!(route.gateway, Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(route.ifname, "eth1");

        assert!(parse_route("10.0.0.0/8").is_err());
        assert!(parse_route("10.0.0.0/8:nonsense:eth1").is_err());
    }
}
