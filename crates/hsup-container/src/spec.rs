//! Serializable container assembly directive.
//!
//! A [`ContainerSpec`] describes everything the in-container init stage
//! needs to finish assembly from inside the new namespaces: the mount plan,
//! network addresses, capability whitelist and the identity to drop to. It
//! is embedded in the startup blob so one environment variable carries the
//! whole directive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Namespaces a dyno container always gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Pid,
    Mount,
    Uts,
    Ipc,
    Net,
}

/// The default namespace set for dyno containers.
pub const DEFAULT_NAMESPACES: [NamespaceKind; 5] = [
    NamespaceKind::Pid,
    NamespaceKind::Mount,
    NamespaceKind::Uts,
    NamespaceKind::Ipc,
    NamespaceKind::Net,
];

/// Capability whitelist retained by container workloads.
pub const DEFAULT_CAPABILITIES: [&str; 14] = [
    "CHOWN",
    "DAC_OVERRIDE",
    "FSETID",
    "FOWNER",
    "MKNOD",
    "NET_RAW",
    "SETGID",
    "SETUID",
    "SETFCAP",
    "SETPCAP",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "KILL",
    "AUDIT_WRITE",
];

/// Proc entries hidden from containers entirely.
pub const DEFAULT_MASKED_PATHS: [&str; 3] =
    ["/proc/kcore", "/proc/latency_stats", "/proc/timer_stats"];

/// Proc entries visible but immutable inside containers.
pub const DEFAULT_READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// One bind from a host path onto a container path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
    pub writable: bool,
}

/// A static route installed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Destination in CIDR form.
    pub destination: String,
    pub gateway: String,
    pub ifname: String,
}

/// An optional secondary interface moved into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraNicSpec {
    /// Host-side name the interface arrives under.
    pub interface: String,
    /// Name to give it inside the container.
    pub rename_to: String,
    /// Static address in CIDR form.
    pub address: String,
}

/// The container's primary (routed veth) network, plus extras.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Name the veth guest endpoint arrives under.
    pub interface: String,
    /// Name to give the primary interface inside the container.
    pub rename_to: String,
    /// The container's address in CIDR form (the /30's host address).
    pub address: String,
    /// Default-route gateway (the /30's gateway address).
    pub gateway: String,
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<ExtraNicSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteSpec>,
}

/// Complete assembly directive for one dyno container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// The bind-mounted, read-only stack image serving as root.
    pub rootfs: PathBuf,
    /// Container hostname; always the container UUID.
    pub hostname: String,
    /// The dyno user the workload drops to.
    pub uid: u32,
    pub gid: u32,
    /// Working directory of the workload.
    pub workdir: String,
    pub binds: Vec<BindMount>,
    pub namespaces: Vec<NamespaceKind>,
    pub capabilities: Vec<String>,
    pub readonly_rootfs: bool,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub network: NetworkSpec,
}

impl ContainerSpec {
    /// The standard dyno container layout: writable `/app`, `/dev`, `/tmp`
    /// and `/var/tmp` out of the per-container data directory, a
    /// synthesized read-only `/etc/passwd`, the host's resolv.conf, and
    /// any caller-requested host binds.
    #[must_use]
    pub fn for_dyno(
        uuid: &str,
        uid: u32,
        data_dir: &Path,
        network: NetworkSpec,
        host_binds: &BTreeMap<String, String>,
    ) -> Self {
        let mut binds = vec![
            BindMount {
                source: data_dir.join("app"),
                destination: "/app".to_string(),
                writable: true,
            },
            BindMount {
                source: data_dir.join("dev"),
                destination: "/dev".to_string(),
                writable: true,
            },
            BindMount {
                source: data_dir.join("tmp"),
                destination: "/tmp".to_string(),
                writable: true,
            },
            BindMount {
                source: data_dir.join("var/tmp"),
                destination: "/var/tmp".to_string(),
                writable: true,
            },
            BindMount {
                source: data_dir.join("passwd"),
                destination: "/etc/passwd".to_string(),
                writable: false,
            },
            BindMount {
                source: PathBuf::from("/etc/resolv.conf"),
                destination: "/etc/resolv.conf".to_string(),
                writable: false,
            },
        ];
        for (host, guest) in host_binds {
            binds.push(BindMount {
                source: PathBuf::from(host),
                destination: guest.clone(),
                writable: true,
            });
        }

        Self {
            rootfs: data_dir.join("root"),
            hostname: uuid.to_string(),
            uid,
            gid: uid,
            workdir: "/app".to_string(),
            binds,
            namespaces: DEFAULT_NAMESPACES.to_vec(),
            capabilities: DEFAULT_CAPABILITIES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            readonly_rootfs: true,
            masked_paths: DEFAULT_MASKED_PATHS.iter().map(|s| (*s).to_string()).collect(),
            readonly_paths: DEFAULT_READONLY_PATHS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> NetworkSpec {
        NetworkSpec {
            interface: "veth3000c".to_string(),
            rename_to: "eth0".to_string(),
            address: "172.16.0.30/30".to_string(),
            gateway: "172.16.0.29".to_string(),
            mtu: 1500,
            extra: None,
            routes: Vec::new(),
        }
    }

    #[test]
    fn dyno_layout_contains_the_standard_mounts() {
        let binds: BTreeMap<String, String> =
            [("/var/run/x".to_string(), "/run/x".to_string())].into();
        let spec = ContainerSpec::for_dyno("u-u-i-d", 3000, Path::new("/w/containers/u"), network(), &binds);

        assert_eq!(spec.rootfs, Path::new("/w/containers/u/root"));
        assert_eq!(spec.hostname, "u-u-i-d");
        assert_eq!(spec.uid, 3000);
        assert!(spec.readonly_rootfs);

        let dests: Vec<&str> = spec.binds.iter().map(|b| b.destination.as_str()).collect();
        assert_eq!(
            dests,
            vec!["/app", "/dev", "/tmp", "/var/tmp", "/etc/passwd", "/etc/resolv.conf", "/run/x"]
        );
        let passwd = spec
            .binds
            .iter()
            .find(|b| b.destination == "/etc/passwd")
            .unwrap();
        assert!(!passwd.writable);
        assert_eq!(passwd.source, Path::new("/w/containers/u/passwd"));
    }

    #[test]
    fn default_policy_sets() {
        let spec = ContainerSpec::for_dyno(
            "x",
            3000,
            Path::new("/w/containers/x"),
            network(),
            &BTreeMap::new(),
        );
        assert_eq!(spec.namespaces.len(), 5);
        assert!(spec.capabilities.iter().any(|c| c == "SYS_CHROOT"));
        assert!(!spec.capabilities.iter().any(|c| c == "SYS_ADMIN"));
        assert!(spec.masked_paths.contains(&"/proc/kcore".to_string()));
        assert!(spec.readonly_paths.contains(&"/proc/sys".to_string()));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = ContainerSpec::for_dyno(
            "x",
            3001,
            Path::new("/w/containers/x"),
            network(),
            &BTreeMap::new(),
        );
        let value = serde_json::to_value(&spec).unwrap();
        let back: ContainerSpec = serde_json::from_value(value).unwrap();
        assert_eq!(spec, back);
    }
}
