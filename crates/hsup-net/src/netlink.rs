//! Netlink socket operations for container network plumbing.
//!
//! Low-level rtnetlink interface used to create veth pairs for dynos, move
//! the guest endpoint into a container's network namespace, and configure
//! addresses and routes on both sides.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::error::{NetError, Result};

// Netlink constants
const NETLINK_ROUTE: i32 = 0;

// Netlink message types
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

// Netlink flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLA_F_NESTED: u16 = 1 << 15;

// Interface flags
const IFF_UP: u32 = 0x1;

// Attribute types for RTM_NEWLINK
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_LINK: u16 = 5;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;

// veth nested attributes
const VETH_INFO_PEER: u16 = 1;

// macvlan / ipvlan nested attributes
const IFLA_MACVLAN_MODE: u16 = 1;
const MACVLAN_MODE_BRIDGE: u32 = 4;
const IFLA_IPVLAN_MODE: u16 = 1;
const IPVLAN_MODE_L2: u16 = 0;

// Attribute types for RTM_NEWADDR
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

// Attribute types for RTM_NEWROUTE
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

// Route table and protocol constants
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

/// Netlink message header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

/// Interface info message.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

/// Interface address message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

/// Route message.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

/// Netlink attribute header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// A route to install through [`NetlinkHandle::add_route`].
#[derive(Debug, Clone)]
pub struct Route {
    /// Destination network; a zero-prefix destination is the default route.
    pub destination: IpNetwork,
    /// Next-hop gateway, when not directly connected.
    pub gateway: Option<IpAddr>,
    /// Output interface index.
    pub ifindex: u32,
}

/// Netlink socket handle for network configuration.
pub struct NetlinkHandle {
    fd: std::os::fd::OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Opens and binds a rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = 0;
        let ret = unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(NetError::Netlink(format!(
                "failed to bind netlink socket: {err}"
            )));
        }

        let fd = unsafe { <std::os::fd::OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(fd) };
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends one netlink message and waits for the kernel's acknowledgement.
    fn send_and_ack(&mut self, msg: &[u8]) -> Result<()> {
        use std::os::fd::AsRawFd;

        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(NetError::Netlink(format!(
                "failed to send netlink message: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(format!(
                "failed to receive netlink response: {}",
                io::Error::last_os_error()
            )));
        }

        if len >= mem::size_of::<NlMsgHdr>() as isize {
            let hdr = unsafe { &*buf.as_ptr().cast::<NlMsgHdr>() };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16
                && len >= (mem::size_of::<NlMsgHdr>() + 4) as isize
            {
                let error_code =
                    unsafe { *buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<i32>() };
                if error_code != 0 {
                    return Err(NetError::Netlink(format!(
                        "netlink error: {}",
                        io::Error::from_raw_os_error(-error_code)
                    )));
                }
            }
        }

        Ok(())
    }

    fn finish_link_msg(msg: &mut [u8], seq: u32, msg_type: u16, flags: u16) {
        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));
    }

    /// Creates a veth pair; the peer stays on the host side until moved with
    /// [`NetlinkHandle::set_link_netns_pid`]. Returns the host endpoint's
    /// interface index.
    ///
    /// # Errors
    ///
    /// Returns an error if the pair cannot be created.
    pub fn create_veth_pair(&mut self, host: &str, peer: &str) -> Result<u32> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(256);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        }));

        add_attr_string(&mut msg, IFLA_IFNAME, host);

        // IFLA_LINKINFO { IFLA_INFO_KIND "veth",
        //                 IFLA_INFO_DATA { VETH_INFO_PEER { ifinfomsg, IFLA_IFNAME } } }
        let linkinfo = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, "veth");
        let data = begin_nested(&mut msg, IFLA_INFO_DATA);
        let peer_attr = begin_nested(&mut msg, VETH_INFO_PEER);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        }));
        add_attr_string(&mut msg, IFLA_IFNAME, peer);
        end_nested(&mut msg, peer_attr);
        end_nested(&mut msg, data);
        end_nested(&mut msg, linkinfo);

        Self::finish_link_msg(
            &mut msg,
            seq,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        self.send_and_ack(&msg)?;
        self.get_ifindex(host)
    }

    /// Creates a macvlan (bridge mode) or ipvlan (L2 mode) child of `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be created.
    pub fn create_vlan_child(&mut self, name: &str, parent_ifindex: u32, kind: &str) -> Result<u32> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(192);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        }));

        add_attr_string(&mut msg, IFLA_IFNAME, name);
        add_attr_u32(&mut msg, IFLA_LINK, parent_ifindex);

        let linkinfo = begin_nested(&mut msg, IFLA_LINKINFO);
        add_attr_string(&mut msg, IFLA_INFO_KIND, kind);
        let data = begin_nested(&mut msg, IFLA_INFO_DATA);
        match kind {
            "macvlan" => add_attr_u32(&mut msg, IFLA_MACVLAN_MODE, MACVLAN_MODE_BRIDGE),
            "ipvlan" => add_attr_u16(&mut msg, IFLA_IPVLAN_MODE, IPVLAN_MODE_L2),
            other => {
                return Err(NetError::Netlink(format!(
                    "unsupported secondary interface kind: {other}"
                )))
            }
        }
        end_nested(&mut msg, data);
        end_nested(&mut msg, linkinfo);

        Self::finish_link_msg(
            &mut msg,
            seq,
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        self.send_and_ack(&msg)?;
        self.get_ifindex(name)
    }

    /// Deletes a network interface. Deleting a veth endpoint removes its
    /// peer as well.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be deleted.
    pub fn delete_link(&mut self, ifindex: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ..Default::default()
        }));

        Self::finish_link_msg(&mut msg, seq, RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
    }

    /// Sets interface state (up/down).
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be changed.
    pub fn set_link_state(&mut self, ifindex: u32, up: bool) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ifi_flags: if up { IFF_UP } else { 0 },
            ifi_change: IFF_UP,
            ..Default::default()
        }));

        Self::finish_link_msg(&mut msg, seq, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
    }

    /// Sets an interface MTU.
    ///
    /// # Errors
    ///
    /// Returns an error if the MTU cannot be changed.
    pub fn set_link_mtu(&mut self, ifindex: u32, mtu: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_u32(&mut msg, IFLA_MTU, mtu);

        Self::finish_link_msg(&mut msg, seq, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
    }

    /// Renames an interface. The link must be down.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be renamed.
    pub fn set_link_name(&mut self, ifindex: u32, name: &str) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_string(&mut msg, IFLA_IFNAME, name);

        Self::finish_link_msg(&mut msg, seq, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
    }

    /// Moves an interface into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be moved.
    pub fn set_link_netns_pid(&mut self, ifindex: u32, pid: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        msg.extend_from_slice(as_bytes(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: ifindex as i32,
            ..Default::default()
        }));
        add_attr_u32(&mut msg, IFLA_NET_NS_PID, pid);

        Self::finish_link_msg(&mut msg, seq, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        self.send_and_ack(&msg)
    }

    /// Adds an IP address to an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be added.
    pub fn add_address(&mut self, ifindex: u32, addr: IpNetwork) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(64);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);

        let family = match addr {
            IpNetwork::V4(_) => libc::AF_INET as u8,
            IpNetwork::V6(_) => libc::AF_INET6 as u8,
        };
        msg.extend_from_slice(as_bytes(&IfAddrMsg {
            ifa_family: family,
            ifa_prefixlen: addr.prefix(),
            ifa_flags: 0,
            ifa_scope: 0,
            ifa_index: ifindex,
        }));

        match addr {
            IpNetwork::V4(v4) => {
                add_attr_bytes(&mut msg, IFA_LOCAL, &v4.ip().octets());
                add_attr_bytes(&mut msg, IFA_ADDRESS, &v4.ip().octets());
            }
            IpNetwork::V6(v6) => {
                add_attr_bytes(&mut msg, IFA_LOCAL, &v6.ip().octets());
                add_attr_bytes(&mut msg, IFA_ADDRESS, &v6.ip().octets());
            }
        }

        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type: RTM_NEWADDR,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));

        self.send_and_ack(&msg)
    }

    /// Installs a route.
    ///
    /// # Errors
    ///
    /// Returns an error if the route cannot be added.
    pub fn add_route(&mut self, route: &Route) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = Vec::with_capacity(128);

        msg.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);

        let family = match route.destination {
            IpNetwork::V4(_) => libc::AF_INET as u8,
            IpNetwork::V6(_) => libc::AF_INET6 as u8,
        };
        msg.extend_from_slice(as_bytes(&RtMsg {
            rtm_family: family,
            rtm_dst_len: route.destination.prefix(),
            rtm_src_len: 0,
            rtm_tos: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_UNIVERSE,
            rtm_type: RTN_UNICAST,
            rtm_flags: 0,
        }));

        if route.destination.prefix() > 0 {
            match route.destination {
                IpNetwork::V4(v4) => add_attr_bytes(&mut msg, RTA_DST, &v4.ip().octets()),
                IpNetwork::V6(v6) => add_attr_bytes(&mut msg, RTA_DST, &v6.ip().octets()),
            }
        }

        if let Some(gateway) = route.gateway {
            match gateway {
                IpAddr::V4(v4) => add_attr_bytes(&mut msg, RTA_GATEWAY, &v4.octets()),
                IpAddr::V6(v6) => add_attr_bytes(&mut msg, RTA_GATEWAY, &v6.octets()),
            }
        }

        add_attr_u32(&mut msg, RTA_OIF, route.ifindex);

        let hdr = NlMsgHdr {
            nlmsg_len: msg.len() as u32,
            nlmsg_type: RTM_NEWROUTE,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        msg[..mem::size_of::<NlMsgHdr>()].copy_from_slice(as_bytes(&hdr));

        self.send_and_ack(&msg)
    }

    /// Looks up an interface index by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface is not found.
    pub fn get_ifindex(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|e| NetError::Netlink(e.to_string()))?;
        let ifindex = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if ifindex == 0 {
            return Err(NetError::Netlink(format!("interface not found: {name}")));
        }
        Ok(ifindex)
    }
}

/// Starts a nested attribute, returning the position of its placeholder
/// header for [`end_nested`].
fn begin_nested(msg: &mut Vec<u8>, attr_type: u16) -> (usize, u16) {
    let start = msg.len();
    msg.extend_from_slice(&[0u8; mem::size_of::<NlAttr>()]);
    (start, attr_type)
}

/// Backfills the header of a nested attribute started with [`begin_nested`].
fn end_nested(msg: &mut [u8], marker: (usize, u16)) {
    let (start, attr_type) = marker;
    let attr = NlAttr {
        nla_len: (msg.len() - start) as u16,
        nla_type: attr_type | NLA_F_NESTED,
    };
    msg[start..start + mem::size_of::<NlAttr>()].copy_from_slice(as_bytes(&attr));
}

fn add_attr_string(msg: &mut Vec<u8>, attr_type: u16, value: &str) {
    let value_bytes = value.as_bytes();
    let attr_len = mem::size_of::<NlAttr>() + value_bytes.len() + 1;
    let padded_len = (attr_len + 3) & !3;

    let attr = NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    };
    msg.extend_from_slice(as_bytes(&attr));
    msg.extend_from_slice(value_bytes);
    msg.push(0);
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

fn add_attr_u32(msg: &mut Vec<u8>, attr_type: u16, value: u32) {
    let attr = NlAttr {
        nla_len: (mem::size_of::<NlAttr>() + mem::size_of::<u32>()) as u16,
        nla_type: attr_type,
    };
    msg.extend_from_slice(as_bytes(&attr));
    msg.extend_from_slice(&value.to_ne_bytes());
}

fn add_attr_u16(msg: &mut Vec<u8>, attr_type: u16, value: u16) {
    let attr_len = mem::size_of::<NlAttr>() + mem::size_of::<u16>();
    let padded_len = (attr_len + 3) & !3;
    let attr = NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    };
    msg.extend_from_slice(as_bytes(&attr));
    msg.extend_from_slice(&value.to_ne_bytes());
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

fn add_attr_bytes(msg: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = mem::size_of::<NlAttr>() + value.len();
    let padded_len = (attr_len + 3) & !3;

    let attr = NlAttr {
        nla_len: attr_len as u16,
        nla_type: attr_type,
    };
    msg.extend_from_slice(as_bytes(&attr));
    msg.extend_from_slice(value);
    msg.extend(std::iter::repeat(0).take(padded_len - attr_len));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netlink_handle_creation() {
        // Requires privileges and a netlink-capable kernel.
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping: requires root privileges");
            return;
        }
        assert!(NetlinkHandle::new().is_ok());
    }

    #[test]
    fn ifindex_loopback() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("skipping: requires root privileges");
            return;
        }
        let handle = NetlinkHandle::new().unwrap();
        assert!(handle.get_ifindex("lo").unwrap() > 0);
    }

    #[test]
    fn string_attrs_are_padded() {
        let mut msg = Vec::new();
        add_attr_string(&mut msg, IFLA_IFNAME, "eth0");
        // 4 header + 4 value + 1 NUL = 9, padded to 12.
        assert_eq!(msg.len(), 12);
    }
}
