//! Link and address management over rtnetlink
//!
//! Provides:
//! - Link lookup by index or name (`RTM_GETLINK`)
//! - Bridge creation and link deletion (`RTM_NEWLINK` / `RTM_DELLINK`)
//! - Administrative up (`IFF_UP`)
//! - IPv4 address assignment (`RTM_NEWADDR`)

use crate::error::{Error, Result};
use crate::netlink::attr::{self, Attribute};
use crate::netlink::codec::{
    AddressInfo, InterfaceInfo, MessageFlags, NetlinkMessage, NetlinkRequest, RTM_DELLINK,
    RTM_GETLINK, RTM_NEWADDR, RTM_NEWLINK, WireOrder,
};
use crate::netlink::socket::NetlinkSocket;
use ipnet::Ipv4Net;
use nix::errno::Errno;
use tracing::debug;

const IFLA_IFNAME: u16 = libc::IFLA_IFNAME as u16;
const IFLA_MTU: u16 = libc::IFLA_MTU as u16;
const IFLA_LINKINFO: u16 = libc::IFLA_LINKINFO as u16;
const IFLA_INFO_KIND: u16 = libc::IFLA_INFO_KIND as u16;
const IFA_ADDRESS: u16 = libc::IFA_ADDRESS as u16;
const IFA_LOCAL: u16 = libc::IFA_LOCAL as u16;
const IFF_UP: u32 = libc::IFF_UP as u32;

/// Maximum interface name length, NUL excluded
pub const MAX_IFNAME_LEN: usize = libc::IF_NAMESIZE - 1;

/// A live network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
    /// `IFLA_INFO_KIND` of virtual links ("bridge", "veth", ...)
    pub kind: Option<String>,
}

impl Link {
    /// Build a link from an `RTM_NEWLINK` message
    pub fn from_message(msg: &NetlinkMessage) -> Result<Self> {
        let info = InterfaceInfo::decode::<WireOrder>(&msg.data)?;
        let attrs = msg.attributes(InterfaceInfo::LEN)?;

        let name = attr::find(&attrs, IFLA_IFNAME)
            .and_then(Attribute::as_str)
            .ok_or_else(|| {
                Error::MalformedMessage(format!("link {} has no IFLA_IFNAME", info.index))
            })?
            .to_string();

        let kind = match attr::find(&attrs, IFLA_LINKINFO) {
            Some(link_info) => attr::find(&link_info.nested()?, IFLA_INFO_KIND)
                .and_then(Attribute::as_str)
                .map(str::to_string),
            None => None,
        };

        Ok(Self {
            index: info.index as u32,
            name,
            mtu: attr::find(&attrs, IFLA_MTU).and_then(Attribute::as_u32),
            kind,
        })
    }

    pub fn is_bridge(&self) -> bool {
        self.kind.as_deref() == Some("bridge")
    }
}

/// Check an interface name fits the kernel's limit
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IFNAME_LEN || name.contains(['/', '\0']) {
        return Err(Error::InvalidName(format!(
            "{} (interface names are 1-{} chars, no '/')",
            name, MAX_IFNAME_LEN
        )));
    }
    Ok(())
}

/// Look up a link by kernel index
pub fn get_by_index(sock: &NetlinkSocket, index: u32) -> Result<Link> {
    let request = NetlinkRequest::new(RTM_GETLINK, MessageFlags::empty())
        .with_data(InterfaceInfo::for_index(index));

    match single_link(sock, &request) {
        Err(e) if e.errno() == Some(Errno::ENODEV) => {
            Err(Error::InterfaceNotFound(format!("index {}", index)))
        }
        other => other,
    }
}

/// Look up a link by name
///
/// Returns `None` when no such interface exists; any other failure is an error.
pub fn get_by_name(sock: &NetlinkSocket, name: &str) -> Result<Option<Link>> {
    validate_name(name)?;

    let request = NetlinkRequest::new(RTM_GETLINK, MessageFlags::empty())
        .with_data(InterfaceInfo::for_index(0))
        .with_data(Attribute::string(IFLA_IFNAME, name));

    match single_link(sock, &request) {
        Ok(link) => Ok(Some(link)),
        Err(e) if e.errno() == Some(Errno::ENODEV) => Ok(None),
        Err(e) => Err(e),
    }
}

fn single_link(sock: &NetlinkSocket, request: &NetlinkRequest) -> Result<Link> {
    let messages = sock.query(request)?;
    let msg = messages
        .iter()
        .find(|m| m.header.kind == RTM_NEWLINK)
        .ok_or_else(|| Error::MalformedMessage("RTM_GETLINK returned no link".to_string()))?;
    Link::from_message(msg)
}

/// Request that creates a bridge device named `name`
pub fn create_bridge_request(name: &str) -> NetlinkRequest {
    let link_info =
        Attribute::container(IFLA_LINKINFO).with_child(Attribute::string(IFLA_INFO_KIND, "bridge"));

    NetlinkRequest::new(RTM_NEWLINK, MessageFlags::CREATE | MessageFlags::EXCL)
        .with_data(InterfaceInfo::for_index(0))
        .with_data(Attribute::string(IFLA_IFNAME, name))
        .with_data(link_info)
}

/// Create a bridge device
pub fn create_bridge(sock: &NetlinkSocket, name: &str) -> Result<()> {
    validate_name(name)?;
    debug!(name, "creating bridge link");
    sock.execute(create_bridge_request(name))
}

/// Delete a link
pub fn delete(sock: &NetlinkSocket, link: &Link) -> Result<()> {
    debug!(name = %link.name, index = link.index, "deleting link");
    let request = NetlinkRequest::new(RTM_DELLINK, MessageFlags::empty())
        .with_data(InterfaceInfo::for_index(link.index));
    sock.execute(request)
}

/// Request that sets `IFF_UP` on a link
pub fn set_up_request(index: u32) -> NetlinkRequest {
    let info = InterfaceInfo {
        flags: IFF_UP,
        change: IFF_UP,
        ..InterfaceInfo::for_index(index)
    };
    NetlinkRequest::new(RTM_NEWLINK, MessageFlags::empty()).with_data(info)
}

/// Bring a link administratively up
pub fn set_up(sock: &NetlinkSocket, link: &Link) -> Result<()> {
    debug!(name = %link.name, "setting link up");
    sock.execute(set_up_request(link.index))
}

/// Request that assigns `addr` (address + prefix) to a link
pub fn add_address_request(index: u32, addr: Ipv4Net) -> NetlinkRequest {
    let info = AddressInfo {
        family: libc::AF_INET as u8,
        prefix_len: addr.prefix_len(),
        index,
        ..Default::default()
    };

    NetlinkRequest::new(RTM_NEWADDR, MessageFlags::CREATE | MessageFlags::EXCL)
        .with_data(info)
        .with_data(Attribute::ipv4(IFA_LOCAL, addr.addr()))
        .with_data(Attribute::ipv4(IFA_ADDRESS, addr.addr()))
}

/// Assign an IPv4 address to a link
///
/// The kernel installs the connected route for the prefix.
pub fn add_address(sock: &NetlinkSocket, link: &Link, addr: Ipv4Net) -> Result<()> {
    debug!(name = %link.name, %addr, "adding address");
    sock.execute(add_address_request(link.index, addr))
}
