//! IPv4 route table query
//!
//! Dumps the main routing table and resolves each route's output interface,
//! mainly to find the interface (and MTU) behind the default route.

use crate::error::{Error, Result};
use crate::netlink::attr::{self, Attribute};
use crate::netlink::codec::{
    MessageFlags, NetlinkMessage, NetlinkRequest, RTM_GETROUTE, RTM_NEWROUTE, RouteInfo,
    WireOrder,
};
use crate::netlink::link::{self, Link};
use crate::netlink::socket::NetlinkSocket;
use ipnet::Ipv4Net;
use std::collections::HashMap;
use tracing::{debug, info};

const RTA_DST: u16 = libc::RTA_DST as u16;
const RTA_OIF: u16 = libc::RTA_OIF as u16;
const RT_TABLE_MAIN: u8 = libc::RT_TABLE_MAIN as u8;
const RTM_F_CLONED: u32 = libc::RTM_F_CLONED as u32;

/// MTU assumed when the default interface does not report one
pub const FALLBACK_MTU: u32 = 1500;

/// A route from the main table, interface not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Option<Ipv4Net>,
    pub oif: Option<u32>,
    pub is_default: bool,
}

/// A route with its output interface resolved to a live link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Option<Ipv4Net>,
    pub interface: Option<Link>,
    pub is_default: bool,
}

/// Parse one `RTM_NEWROUTE` message
///
/// Returns `None` for routes outside the IPv4 main table and for cloned
/// (cache) entries.
pub fn parse_route(msg: &NetlinkMessage) -> Result<Option<RouteEntry>> {
    if msg.header.kind != RTM_NEWROUTE {
        return Ok(None);
    }

    let info = RouteInfo::decode::<WireOrder>(&msg.data)?;
    if info.family != libc::AF_INET as u8
        || info.table != RT_TABLE_MAIN
        || info.flags & RTM_F_CLONED != 0
    {
        return Ok(None);
    }

    let attrs = msg.attributes(RouteInfo::LEN)?;

    let destination = match attr::find(&attrs, RTA_DST) {
        Some(dst) => {
            let addr = dst.as_ipv4().ok_or_else(|| {
                Error::MalformedMessage(format!("RTA_DST has {} bytes", dst.data.len()))
            })?;
            let net = Ipv4Net::new(addr, info.dst_len).map_err(|_| {
                Error::MalformedMessage(format!("route prefix length {}", info.dst_len))
            })?;
            Some(net)
        }
        None => None,
    };

    Ok(Some(RouteEntry {
        destination,
        oif: attr::find(&attrs, RTA_OIF).and_then(Attribute::as_u32),
        is_default: info.dst_len == 0,
    }))
}

/// Request that dumps every IPv4 route
pub fn dump_request() -> NetlinkRequest {
    let info = RouteInfo {
        family: libc::AF_INET as u8,
        ..Default::default()
    };
    NetlinkRequest::new(RTM_GETROUTE, MessageFlags::DUMP).with_data(info)
}

/// Dump the IPv4 main routing table
pub fn routes(sock: &NetlinkSocket) -> Result<Vec<Route>> {
    let messages = sock.query(&dump_request())?;

    let mut entries = Vec::new();
    for msg in &messages {
        if let Some(entry) = parse_route(msg)? {
            entries.push(entry);
        }
    }
    debug!(count = entries.len(), "route dump parsed");

    // Interfaces are resolved once the dump is drained so link lookups do
    // not interleave with the multipart response.
    let mut links: HashMap<u32, Link> = HashMap::new();
    let mut routes = Vec::with_capacity(entries.len());
    for entry in entries {
        let interface = match entry.oif {
            Some(index) => match links.get(&index) {
                Some(link) => Some(link.clone()),
                None => {
                    let link = link::get_by_index(sock, index)?;
                    links.insert(index, link.clone());
                    Some(link)
                }
            },
            None => None,
        };

        routes.push(Route {
            destination: entry.destination,
            interface,
            is_default: entry.is_default,
        });
    }

    Ok(routes)
}

/// Interface of the first default route with a resolved interface
pub fn find_default(routes: &[Route]) -> Result<&Link> {
    routes
        .iter()
        .filter(|r| r.is_default)
        .find_map(|r| r.interface.as_ref())
        .ok_or(Error::NoDefaultRoute)
}

/// Interface that carries the default route
pub fn default_route_interface(sock: &NetlinkSocket) -> Result<Link> {
    let routes = routes(sock)?;
    let link = find_default(&routes)?.clone();
    info!(interface = %link.name, index = link.index, "default route found");
    Ok(link)
}

/// MTU of the default route's interface
pub fn default_mtu(sock: &NetlinkSocket) -> Result<u32> {
    let link = default_route_interface(sock)?;
    Ok(link.mtu.unwrap_or(FALLBACK_MTU))
}
