//! rtnetlink client
//!
//! Provides:
//! - Wire codec for netlink messages and nested attributes
//! - A bound `NETLINK_ROUTE` socket with ack and dump handling
//! - Link, address and bridge operations
//! - IPv4 route table queries

pub mod attr;
pub mod codec;
pub mod link;
pub mod route;
pub mod socket;

pub use attr::Attribute;
pub use codec::{MessageFlags, NetlinkMessage, NetlinkRequest};
pub use link::Link;
pub use route::Route;
pub use socket::NetlinkSocket;
