//! Netlink message encoding and decoding
//!
//! Wire layout of every message:
//!
//! ```text
//! ┌──────────────┬───────────┬───────────┬─────────────┬─────────────┐
//! │ len (u32)    │ type (u16)│ flags(u16)│ seq (u32)   │ pid (u32)   │  16-byte header
//! ├──────────────┴───────────┴───────────┴─────────────┴─────────────┤
//! │ payload items, each padded to a 4-byte boundary                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are written in host byte order. The order is a type parameter
//! (`byteorder::ByteOrder`) threaded through every encode/decode call, and
//! [`WireOrder`] fixes it to the host's native order for kernel traffic.

use crate::error::{Error, Result};
use crate::netlink::attr::Attribute;
use bitflags::bitflags;
use byteorder::{ByteOrder, NativeEndian};
use std::sync::atomic::{AtomicU32, Ordering};

/// Byte order used on the kernel wire
pub type WireOrder = NativeEndian;

/// Size of `struct nlmsghdr`
pub const HEADER_LEN: usize = 16;

/// Netlink alignment boundary
pub const ALIGN_TO: usize = 4;

// Control message types
pub const NLMSG_NOOP: u16 = libc::NLMSG_NOOP as u16;
pub const NLMSG_ERROR: u16 = libc::NLMSG_ERROR as u16;
pub const NLMSG_DONE: u16 = libc::NLMSG_DONE as u16;

// rtnetlink message types
pub const RTM_NEWLINK: u16 = libc::RTM_NEWLINK as u16;
pub const RTM_DELLINK: u16 = libc::RTM_DELLINK as u16;
pub const RTM_GETLINK: u16 = libc::RTM_GETLINK as u16;
pub const RTM_NEWADDR: u16 = libc::RTM_NEWADDR as u16;
pub const RTM_NEWROUTE: u16 = libc::RTM_NEWROUTE as u16;
pub const RTM_GETROUTE: u16 = libc::RTM_GETROUTE as u16;

/// Round `len` up to the netlink alignment boundary
pub const fn align(len: usize) -> usize {
    (len + ALIGN_TO - 1) & !(ALIGN_TO - 1)
}

bitflags! {
    /// `nlmsg_flags` bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u16 {
        const REQUEST = 0x0001;
        const MULTI = 0x0002;
        const ACK = 0x0004;
        const ECHO = 0x0008;
        const DUMP_INTR = 0x0010;

        // GET requests
        const DUMP = 0x0300;

        // NEW requests
        const REPLACE = 0x0100;
        const EXCL = 0x0200;
        const CREATE = 0x0400;
        const APPEND = 0x0800;
    }
}

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Next process-wide request sequence number
///
/// Wraps to 0 after `u32::MAX`.
pub fn next_sequence() -> u32 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// `struct nlmsghdr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: MessageFlags,
    pub seq: u32,
    pub pid: u32,
}

impl NetlinkHeader {
    fn write<B: ByteOrder>(&self, buf: &mut [u8]) {
        B::write_u32(&mut buf[0..4], self.len);
        B::write_u16(&mut buf[4..6], self.kind);
        B::write_u16(&mut buf[6..8], self.flags.bits());
        B::write_u32(&mut buf[8..12], self.seq);
        B::write_u32(&mut buf[12..16], self.pid);
    }

    /// Decode a header from the start of `buf`
    pub fn decode<B: ByteOrder>(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ShortResponse { len: buf.len() });
        }

        Ok(Self {
            len: B::read_u32(&buf[0..4]),
            kind: B::read_u16(&buf[4..6]),
            flags: MessageFlags::from_bits_retain(B::read_u16(&buf[6..8])),
            seq: B::read_u32(&buf[8..12]),
            pid: B::read_u32(&buf[12..16]),
        })
    }
}

/// `struct ifinfomsg`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub family: u8,
    pub link_type: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl InterfaceInfo {
    pub const LEN: usize = 16;

    /// Request header for the link with the given index (0 = look up by name)
    pub fn for_index(index: u32) -> Self {
        Self {
            family: libc::AF_UNSPEC as u8,
            index: index as i32,
            ..Default::default()
        }
    }

    fn write<B: ByteOrder>(&self, buf: &mut [u8]) {
        buf[0] = self.family;
        B::write_u16(&mut buf[2..4], self.link_type);
        B::write_i32(&mut buf[4..8], self.index);
        B::write_u32(&mut buf[8..12], self.flags);
        B::write_u32(&mut buf[12..16], self.change);
    }

    /// Decode from a message payload
    pub fn decode<B: ByteOrder>(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::MalformedMessage(format!(
                "ifinfomsg needs {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }

        Ok(Self {
            family: buf[0],
            link_type: B::read_u16(&buf[2..4]),
            index: B::read_i32(&buf[4..8]),
            flags: B::read_u32(&buf[8..12]),
            change: B::read_u32(&buf[12..16]),
        })
    }
}

/// `struct ifaddrmsg`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressInfo {
    pub family: u8,
    pub prefix_len: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: u32,
}

impl AddressInfo {
    pub const LEN: usize = 8;

    fn write<B: ByteOrder>(&self, buf: &mut [u8]) {
        buf[0] = self.family;
        buf[1] = self.prefix_len;
        buf[2] = self.flags;
        buf[3] = self.scope;
        B::write_u32(&mut buf[4..8], self.index);
    }
}

/// `struct rtmsg`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub route_type: u8,
    pub flags: u32,
}

impl RouteInfo {
    pub const LEN: usize = 12;

    fn write<B: ByteOrder>(&self, buf: &mut [u8]) {
        buf[0] = self.family;
        buf[1] = self.dst_len;
        buf[2] = self.src_len;
        buf[3] = self.tos;
        buf[4] = self.table;
        buf[5] = self.protocol;
        buf[6] = self.scope;
        buf[7] = self.route_type;
        B::write_u32(&mut buf[8..12], self.flags);
    }

    /// Decode from a message payload
    pub fn decode<B: ByteOrder>(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::MalformedMessage(format!(
                "rtmsg needs {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }

        Ok(Self {
            family: buf[0],
            dst_len: buf[1],
            src_len: buf[2],
            tos: buf[3],
            table: buf[4],
            protocol: buf[5],
            scope: buf[6],
            route_type: buf[7],
            flags: B::read_u32(&buf[8..12]),
        })
    }
}

/// One payload item of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestData {
    InterfaceInfo(InterfaceInfo),
    AddressInfo(AddressInfo),
    RouteInfo(RouteInfo),
    Attribute(Attribute),
}

impl RequestData {
    /// Encoded length, padding included
    pub fn len(&self) -> usize {
        match self {
            RequestData::InterfaceInfo(_) => align(InterfaceInfo::LEN),
            RequestData::AddressInfo(_) => align(AddressInfo::LEN),
            RequestData::RouteInfo(_) => align(RouteInfo::LEN),
            RequestData::Attribute(attr) => align(attr.len()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode into a freshly allocated, aligned buffer
    pub fn encode<B: ByteOrder>(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.len()];
        match self {
            RequestData::InterfaceInfo(info) => info.write::<B>(&mut buf),
            RequestData::AddressInfo(info) => info.write::<B>(&mut buf),
            RequestData::RouteInfo(info) => info.write::<B>(&mut buf),
            RequestData::Attribute(attr) => attr.write::<B>(&mut buf),
        }
        buf
    }
}

impl From<InterfaceInfo> for RequestData {
    fn from(info: InterfaceInfo) -> Self {
        RequestData::InterfaceInfo(info)
    }
}

impl From<AddressInfo> for RequestData {
    fn from(info: AddressInfo) -> Self {
        RequestData::AddressInfo(info)
    }
}

impl From<RouteInfo> for RequestData {
    fn from(info: RouteInfo) -> Self {
        RequestData::RouteInfo(info)
    }
}

impl From<Attribute> for RequestData {
    fn from(attr: Attribute) -> Self {
        RequestData::Attribute(attr)
    }
}

/// An outbound netlink request
#[derive(Debug, Clone)]
pub struct NetlinkRequest {
    pub kind: u16,
    pub flags: MessageFlags,
    pub seq: u32,
    pub pid: u32,
    data: Vec<RequestData>,
}

impl NetlinkRequest {
    /// Create a request with a fresh sequence number
    ///
    /// `MessageFlags::REQUEST` is always set.
    pub fn new(kind: u16, flags: MessageFlags) -> Self {
        Self {
            kind,
            flags: flags | MessageFlags::REQUEST,
            seq: next_sequence(),
            pid: 0,
            data: Vec::new(),
        }
    }

    /// Append a payload item
    pub fn add_data(&mut self, data: impl Into<RequestData>) {
        self.data.push(data.into());
    }

    /// Builder form of [`add_data`](Self::add_data)
    pub fn with_data(mut self, data: impl Into<RequestData>) -> Self {
        self.add_data(data);
        self
    }

    pub fn data(&self) -> &[RequestData] {
        &self.data
    }

    /// Total message length: header plus every payload item
    pub fn len(&self) -> usize {
        HEADER_LEN + self.data.iter().map(RequestData::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check every attribute fits its length field
    pub fn check_len(&self) -> Result<()> {
        for item in &self.data {
            if let RequestData::Attribute(attr) = item {
                attr.check_len()?;
            }
        }
        Ok(())
    }

    /// Encode in host byte order
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with::<WireOrder>()
    }

    /// Encode with an explicit byte order
    pub fn encode_with<B: ByteOrder>(&self) -> Vec<u8> {
        let len = self.len();
        let mut buf = vec![0u8; len];

        NetlinkHeader {
            len: len as u32,
            kind: self.kind,
            flags: self.flags,
            seq: self.seq,
            pid: self.pid,
        }
        .write::<B>(&mut buf[..HEADER_LEN]);

        let mut next = HEADER_LEN;
        for item in &self.data {
            let encoded = item.encode::<B>();
            buf[next..next + encoded.len()].copy_from_slice(&encoded);
            next += item.len();
        }

        buf
    }
}

/// One inbound netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkMessage {
    pub header: NetlinkHeader,
    /// Payload following the header (padding excluded)
    pub data: Vec<u8>,
}

impl NetlinkMessage {
    /// Attributes following a fixed-size family header of `offset` bytes
    pub fn attributes(&self, offset: usize) -> Result<Vec<Attribute>> {
        let start = align(offset);
        if self.data.len() < start {
            return Err(Error::MalformedMessage(format!(
                "payload of {} bytes is shorter than its {}-byte family header",
                self.data.len(),
                offset
            )));
        }
        Attribute::decode_all(&self.data[start..])
    }

    /// Status code of an `NLMSG_ERROR` message (0 = acknowledgement)
    pub fn error_code<B: ByteOrder>(&self) -> Result<i32> {
        if self.data.len() < 4 {
            return Err(Error::MalformedMessage(format!(
                "error message payload is {} bytes, need 4",
                self.data.len()
            )));
        }
        Ok(B::read_i32(&self.data[0..4]))
    }
}

/// Split a receive buffer into messages by each header's length field
pub fn parse_messages(buf: &[u8]) -> Result<Vec<NetlinkMessage>> {
    parse_messages_with::<WireOrder>(buf)
}

/// [`parse_messages`] with an explicit byte order
pub fn parse_messages_with<B: ByteOrder>(buf: &[u8]) -> Result<Vec<NetlinkMessage>> {
    if buf.len() < HEADER_LEN {
        return Err(Error::ShortResponse { len: buf.len() });
    }

    let mut messages = Vec::new();
    let mut rest = buf;

    while rest.len() >= HEADER_LEN {
        let header = NetlinkHeader::decode::<B>(rest)?;
        let len = header.len as usize;

        if len < HEADER_LEN || len > rest.len() {
            return Err(Error::MalformedMessage(format!(
                "message length {} out of bounds ({} bytes left)",
                len,
                rest.len()
            )));
        }

        messages.push(NetlinkMessage {
            header,
            data: rest[HEADER_LEN..len].to_vec(),
        });

        rest = &rest[align(len).min(rest.len())..];
    }

    Ok(messages)
}
