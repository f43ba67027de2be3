//! Netlink attributes (`struct rtattr`)
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Length (2 bytes) │  Type (2 bytes)     │  <- attribute header
//! ├─────────────────────────────────────────┤
//! │  nested children (each padded to 4)     │
//! │  value bytes                            │
//! │  padding to 4                           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The length field holds the unpadded length. Attributes own their children,
//! so a tree is encoded bottom-up: every child is encoded and padded before
//! its parent header is written.

use crate::error::{Error, Result};
use crate::netlink::codec::{WireOrder, align};
use byteorder::ByteOrder;
use std::net::Ipv4Addr;

/// Size of the attribute header
pub const ATTR_HEADER_LEN: usize = 4;

/// Largest logical length the 16-bit length field can carry
pub const MAX_ATTR_LEN: usize = u16::MAX as usize;

/// Type bits with the NLA_F_NESTED / NLA_F_NET_BYTEORDER flags masked off
const ATTR_TYPE_MASK: u16 = 0x3fff;

/// A typed, possibly nested attribute
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u16,
    pub data: Vec<u8>,
    pub children: Vec<Attribute>,
}

impl Attribute {
    /// Attribute carrying raw bytes
    pub fn new(kind: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
            children: Vec::new(),
        }
    }

    /// Attribute that will only hold children
    pub fn container(kind: u16) -> Self {
        Self::new(kind, Vec::new())
    }

    /// NUL-terminated string attribute
    pub fn string(kind: u16, value: &str) -> Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        Self::new(kind, data)
    }

    /// Host-order u32 attribute
    pub fn u32(kind: u16, value: u32) -> Self {
        let mut data = vec![0u8; 4];
        WireOrder::write_u32(&mut data, value);
        Self::new(kind, data)
    }

    /// IPv4 address attribute (network byte order)
    pub fn ipv4(kind: u16, addr: Ipv4Addr) -> Self {
        Self::new(kind, addr.octets().to_vec())
    }

    /// Append a child and return it for further nesting
    pub fn add_child(&mut self, child: Attribute) -> &mut Attribute {
        self.children.push(child);
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Builder form of [`add_child`](Self::add_child)
    pub fn with_child(mut self, child: Attribute) -> Self {
        self.children.push(child);
        self
    }

    /// Logical (unpadded) length, as written into the length field
    pub fn len(&self) -> usize {
        let children: usize = self.children.iter().map(|c| align(c.len())).sum();
        ATTR_HEADER_LEN + children + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.children.is_empty()
    }

    /// Reject a tree whose length would not fit the 16-bit length field
    pub fn check_len(&self) -> Result<()> {
        for child in &self.children {
            child.check_len()?;
        }
        let len = self.len();
        if len > MAX_ATTR_LEN {
            return Err(Error::MalformedMessage(format!(
                "attribute {} is {} bytes, limit is {}",
                self.kind, len, MAX_ATTR_LEN
            )));
        }
        Ok(())
    }

    /// Encode into a buffer padded to the alignment boundary
    pub fn encode<B: ByteOrder>(&self) -> Vec<u8> {
        let mut buf = vec![0u8; align(self.len())];
        self.write::<B>(&mut buf);
        buf
    }

    /// Write into `buf`, which must hold at least `align(self.len())` bytes
    pub(crate) fn write<B: ByteOrder>(&self, buf: &mut [u8]) {
        debug_assert!(self.len() <= MAX_ATTR_LEN, "attribute {} overflows u16", self.kind);
        B::write_u16(&mut buf[0..2], self.len() as u16);
        B::write_u16(&mut buf[2..4], self.kind);

        let mut next = ATTR_HEADER_LEN;
        for child in &self.children {
            let encoded = child.encode::<B>();
            buf[next..next + encoded.len()].copy_from_slice(&encoded);
            next += encoded.len();
        }

        buf[next..next + self.data.len()].copy_from_slice(&self.data);
    }

    /// Decode a flat run of attributes in host byte order
    ///
    /// Nested payloads are left in `data`; call [`nested`](Self::nested) to
    /// descend into them.
    pub fn decode_all(buf: &[u8]) -> Result<Vec<Attribute>> {
        Self::decode_all_with::<WireOrder>(buf)
    }

    /// [`decode_all`](Self::decode_all) with an explicit byte order
    pub fn decode_all_with<B: ByteOrder>(buf: &[u8]) -> Result<Vec<Attribute>> {
        let mut attrs = Vec::new();
        let mut rest = buf;

        while rest.len() >= ATTR_HEADER_LEN {
            let len = B::read_u16(&rest[0..2]) as usize;
            let kind = B::read_u16(&rest[2..4]) & ATTR_TYPE_MASK;

            if len < ATTR_HEADER_LEN || len > rest.len() {
                return Err(Error::MalformedMessage(format!(
                    "attribute {} has length {} ({} bytes left)",
                    kind,
                    len,
                    rest.len()
                )));
            }

            attrs.push(Attribute::new(kind, &rest[ATTR_HEADER_LEN..len]));
            rest = &rest[align(len).min(rest.len())..];
        }

        Ok(attrs)
    }

    /// Decode this attribute's payload as child attributes
    pub fn nested(&self) -> Result<Vec<Attribute>> {
        Self::decode_all(&self.data)
    }

    /// [`nested`](Self::nested) with an explicit byte order
    pub fn nested_with<B: ByteOrder>(&self) -> Result<Vec<Attribute>> {
        Self::decode_all_with::<B>(&self.data)
    }

    /// Payload as a host-order u32
    pub fn as_u32(&self) -> Option<u32> {
        (self.data.len() == 4).then(|| WireOrder::read_u32(&self.data))
    }

    /// Payload as an IPv4 address
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        <[u8; 4]>::try_from(self.data.as_slice())
            .ok()
            .map(Ipv4Addr::from)
    }

    /// Payload as a string, trailing NULs stripped
    pub fn as_str(&self) -> Option<&str> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end]).ok()
    }
}

/// Find the first attribute of the given type
pub fn find(attrs: &[Attribute], kind: u16) -> Option<&Attribute> {
    attrs.iter().find(|a| a.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;

    #[test]
    fn test_leaf_length_and_padding() {
        for data_len in 0..=9 {
            let attr = Attribute::new(1, vec![0xab; data_len]);
            let buf = attr.encode::<WireOrder>();

            assert_eq!(attr.len(), ATTR_HEADER_LEN + data_len);
            assert_eq!(buf.len() % 4, 0);
            assert!(buf.len() >= ATTR_HEADER_LEN + data_len);
            assert_eq!(WireOrder::read_u16(&buf[0..2]) as usize, attr.len());
            assert!(buf[ATTR_HEADER_LEN + data_len..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_nested_length_counts_aligned_children() {
        let attr = Attribute::container(18)
            .with_child(Attribute::string(1, "bridge"))
            .with_child(Attribute::new(2, vec![1]));

        // "bridge\0" = 7 -> 11 -> 12 aligned; [1] = 5 -> 8 aligned
        assert_eq!(attr.len(), ATTR_HEADER_LEN + 12 + 8);
        assert_eq!(attr.encode::<WireOrder>().len(), 24);
    }

    #[test]
    fn test_string_attribute_is_nul_terminated() {
        let attr = Attribute::string(3, "br0");
        assert_eq!(attr.data, b"br0\0");
        assert_eq!(attr.as_str(), Some("br0"));
    }

    #[test]
    fn test_tree_round_trip() {
        let mut root = Attribute::container(18);
        root.add_child(Attribute::string(1, "bridge"));
        let info = root.add_child(Attribute::container(2));
        info.add_child(Attribute::new(7, vec![1, 2, 3]));
        info.add_child(Attribute::u32(8, 0xdead_beef));
        let leaf = Attribute::new(3, b"eth0".to_vec());

        let mut buf = root.encode::<WireOrder>();
        buf.extend(leaf.encode::<WireOrder>());

        let top = Attribute::decode_all(&buf).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].kind, 18);
        assert_eq!(top[1], leaf);

        let children = top[0].nested().unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].as_str(), Some("bridge"));
        assert_eq!(children[1].kind, 2);

        let grandchildren = children[1].nested().unwrap();
        assert_eq!(grandchildren[0], Attribute::new(7, vec![1, 2, 3]));
        assert_eq!(grandchildren[1].as_u32(), Some(0xdead_beef));
    }

    #[test]
    fn test_round_trip_big_endian() {
        let attr = Attribute::container(5).with_child(Attribute::new(6, vec![9; 5]));
        let buf = attr.encode::<BigEndian>();
        assert_eq!(&buf[0..2], &[0, 16]);

        let decoded = Attribute::decode_all_with::<BigEndian>(&buf).unwrap();
        let children = decoded[0].nested_with::<BigEndian>().unwrap();
        assert_eq!(children[0], Attribute::new(6, vec![9; 5]));
    }

    #[test]
    fn test_decode_masks_nested_flag() {
        let mut buf = Attribute::new(2, vec![0; 4]).encode::<WireOrder>();
        WireOrder::write_u16(&mut buf[2..4], 0x8000 | 2);
        assert_eq!(Attribute::decode_all(&buf).unwrap()[0].kind, 2);
    }

    #[test]
    fn test_decode_rejects_truncated_attribute() {
        let mut buf = Attribute::new(1, vec![0; 8]).encode::<WireOrder>();
        WireOrder::write_u16(&mut buf[0..2], 40);
        assert!(Attribute::decode_all(&buf).is_err());
    }

    #[test]
    fn test_check_len_rejects_oversize_tree() {
        let fits = Attribute::new(1, vec![0; MAX_ATTR_LEN - ATTR_HEADER_LEN]);
        assert!(fits.check_len().is_ok());

        let big = Attribute::new(1, vec![0; MAX_ATTR_LEN]);
        assert!(matches!(big.check_len(), Err(Error::MalformedMessage(_))));

        let parent = Attribute::container(2)
            .with_child(Attribute::new(3, vec![0; 40_000]))
            .with_child(Attribute::new(4, vec![0; 40_000]));
        assert!(parent.check_len().is_err());
    }

    #[test]
    fn test_ipv4_attribute() {
        let attr = Attribute::ipv4(1, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(attr.data, vec![192, 168, 0, 1]);
        assert_eq!(attr.as_ipv4(), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(find(&[attr.clone()], 1), Some(&attr));
    }
}
