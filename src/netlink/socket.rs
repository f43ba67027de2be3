//! Raw `NETLINK_ROUTE` socket
//!
//! A unicast request/response channel to the kernel: the socket is bound to a
//! kernel-assigned port id with no multicast groups. Every read is bounded by
//! an optional receive deadline (`SO_RCVTIMEO`).

use crate::error::{Error, Result};
use crate::netlink::codec::{
    MessageFlags, NLMSG_DONE, NLMSG_ERROR, NetlinkMessage, NetlinkRequest, WireOrder,
    parse_messages,
};
use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType, sockopt,
};
use nix::sys::time::{TimeVal, TimeValLike};
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;
use tracing::debug;

/// Outcome of validating one response message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// More messages belong to this response
    Continue,
    /// End of a multipart dump, or a zero-status acknowledgement
    Done,
}

/// Validate a response message against the request that solicited it
///
/// Sequence and port id are checked before the message type, so a foreign
/// message is rejected even when it is an error or done marker.
pub fn check_message(msg: &NetlinkMessage, seq: u32, pid: u32) -> Result<MessageStatus> {
    if msg.header.seq != seq {
        return Err(Error::SequenceMismatch {
            expected: seq,
            actual: msg.header.seq,
        });
    }

    if msg.header.pid != pid {
        return Err(Error::PidMismatch {
            expected: pid,
            actual: msg.header.pid,
        });
    }

    match msg.header.kind {
        NLMSG_DONE => Ok(MessageStatus::Done),
        NLMSG_ERROR => match msg.error_code::<WireOrder>()? {
            0 => Ok(MessageStatus::Done),
            code => Err(Error::kernel(-code)),
        },
        _ => Ok(MessageStatus::Continue),
    }
}

/// A bound rtnetlink socket
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    pid: u32,
    timeout: Option<Duration>,
}

impl NetlinkSocket {
    /// Open and bind a socket with no receive deadline
    pub fn open() -> Result<Self> {
        Self::open_with_timeout(None)
    }

    /// Open and bind a socket whose reads fail after `timeout`
    pub fn open_with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| socket_error("open", e))?;

        socket::bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))
            .map_err(|e| socket_error("bind", e))?;

        let local: NetlinkAddr =
            socket::getsockname(fd.as_raw_fd()).map_err(|e| socket_error("getsockname", e))?;

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            let tv = TimeVal::milliseconds(timeout.as_millis() as i64);
            socket::setsockopt(&fd, sockopt::ReceiveTimeout, &tv)
                .map_err(|e| socket_error("setsockopt", e))?;
        }

        debug!(pid = local.pid(), ?timeout, "netlink socket bound");

        Ok(Self {
            fd,
            pid: local.pid(),
            timeout,
        })
    }

    /// Kernel-assigned port id of this socket
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Encode and send a request
    pub fn send(&self, request: &NetlinkRequest) -> Result<()> {
        request.check_len()?;
        let buf = request.encode();
        debug!(
            kind = request.kind,
            flags = ?request.flags,
            seq = request.seq,
            len = buf.len(),
            "netlink send"
        );

        let sent = socket::send(self.fd.as_raw_fd(), &buf, MsgFlags::empty())
            .map_err(|e| socket_error("send", e))?;

        if sent != buf.len() {
            return Err(Error::Socket {
                op: "send",
                source: std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    format!("short write: {} of {} bytes", sent, buf.len()),
                ),
            });
        }

        Ok(())
    }

    /// Read up to one page and split it into messages
    pub fn receive(&self) -> Result<Vec<NetlinkMessage>> {
        let mut buf = vec![0u8; page_size()];

        let read = match socket::recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
            Ok(n) => n,
            Err(Errno::EAGAIN) => {
                return Err(Error::Timeout {
                    what: "netlink response".to_string(),
                    millis: self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                });
            }
            Err(e) => return Err(socket_error("receive", e)),
        };

        let messages = parse_messages(&buf[..read])?;
        for msg in &messages {
            debug!(
                kind = msg.header.kind,
                flags = ?msg.header.flags,
                seq = msg.header.seq,
                len = msg.header.len,
                "netlink receive"
            );
        }

        Ok(messages)
    }

    /// Validate a response message against this socket's port id
    pub fn check_message(&self, msg: &NetlinkMessage, seq: u32) -> Result<MessageStatus> {
        check_message(msg, seq, self.pid)
    }

    /// Wait for the kernel to acknowledge request `seq`
    pub fn handle_ack(&self, seq: u32) -> Result<()> {
        loop {
            for msg in self.receive()? {
                if self.check_message(&msg, seq)? == MessageStatus::Done {
                    return Ok(());
                }
            }
        }
    }

    /// Send a request that asks for an acknowledgement and wait for it
    pub fn execute(&self, mut request: NetlinkRequest) -> Result<()> {
        request.flags |= MessageFlags::ACK;
        self.send(&request)?;
        self.handle_ack(request.seq)
    }

    /// Send a request and collect every data message of its response
    ///
    /// Stops at the end-of-dump marker, or after the first batch when the
    /// kernel answers with a single (non-multipart) message.
    pub fn query(&self, request: &NetlinkRequest) -> Result<Vec<NetlinkMessage>> {
        self.send(request)?;

        let mut collected = Vec::new();
        loop {
            let mut multipart = false;
            for msg in self.receive()? {
                if self.check_message(&msg, request.seq)? == MessageStatus::Done {
                    return Ok(collected);
                }
                multipart |= msg.header.flags.contains(MessageFlags::MULTI);
                collected.push(msg);
            }

            if !multipart && !collected.is_empty() {
                return Ok(collected);
            }
        }
    }
}

fn socket_error(op: &'static str, errno: Errno) -> Error {
    Error::Socket {
        op,
        source: errno.into(),
    }
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}
