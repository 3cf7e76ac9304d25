//! NETLINK_SOCK_DIAG queries for unix sockets.
//!
//! The kernel ignores the inode filter in a unix dump request and returns
//! every unix socket in the namespace, so the reply is scanned for the entry
//! whose own inode matches ours and its `UNIX_DIAG_PEER` attribute is read.
//!
//! All structures are native-endian, laid out as in `<linux/netlink.h>`,
//! `<linux/sock_diag.h>` and `<linux/unix_diag.h>`.

use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType, recv, send, socket,
};

use crate::error::IdentityError;

/// `struct nlmsghdr`
pub const NLMSG_HDR_LEN: usize = 16;
/// `struct unix_diag_req`
pub const UNIX_DIAG_REQ_LEN: usize = 24;
/// `struct unix_diag_msg`
pub const UNIX_DIAG_MSG_LEN: usize = 16;
/// `struct rtattr`
const RTA_HDR_LEN: usize = 4;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_DUMP: u16 = 0x100 | 0x200;

const AF_UNIX: u8 = 1;
const UDIAG_SHOW_NAME: u32 = 0x01;
const UDIAG_SHOW_PEER: u32 = 0x04;

pub const UNIX_DIAG_NAME: u16 = 0;
pub const UNIX_DIAG_PEER: u16 = 2;
pub const UNIX_DIAG_MAX: usize = 7;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

const RECV_BUFFER_SIZE: usize = 8192;

/// Receive failures tolerated before the dump is abandoned.
pub const MAX_RECV_FAILURES: u32 = 20;

/// Transport for diagnostic requests. Implemented over a real netlink socket
/// and by scripted channels in tests.
pub trait DiagChannel {
    fn send(&mut self, request: &[u8]) -> Result<(), Errno>;

    /// Receive one datagram. `Ok(0)` means the channel was closed.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Errno>;
}

/// Raw `AF_NETLINK`/`NETLINK_SOCK_DIAG` socket talking to the kernel.
#[derive(Debug)]
pub struct NetlinkChannel {
    fd: OwnedFd,
}

impl NetlinkChannel {
    pub fn open() -> Result<Self, Errno> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkSockDiag,
        )?;
        Ok(Self { fd })
    }
}

impl DiagChannel for NetlinkChannel {
    fn send(&mut self, request: &[u8]) -> Result<(), Errno> {
        send(self.fd.as_raw_fd(), request, MsgFlags::empty())?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Errno> {
        recv(self.fd.as_raw_fd(), buf, MsgFlags::empty())
    }
}

/// Fixed header of one netlink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NLMSG_HDR_LEN {
            return None;
        }
        Some(Self {
            len: read_u32(buf, 0),
            kind: read_u16(buf, 4),
            flags: read_u16(buf, 6),
            seq: read_u32(buf, 8),
            pid: read_u32(buf, 12),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.pid.to_ne_bytes());
    }
}

/// Build a unix-socket dump request asking for name and peer attributes of
/// sockets in every state.
pub fn build_request(seq: u32, inode: u32) -> Vec<u8> {
    let total = NLMSG_HDR_LEN + UNIX_DIAG_REQ_LEN;
    let mut out = Vec::with_capacity(total);
    NlMsgHeader {
        len: total as u32,
        kind: SOCK_DIAG_BY_FAMILY,
        flags: NLM_F_REQUEST | NLM_F_DUMP,
        seq,
        pid: 0,
    }
    .write(&mut out);

    out.push(AF_UNIX); // sdiag_family
    out.push(0); // sdiag_protocol
    out.extend_from_slice(&0u16.to_ne_bytes()); // pad
    out.extend_from_slice(&u32::MAX.to_ne_bytes()); // udiag_states
    out.extend_from_slice(&inode.to_ne_bytes()); // udiag_ino
    out.extend_from_slice(&(UDIAG_SHOW_NAME | UDIAG_SHOW_PEER).to_ne_bytes());
    out.extend_from_slice(&[0u8; 8]); // udiag_cookie
    out
}

/// Iterator over the netlink messages packed in one datagram.
///
/// Stops at the first truncated or malformed header, like `NLMSG_OK`.
pub struct Messages<'a> {
    buf: &'a [u8],
}

impl<'a> Messages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = (NlMsgHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let header = NlMsgHeader::parse(self.buf)?;
        let len = header.len as usize;
        if len < NLMSG_HDR_LEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let payload = &self.buf[NLMSG_HDR_LEN..len];
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((header, payload))
    }
}

/// Attributes of one diagnostic entry, indexed by type. When a type repeats,
/// the first occurrence wins.
#[derive(Debug, Default)]
pub struct AttributeTable<'a> {
    slots: [Option<&'a [u8]>; UNIX_DIAG_MAX + 1],
}

impl<'a> AttributeTable<'a> {
    pub fn parse(mut data: &'a [u8]) -> Self {
        let mut table = Self::default();
        while data.len() >= RTA_HDR_LEN {
            let len = read_u16(data, 0) as usize;
            if len < RTA_HDR_LEN || len > data.len() {
                break;
            }
            let kind = (read_u16(data, 2) & NLA_TYPE_MASK) as usize;
            if let Some(slot) = table.slots.get_mut(kind)
                && slot.is_none()
            {
                *slot = Some(&data[RTA_HDR_LEN..len]);
            }
            let advance = align4(len).min(data.len());
            data = &data[advance..];
        }
        table
    }

    pub fn get(&self, kind: u16) -> Option<&'a [u8]> {
        self.slots.get(kind as usize).copied().flatten()
    }

    pub fn get_u32(&self, kind: u16) -> Option<u32> {
        self.get(kind)
            .filter(|data| data.len() >= 4)
            .map(|data| read_u32(data, 0))
    }
}

/// One `unix_diag_msg` with the attributes we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagEntry {
    pub inode: u32,
    pub peer: Option<u32>,
}

impl DiagEntry {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < UNIX_DIAG_MSG_LEN {
            return None;
        }
        let inode = read_u32(payload, 4);
        let attrs = AttributeTable::parse(&payload[UNIX_DIAG_MSG_LEN..]);
        let peer = attrs.get_u32(UNIX_DIAG_PEER).filter(|&p| p != 0);
        Some(Self { inode, peer })
    }
}

enum Scan {
    Peer(u32),
    Done,
    More,
}

fn scan_datagram(
    buf: &[u8],
    seq: u32,
    inode: u32,
    matched: &mut bool,
) -> Result<Scan, IdentityError> {
    for (header, payload) in Messages::new(buf) {
        if header.seq != seq {
            continue;
        }
        match header.kind {
            NLMSG_DONE => return Ok(Scan::Done),
            NLMSG_ERROR => {
                let code = if payload.len() >= 4 {
                    read_u32(payload, 0) as i32
                } else {
                    0
                };
                return Err(IdentityError::Kernel(code));
            }
            _ => {}
        }
        let Some(entry) = DiagEntry::parse(payload) else {
            continue;
        };
        if entry.inode != inode {
            continue;
        }
        *matched = true;
        if let Some(peer) = entry.peer {
            return Ok(Scan::Peer(peer));
        }
    }
    Ok(Scan::More)
}

/// Ask the kernel which socket is connected to the unix socket `inode`.
pub fn query_peer_inode<C: DiagChannel + ?Sized>(
    channel: &mut C,
    inode: u32,
    seq: u32,
) -> Result<u32, IdentityError> {
    channel
        .send(&build_request(seq, inode))
        .map_err(IdentityError::Channel)?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut failures = 0u32;
    let mut matched = false;

    loop {
        let n = match channel.recv(&mut buf) {
            Ok(0) => return Err(IdentityError::Closed),
            Ok(n) => n,
            Err(errno) => {
                if errno != Errno::EINTR {
                    warn!("sock_diag receive failed: {errno}");
                }
                failures += 1;
                if failures > MAX_RECV_FAILURES {
                    return Err(IdentityError::RetriesExhausted(failures));
                }
                continue;
            }
        };

        match scan_datagram(&buf[..n], seq, inode, &mut matched)? {
            Scan::Peer(peer) => {
                debug!("Socket peer found (s={inode}) (p={peer})");
                return Ok(peer);
            }
            Scan::Done if matched => return Err(IdentityError::NoPeer(inode)),
            Scan::Done => return Err(IdentityError::NoEntry(inode)),
            Scan::More => failures = 0,
        }
    }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Builders for synthetic kernel replies.
#[doc(hidden)]
pub mod dump {
    use super::*;

    /// Encode one `unix_diag_msg` carrying an optional peer attribute.
    pub fn entry(seq: u32, inode: u32, peer: Option<u32>) -> Vec<u8> {
        entry_with_attrs(seq, inode, peer.map(|p| (UNIX_DIAG_PEER, p)).as_slice())
    }

    /// Encode one `unix_diag_msg` with arbitrary u32 attributes.
    pub fn entry_with_attrs(seq: u32, inode: u32, attrs: &[(u16, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(AF_UNIX); // udiag_family
        body.push(1); // udiag_type = SOCK_STREAM
        body.push(1); // udiag_state = TCP_ESTABLISHED
        body.push(0); // pad
        body.extend_from_slice(&inode.to_ne_bytes());
        body.extend_from_slice(&[0u8; 8]); // cookie
        for &(kind, value) in attrs {
            body.extend_from_slice(&8u16.to_ne_bytes());
            body.extend_from_slice(&kind.to_ne_bytes());
            body.extend_from_slice(&value.to_ne_bytes());
        }
        message(SOCK_DIAG_BY_FAMILY, seq, &body)
    }

    pub fn done(seq: u32) -> Vec<u8> {
        message(NLMSG_DONE, seq, &0i32.to_ne_bytes())
    }

    pub fn error(seq: u32, errno: i32) -> Vec<u8> {
        message(NLMSG_ERROR, seq, &(-errno).to_ne_bytes())
    }

    pub fn message(kind: u16, seq: u32, body: &[u8]) -> Vec<u8> {
        let len = NLMSG_HDR_LEN + body.len();
        let mut out = Vec::with_capacity(align4(len));
        NlMsgHeader {
            len: len as u32,
            kind,
            flags: 0x2, // NLM_F_MULTI
            seq,
            pid: 0,
        }
        .write(&mut out);
        out.extend_from_slice(body);
        out.resize(align4(len), 0);
        out
    }
}
