//! The peer routing notification protocol, version 2.
//!
//! PRN frames travel over the same UDP sockets as tunnelled data and are
//! recognized by their leading zero byte, which no IP packet can carry. A
//! frame is a 4 byte header followed by any number of records:
//!
//! ```text
//! header:  magic=0x00  version=0x02  reserved(2B)
//! record:  cmd(1B)  prio(1B)  iafa_at(2B, BE)  address(4B or 16B)
//! ```
//!
//! Several records may be packed into one datagram; emission caps datagrams
//! at [`MAX_DATAGRAM_SIZE`] since IPv6 offers no network fragmentation.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::inner_addr::InnerAddr;

/// Magic byte opening every PRN frame.
const PRN_MAGIC: u8 = 0x00;
/// Protocol version spoken here.
const PRN_VERSION: u8 = 0x02;

/// Size of the frame header on the wire.
pub const HEADER_WIRE_SIZE: usize = 4;
/// Largest datagram emitted, header included.
pub const MAX_DATAGRAM_SIZE: usize = 1232;

/// Route addition (prio + 1 = hop count) or, with prio 0xff, deletion.
pub const CMD_ROUTEMOD: u8 = 0x00;
/// Connection management: peer open / close announcements.
pub const CMD_CONNMGMT: u8 = 0x01;
/// Route probing without the destructive effect of a deletion.
pub const CMD_PROBE: u8 = 0x03;

/// [`CMD_ROUTEMOD`] prio marking a route deletion.
pub const PRIO_ROUTE_DELETE: u8 = 0xff;
/// [`CMD_CONNMGMT`] prio announcing a peer opening up.
pub const PRIO_CONNMGMT_OPEN: u8 = 0x00;
/// [`CMD_CONNMGMT`] prio announcing a peer going away.
pub const PRIO_CONNMGMT_CLOSE: u8 = 0xff;
/// [`CMD_PROBE`] prio of a plain probe request.
pub const PRIO_PROBE_REQ: u8 = 0xff;
/// [`CMD_PROBE`] prio of a probe request whose sender expects a route.
pub const PRIO_PROBE_REQ_ECHO: u8 = 0xfe;
/// [`CMD_PROBE`] prio of a probe response: dead end reached.
pub const PRIO_PROBE_RESP: u8 = 0x00;

/// A single PRN record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub cmd: u8,
    pub prio: u8,
    pub route: InnerAddr,
}

impl Record {
    /// Size of this record on the wire.
    pub fn wire_size(&self) -> usize {
        2 + self.route.wire_len()
    }

    /// Append this record to `dst`.
    pub fn write_bytes(&self, dst: &mut BytesMut) {
        dst.put_u8(self.cmd);
        dst.put_u8(self.prio);
        dst.put_u16(self.route.afa_type());
        match self.route {
            InnerAddr::V4(ip) => dst.put_slice(&ip.octets()),
            InnerAddr::V6(ip) => dst.put_slice(&ip.octets()),
        }
    }

    /// Decode one record from the start of `src`, advancing past it.
    ///
    /// Returns `None` without consuming anything when the buffer holds no
    /// complete record, or when the address family tag is unknown (the
    /// record size is then unknowable, so iteration must stop).
    pub fn from_bytes(src: &mut BytesMut) -> Option<Record> {
        if src.remaining() < 4 {
            return None;
        }
        let tag = u16::from_be_bytes([src[2], src[3]]);
        let addr_len = InnerAddr::addr_len_for(tag)?;
        if src.remaining() < 4 + addr_len {
            return None;
        }

        let cmd = src.get_u8();
        let prio = src.get_u8();
        let tag = src.get_u16();
        let route = InnerAddr::from_wire(tag, &src[..addr_len])
            .expect("tag was validated against the known address families above");
        src.advance(addr_len);

        Some(Record { cmd, prio, route })
    }
}

/// Check whether `buf` opens with a well-formed PRN v2 frame holding at
/// least one byte of record data.
pub fn valid_frame(buf: &[u8]) -> bool {
    buf.len() > HEADER_WIRE_SIZE + 2 && buf[0] == PRN_MAGIC && buf[1] == PRN_VERSION
}

/// Decode all records of a frame body (the bytes after the header).
///
/// Iteration stops at the first truncated or unsizable record; everything
/// decoded up to that point is returned.
pub fn parse_records(payload: &[u8]) -> Vec<Record> {
    let mut src = BytesMut::from(payload);
    let mut records = Vec::new();
    while let Some(rec) = Record::from_bytes(&mut src) {
        records.push(rec);
    }
    if src.has_remaining() {
        trace!(trailing = src.remaining(), "PRN frame has trailing bytes");
    }
    records
}

/// Start a fresh datagram holding only the frame header.
pub fn new_datagram() -> BytesMut {
    let mut buf = BytesMut::with_capacity(MAX_DATAGRAM_SIZE);
    buf.put_u8(PRN_MAGIC);
    buf.put_u8(PRN_VERSION);
    buf.put_u16(0);
    buf
}

/// Append `rec` to the last datagram in `datagrams`, opening a new one when
/// the record does not fit under [`MAX_DATAGRAM_SIZE`] anymore.
pub fn append_record(datagrams: &mut Vec<BytesMut>, rec: &Record) {
    let needs_new = match datagrams.last() {
        None => true,
        Some(buf) => buf.len() + rec.wire_size() > MAX_DATAGRAM_SIZE,
    };
    if needs_new {
        datagrams.push(new_datagram());
    }
    rec.write_bytes(
        datagrams
            .last_mut()
            .expect("a datagram was pushed right above if the list was empty"),
    );
}
