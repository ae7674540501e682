//! Netlink and generic netlink message framing.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ len u32 │ type u16 │ flags u16 │ seq u32 │ pid u32 │  <- netlink header
//! ├───────────────────────────────────────────────┤
//! │ cmd u8 │ version u8 │ reserved u16 │              <- generic header
//! ├───────────────────────────────────────────────┤
//! │ family specific body (fixed header + attributes)│
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Messages with a type below [`NLMSG_MIN_TYPE`] are control messages (errors,
//! acknowledgements and dump terminators) and carry no generic header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::attr::align;

/// Length of the netlink message header.
pub const HEADER_LEN: usize = 16;
/// Length of the generic netlink header.
pub const GENL_HEADER_LEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;
/// Message types at or above this value address a protocol family.
pub const NLMSG_MIN_TYPE: u16 = 0x10;

/// Netlink header flag bits.
pub mod flags {
    /// The message is a request.
    pub const REQUEST: u16 = 0x1;
    /// The message is part of a multi-part reply.
    pub const MULTI: u16 = 0x2;
    /// Request an acknowledgement on success.
    pub const ACK: u16 = 0x4;
    /// Echo the request back, used to receive the created or deleted object.
    pub const ECHO: u16 = 0x8;
    /// The dump was inconsistent because the kernel state changed under it.
    pub const DUMP_INTR: u16 = 0x10;

    // GET modifiers
    pub const ROOT: u16 = 0x100;
    pub const MATCH: u16 = 0x200;
    pub const DUMP: u16 = ROOT | MATCH;

    // NEW modifiers
    pub const REPLACE: u16 = 0x100;
    pub const EXCL: u16 = 0x200;
    pub const CREATE: u16 = 0x400;
    pub const APPEND: u16 = 0x800;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid message length: {0}")]
    Length(usize),
    #[error("Message of type {kind} too short: {len} bytes")]
    Truncated { kind: u16, len: usize },
    #[error("Receive buffer overrun")]
    Overrun,
}

/// The netlink message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Total message length, header included. Set by the encoder.
    pub len: u32,
    /// Message type: a control type or a family id.
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    /// Port id of the sender, 0 for the kernel.
    pub pid: u32,
}

impl Header {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_ne(self.len);
        dst.put_u16_ne(self.kind);
        dst.put_u16_ne(self.flags);
        dst.put_u32_ne(self.seq);
        dst.put_u32_ne(self.pid);
    }

    fn decode(src: &mut Bytes) -> Self {
        Self {
            len: src.get_u32_ne(),
            kind: src.get_u16_ne(),
            flags: src.get_u16_ne(),
            seq: src.get_u32_ne(),
            pid: src.get_u32_ne(),
        }
    }
}

/// The generic netlink header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenlHeader {
    pub cmd: u8,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// A generic netlink message for a family.
    Genl { header: GenlHeader, body: Bytes },
    /// An error report. A `code` of 0 acknowledges the request, a negative
    /// code is a negated errno.
    Error { code: i32, request: Option<Header> },
    /// Terminates a multi-part reply.
    Done,
    Noop,
}

#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    payload: Payload,
}

impl Message {
    /// Creates a generic netlink message for the given family. The sequence
    /// number is assigned when the message is sent.
    pub fn genl(family: u16, flags: u16, header: GenlHeader, body: Bytes) -> Self {
        Self {
            header: Header { len: 0, kind: family, flags, seq: 0, pid: 0 },
            payload: Payload::Genl { header, body },
        }
    }

    /// Creates an acknowledgement (`code == 0`) or an error report for `request`.
    pub fn error(request: Header, code: i32) -> Self {
        Self {
            header: Header { len: 0, kind: NLMSG_ERROR, flags: 0, seq: request.seq, pid: 0 },
            payload: Payload::Error { code, request: Some(request) },
        }
    }

    /// Creates the terminator of a dump.
    pub fn done(seq: u32, flags: u16) -> Self {
        Self {
            header: Header { len: 0, kind: NLMSG_DONE, flags: flags | flags::MULTI, seq, pid: 0 },
            payload: Payload::Done,
        }
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn kind(&self) -> u16 {
        self.header.kind
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    #[inline]
    pub fn set_seq(&mut self, seq: u32) {
        self.header.seq = seq;
    }

    #[inline]
    pub fn set_flags(&mut self, flags: u16) {
        self.header.flags = flags;
    }

    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Returns the generic header and body, if this is a family message.
    pub fn genl_body(&self) -> Option<(GenlHeader, &Bytes)> {
        match &self.payload {
            Payload::Genl { header, body } => Some((*header, body)),
            _ => None,
        }
    }

    /// Length of the message on the wire, without trailing padding.
    pub fn size(&self) -> usize {
        HEADER_LEN
            + match &self.payload {
                Payload::Genl { body, .. } => GENL_HEADER_LEN + body.len(),
                Payload::Error { request: Some(_), .. } => 4 + HEADER_LEN,
                Payload::Error { request: None, .. } | Payload::Done => 4,
                Payload::Noop => 0,
            }
    }

    /// Encodes the message into a standalone buffer.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(align(self.size()));
        Codec::new().encode(self.clone(), &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Reads the sequence number of the message at the start of `src`, if its
/// header is complete. Used to attribute a message that fails to decode.
pub fn peek_seq(src: &[u8]) -> Option<u32> {
    if src.len() < HEADER_LEN {
        return None;
    }
    Some(u32::from_ne_bytes([src[8], src[9], src[10], src[11]]))
}

/// Splits datagrams into netlink messages and serializes outgoing ones.
#[derive(Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_ne_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < HEADER_LEN {
            return Err(Error::Length(len));
        }

        if src.len() < len {
            return Ok(None);
        }

        let mut frame = src.split_to(len).freeze();
        let padding = (align(len) - len).min(src.len());
        src.advance(padding);

        let header = Header::decode(&mut frame);

        let payload = match header.kind {
            NLMSG_NOOP => Payload::Noop,
            NLMSG_DONE => Payload::Done,
            NLMSG_OVERRUN => return Err(Error::Overrun),
            NLMSG_ERROR => {
                if frame.len() < 4 {
                    return Err(Error::Truncated { kind: header.kind, len });
                }
                let code = frame.get_i32_ne();
                let request = (frame.len() >= HEADER_LEN).then(|| Header::decode(&mut frame));
                Payload::Error { code, request }
            }
            kind if kind < NLMSG_MIN_TYPE => {
                tracing::trace!(kind, "Skipping reserved control message");
                Payload::Noop
            }
            kind => {
                if frame.len() < GENL_HEADER_LEN {
                    return Err(Error::Truncated { kind, len });
                }
                let cmd = frame.get_u8();
                let version = frame.get_u8();
                frame.advance(2);
                Payload::Genl { header: GenlHeader { cmd, version }, body: frame }
            }
        };

        Ok(Some(Message { header, payload }))
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.size();
        let len = u32::try_from(size).map_err(|_| Error::Length(size))?;

        dst.reserve(align(size));
        Header { len, ..item.header }.encode(dst);

        match item.payload {
            Payload::Genl { header, body } => {
                dst.put_u8(header.cmd);
                dst.put_u8(header.version);
                dst.put_u16_ne(0);
                dst.put(body);
            }
            Payload::Error { code, request } => {
                dst.put_i32_ne(code);
                if let Some(request) = request {
                    request.encode(dst);
                }
            }
            Payload::Done => dst.put_i32_ne(0),
            Payload::Noop => {}
        }

        dst.put_bytes(0, align(size) - size);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(mut buf: BytesMut) -> Vec<Message> {
        let mut codec = Codec::new();
        let mut out = Vec::new();
        while let Some(msg) = codec.decode_eof(&mut buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_genl_message_layout() {
        let mut msg = Message::genl(
            0x1c,
            flags::REQUEST | flags::ECHO,
            GenlHeader { cmd: 1, version: 2 },
            Bytes::from_static(&[1, 2, 3, 4, 5]),
        );
        msg.set_seq(77);

        let bytes = msg.to_bytes().unwrap();
        // 16 + 4 + 5, padded to 28
        assert_eq!(bytes.len(), 28);
        assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()), 25);
        assert_eq!(u16::from_ne_bytes(bytes[4..6].try_into().unwrap()), 0x1c);
        assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 77);
        assert_eq!(bytes[16], 1);
        assert_eq!(bytes[17], 2);

        let decoded = decode_all(BytesMut::from(&bytes[..]));
        assert_eq!(decoded.len(), 1);
        let (genl, body) = decoded[0].genl_body().unwrap();
        assert_eq!(genl, GenlHeader { cmd: 1, version: 2 });
        assert_eq!(body.as_ref(), &[1, 2, 3, 4, 5]);
        assert_eq!(decoded[0].seq(), 77);
    }

    #[test]
    fn test_multiple_messages_in_one_datagram() {
        let mut request =
            Message::genl(0x20, flags::REQUEST, GenlHeader { cmd: 3, version: 1 }, Bytes::new());
        request.set_seq(9);

        let mut buf = BytesMut::new();
        let mut codec = Codec::new();
        codec.encode(request.clone(), &mut buf).unwrap();
        codec.encode(Message::error(*request.header(), -2), &mut buf).unwrap();
        codec.encode(Message::done(9, 0), &mut buf).unwrap();

        let decoded = decode_all(buf);
        assert_eq!(decoded.len(), 3);
        match decoded[1].payload() {
            Payload::Error { code, request: Some(req) } => {
                assert_eq!(*code, -2);
                assert_eq!(req.seq, 9);
                assert_eq!(req.kind, 0x20);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(decoded[2].payload(), &Payload::Done);
        assert_ne!(decoded[2].flags() & flags::MULTI, 0);
    }

    #[test]
    fn test_short_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_ne(8);
        buf.put_slice(&[0; 12]);

        assert!(matches!(Codec::new().decode(&mut buf), Err(Error::Length(8))));
    }

    #[test]
    fn test_truncated_message_is_skipped() {
        // A family message whose generic header is cut short, then a valid one
        let mut buf = BytesMut::new();
        buf.put_u32_ne(18);
        buf.put_u16_ne(0x1c);
        buf.put_u16_ne(0);
        buf.put_u32_ne(5);
        buf.put_u32_ne(0);
        buf.put_slice(&[1, 2, 0, 0]);
        Codec::new().encode(Message::done(6, 0), &mut buf).unwrap();

        assert_eq!(peek_seq(&buf), Some(5));
        let mut codec = Codec::new();
        assert!(matches!(codec.decode(&mut buf), Err(Error::Truncated { kind: 0x1c, len: 18 })));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().seq(), 6);
        assert_eq!(peek_seq(&[0; 12]), None);
    }

    #[test]
    fn test_partial_message_is_not_silently_dropped() {
        let msg = Message::done(1, 0).to_bytes().unwrap();
        let mut buf = BytesMut::from(&msg[..msg.len() - 2]);

        assert!(Codec::new().decode_eof(&mut buf).is_err());
    }
}
