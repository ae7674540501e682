//! Netlink attribute (TLV) codec.
//!
//! Every command payload is a sequence of attributes. Each attribute is laid
//! out as:
//!
//! ```text
//! ┌──────────────────┬──────────────────┐
//! │  Length (u16)    │  Type (u16)      │  <- header, native endian
//! ├──────────────────┴──────────────────┤
//! │  Value (Length - 4 bytes)           │
//! ├─────────────────────────────────────┤
//! │  Padding up to a 4 byte boundary    │  <- not counted in Length
//! └─────────────────────────────────────┘
//! ```
//!
//! A value may itself be an attribute sequence (a nested attribute). Nested
//! values are only distinguishable by schema, so decoding yields raw bytes and
//! [`Attr::as_nested`] parses them on demand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Length of an attribute header.
pub const ATTR_HEADER_LEN: usize = 4;
/// Attributes (and netlink messages) are padded to this boundary.
pub const ALIGNTO: usize = 4;

/// Set on the type field of attributes carrying nested attributes.
pub const ATTR_F_NESTED: u16 = 1 << 15;
/// Set on the type field of attributes whose value is in network byte order.
pub const ATTR_F_NET_BYTEORDER: u16 = 1 << 14;
/// Mask extracting the attribute kind from the type field.
pub const ATTR_TYPE_MASK: u16 = !(ATTR_F_NESTED | ATTR_F_NET_BYTEORDER);

/// Rounds `len` up to the attribute alignment.
#[inline]
pub const fn align(len: usize) -> usize {
    (len + ALIGNTO - 1) & !(ALIGNTO - 1)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated attribute: {remaining} bytes left, header needs {ATTR_HEADER_LEN}")]
    Truncated { remaining: usize },
    #[error("Malformed attribute {kind}: declared length {declared}, {remaining} bytes available")]
    Malformed { kind: u16, declared: usize, remaining: usize },
    #[error("Attribute {kind}: expected {expected} bytes, got {actual}")]
    Length { kind: u16, expected: usize, actual: usize },
    #[error("Attribute {kind}: invalid UTF-8 string")]
    Utf8 { kind: u16 },
    #[error("Attribute {kind} too large to encode: {len} bytes")]
    TooLarge { kind: u16, len: usize },
}

/// The value of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Bytes),
    Nested(Attrs),
}

/// A single type-length-value attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    kind: u16,
    /// The `ATTR_F_*` bits of the type field.
    flags: u16,
    value: Value,
}

impl Attr {
    pub fn new(kind: u16, value: impl Into<Bytes>) -> Self {
        Self { kind: kind & ATTR_TYPE_MASK, flags: 0, value: Value::Bytes(value.into()) }
    }

    pub fn nested(kind: u16, attrs: Attrs) -> Self {
        Self { kind: kind & ATTR_TYPE_MASK, flags: 0, value: Value::Nested(attrs) }
    }

    /// Sets the given `ATTR_F_*` bits on the type field.
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags & !ATTR_TYPE_MASK;
        self
    }

    #[inline]
    pub fn kind(&self) -> u16 {
        self.kind
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    #[inline]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Length of the value, without header or padding.
    pub fn value_len(&self) -> usize {
        match &self.value {
            Value::Bytes(b) => b.len(),
            Value::Nested(attrs) => attrs.encoded_len(),
        }
    }

    /// Length on the wire, header and padding included.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        align(ATTR_HEADER_LEN + self.value_len())
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = ATTR_HEADER_LEN + self.value_len();
        if len > u16::MAX as usize {
            return Err(CodecError::TooLarge { kind: self.kind, len });
        }

        dst.reserve(align(len));
        dst.put_u16_ne(len as u16);
        dst.put_u16_ne(self.kind | self.flags);
        match &self.value {
            Value::Bytes(b) => dst.put_slice(b),
            Value::Nested(attrs) => attrs.encode(dst)?,
        }
        dst.put_bytes(0, align(len) - len);

        Ok(())
    }

    /// Returns the raw value bytes. Nested values are encoded first.
    pub fn payload(&self) -> Result<Bytes, CodecError> {
        match &self.value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Nested(attrs) => attrs.to_bytes(),
        }
    }

    /// Returns the value as a fixed-size array, failing on any length mismatch.
    pub fn fixed<const N: usize>(&self) -> Result<[u8; N], CodecError> {
        let payload = self.payload()?;
        <[u8; N]>::try_from(payload.as_ref()).map_err(|_| CodecError::Length {
            kind: self.kind,
            expected: N,
            actual: payload.len(),
        })
    }

    pub fn as_u8(&self) -> Result<u8, CodecError> {
        self.fixed::<1>().map(|[b]| b)
    }

    pub fn as_u16(&self) -> Result<u16, CodecError> {
        self.fixed().map(u16::from_ne_bytes)
    }

    pub fn as_u32(&self) -> Result<u32, CodecError> {
        self.fixed().map(u32::from_ne_bytes)
    }

    pub fn as_u64(&self) -> Result<u64, CodecError> {
        self.fixed().map(u64::from_ne_bytes)
    }

    pub fn as_be16(&self) -> Result<u16, CodecError> {
        self.fixed().map(u16::from_be_bytes)
    }

    pub fn as_be32(&self) -> Result<u32, CodecError> {
        self.fixed().map(u32::from_be_bytes)
    }

    pub fn as_be64(&self) -> Result<u64, CodecError> {
        self.fixed().map(u64::from_be_bytes)
    }

    /// Returns the value as a string, up to the first NUL byte.
    pub fn as_str(&self) -> Result<String, CodecError> {
        let payload = self.payload()?;
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        std::str::from_utf8(&payload[..end])
            .map(str::to_owned)
            .map_err(|_| CodecError::Utf8 { kind: self.kind })
    }

    /// Parses the value as a nested attribute sequence.
    pub fn as_nested(&self) -> Result<Attrs, CodecError> {
        match &self.value {
            Value::Nested(attrs) => Ok(attrs.clone()),
            Value::Bytes(b) => Attrs::decode(b.clone()),
        }
    }
}

/// An ordered attribute sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attrs(Vec<Attr>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attr: Attr) -> &mut Self {
        self.0.push(attr);
        self
    }

    pub fn push_bytes(&mut self, kind: u16, value: impl Into<Bytes>) -> &mut Self {
        self.push(Attr::new(kind, value))
    }

    pub fn push_u8(&mut self, kind: u16, value: u8) -> &mut Self {
        self.push_bytes(kind, vec![value])
    }

    pub fn push_u16(&mut self, kind: u16, value: u16) -> &mut Self {
        self.push_bytes(kind, value.to_ne_bytes().to_vec())
    }

    pub fn push_u32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.push_bytes(kind, value.to_ne_bytes().to_vec())
    }

    pub fn push_u64(&mut self, kind: u16, value: u64) -> &mut Self {
        self.push_bytes(kind, value.to_ne_bytes().to_vec())
    }

    pub fn push_be16(&mut self, kind: u16, value: u16) -> &mut Self {
        self.push_bytes(kind, value.to_be_bytes().to_vec())
    }

    pub fn push_be32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.push_bytes(kind, value.to_be_bytes().to_vec())
    }

    pub fn push_be64(&mut self, kind: u16, value: u64) -> &mut Self {
        self.push_bytes(kind, value.to_be_bytes().to_vec())
    }

    /// Pushes a NUL-terminated string attribute.
    pub fn push_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
        self.push_bytes(kind, buf)
    }

    /// Pushes a zero-length attribute whose presence is the value.
    pub fn push_flag(&mut self, kind: u16) -> &mut Self {
        self.push_bytes(kind, Bytes::new())
    }

    pub fn push_nested(&mut self, kind: u16, attrs: Attrs) -> &mut Self {
        self.push(Attr::nested(kind, attrs))
    }

    /// Returns the first attribute of the given kind.
    pub fn get(&self, kind: u16) -> Option<&Attr> {
        self.0.iter().find(|a| a.kind == kind)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attr> {
        self.0.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(Attr::encoded_len).sum()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(self.encoded_len());
        for attr in &self.0 {
            attr.encode(dst)?;
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes an attribute sequence. Values are kept as raw bytes, so unknown
    /// attribute kinds survive a decode/encode cycle untouched.
    pub fn decode(mut src: Bytes) -> Result<Self, CodecError> {
        let mut attrs = Vec::new();

        while src.has_remaining() {
            if src.len() < ATTR_HEADER_LEN {
                return Err(CodecError::Truncated { remaining: src.len() });
            }

            let len = u16::from_ne_bytes([src[0], src[1]]) as usize;
            let raw_kind = u16::from_ne_bytes([src[2], src[3]]);
            let kind = raw_kind & ATTR_TYPE_MASK;

            if len < ATTR_HEADER_LEN || len > src.len() {
                return Err(CodecError::Malformed { kind, declared: len, remaining: src.len() });
            }

            let mut value = src.split_to(len);
            value.advance(ATTR_HEADER_LEN);

            // The last attribute of a buffer may come without its padding
            let padding = (align(len) - len).min(src.len());
            src.advance(padding);

            attrs.push(Attr { kind, flags: raw_kind & !ATTR_TYPE_MASK, value: Value::Bytes(value) });
        }

        Ok(Self(attrs))
    }
}

impl FromIterator<Attr> for Attrs {
    fn from_iter<I: IntoIterator<Item = Attr>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Attrs {
    type Item = Attr;
    type IntoIter = std::vec::IntoIter<Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Attrs {
    type Item = &'a Attr;
    type IntoIter = std::slice::Iter<'a, Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_excluded_from_length() {
        let mut attrs = Attrs::new();
        attrs.push_bytes(7, vec![1u8, 2, 3, 4, 5]);

        let bytes = attrs.to_bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 9);
        assert_eq!(&bytes[9..], &[0, 0, 0]);

        let decoded = Attrs::decode(bytes).unwrap();
        assert_eq!(decoded.get(7).unwrap().payload().unwrap().as_ref(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_nested_attributes() {
        let mut inner = Attrs::new();
        inner.push_str(1, "eth0").push_u32(2, 42);

        let mut outer = Attrs::new();
        outer.push_u16(1, 7).push_nested(2, inner.clone()).push_flag(3);

        let decoded = Attrs::decode(outer.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.get(1).unwrap().as_u16().unwrap(), 7);

        let nested = decoded.get(2).unwrap().as_nested().unwrap();
        assert_eq!(nested.get(1).unwrap().as_str().unwrap(), "eth0");
        assert_eq!(nested.get(2).unwrap().as_u32().unwrap(), 42);
        assert_eq!(decoded.get(3).unwrap().value_len(), 0);
    }

    #[test]
    fn test_truncated_header() {
        let err = Attrs::decode(Bytes::from_static(&[8, 0])).unwrap_err();
        assert_eq!(err, CodecError::Truncated { remaining: 2 });
    }

    #[test]
    fn test_length_exceeds_buffer() {
        let mut buf = BytesMut::new();
        buf.put_u16_ne(16);
        buf.put_u16_ne(1);
        buf.put_slice(&[0; 4]);

        let err = Attrs::decode(buf.freeze()).unwrap_err();
        assert_eq!(err, CodecError::Malformed { kind: 1, declared: 16, remaining: 8 });
    }

    #[test]
    fn test_length_below_header() {
        let mut buf = BytesMut::new();
        buf.put_u16_ne(2);
        buf.put_u16_ne(5);

        assert!(matches!(
            Attrs::decode(buf.freeze()),
            Err(CodecError::Malformed { kind: 5, declared: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_kinds_preserved() {
        let mut attrs = Attrs::new();
        attrs.push_bytes(0x3ff0, vec![9u8, 9, 9]).push_u32(1, 1);

        let bytes = attrs.to_bytes().unwrap();
        let decoded = Attrs::decode(bytes.clone()).unwrap();
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_missing_trailing_padding_accepted() {
        let mut buf = BytesMut::new();
        buf.put_u16_ne(5);
        buf.put_u16_ne(3);
        buf.put_u8(0xaa);

        let decoded = Attrs::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.get(3).unwrap().as_u8().unwrap(), 0xaa);
    }

    #[test]
    fn test_flag_bits_masked_from_kind() {
        let attr = Attr::nested(4, Attrs::new()).with_flags(ATTR_F_NESTED);
        let mut attrs = Attrs::new();
        attrs.push(attr);

        let decoded = Attrs::decode(attrs.to_bytes().unwrap()).unwrap();
        let attr = decoded.get(4).unwrap();
        assert_eq!(attr.kind(), 4);
        assert_eq!(attr.flags(), ATTR_F_NESTED);
    }

    #[test]
    fn test_fixed_width_mismatch() {
        let attr = Attr::new(2, vec![1u8, 2, 3]);
        assert_eq!(
            attr.as_u32().unwrap_err(),
            CodecError::Length { kind: 2, expected: 4, actual: 3 }
        );
    }

    #[test]
    fn test_oversized_attribute_rejected() {
        let attr = Attr::new(1, vec![0u8; u16::MAX as usize]);
        let mut buf = BytesMut::new();
        assert!(matches!(attr.encode(&mut buf), Err(CodecError::TooLarge { kind: 1, .. })));
    }
}
