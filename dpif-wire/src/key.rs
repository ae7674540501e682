//! Flow match keys.
//!
//! A flow's match is a set of keys, at most one per key type, carried as the
//! attributes of `FLOW_ATTR_KEY`. Each catalogued key has a fixed layout
//! mirroring the kernel's `struct ovs_key_*`; keys of unknown type are kept as
//! [`FlowKey::Opaque`] so that nothing the kernel reports gets lost.

use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, Ipv6Addr},
};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::attr::{Attr, Attrs, CodecError, ATTR_TYPE_MASK};

pub const KEY_ATTR_ENCAP: u16 = 1;
pub const KEY_ATTR_PRIORITY: u16 = 2;
pub const KEY_ATTR_IN_PORT: u16 = 3;
pub const KEY_ATTR_ETHERNET: u16 = 4;
pub const KEY_ATTR_VLAN: u16 = 5;
pub const KEY_ATTR_ETHERTYPE: u16 = 6;
pub const KEY_ATTR_IPV4: u16 = 7;
pub const KEY_ATTR_IPV6: u16 = 8;
pub const KEY_ATTR_TCP: u16 = 9;
pub const KEY_ATTR_UDP: u16 = 10;
pub const KEY_ATTR_ICMP: u16 = 11;
pub const KEY_ATTR_ICMPV6: u16 = 12;
pub const KEY_ATTR_ARP: u16 = 13;
pub const KEY_ATTR_ND: u16 = 14;
pub const KEY_ATTR_SKB_MARK: u16 = 15;
pub const KEY_ATTR_TUNNEL: u16 = 16;
pub const KEY_ATTR_SCTP: u16 = 17;
pub const KEY_ATTR_TCP_FLAGS: u16 = 18;
pub const KEY_ATTR_DP_HASH: u16 = 19;
pub const KEY_ATTR_RECIRC_ID: u16 = 20;

pub const TUNNEL_KEY_ATTR_ID: u16 = 0;
pub const TUNNEL_KEY_ATTR_IPV4_SRC: u16 = 1;
pub const TUNNEL_KEY_ATTR_IPV4_DST: u16 = 2;
pub const TUNNEL_KEY_ATTR_TOS: u16 = 3;
pub const TUNNEL_KEY_ATTR_TTL: u16 = 4;
pub const TUNNEL_KEY_ATTR_DONT_FRAGMENT: u16 = 5;
pub const TUNNEL_KEY_ATTR_CSUM: u16 = 6;
pub const TUNNEL_KEY_ATTR_TP_SRC: u16 = 9;
pub const TUNNEL_KEY_ATTR_TP_DST: u16 = 10;

pub type MacAddr = [u8; 6];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key {kind}: expected {expected} bytes, got {actual}")]
    Length { kind: u16, expected: usize, actual: usize },
    #[error("Duplicate key type {0}")]
    Duplicate(u16),
    #[error("Key type {0} cannot be carried as an opaque key")]
    OpaqueKind(u16),
    #[error("Invalid action {kind}: {reason}")]
    InvalidAction { kind: u16, reason: &'static str },
    #[error("Attribute codec error: {0}")]
    Codec(CodecError),
}

impl From<CodecError> for KeyError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Length { kind, expected, actual } => Self::Length { kind, expected, actual },
            e => Self::Codec(e),
        }
    }
}

/// `struct ovs_key_ethernet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthernetKey {
    pub src: MacAddr,
    pub dst: MacAddr,
}

/// `struct ovs_key_ipv4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Key {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
    pub frag: u8,
}

/// `struct ovs_key_ipv6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv6Key {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub label: u32,
    pub proto: u8,
    pub tclass: u8,
    pub hlimit: u8,
    pub frag: u8,
}

/// Transport ports, shared by `ovs_key_tcp`, `ovs_key_udp` and `ovs_key_sctp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortsKey {
    pub src: u16,
    pub dst: u16,
}

/// `struct ovs_key_icmp` and `struct ovs_key_icmpv6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IcmpKey {
    pub kind: u8,
    pub code: u8,
}

/// `struct ovs_key_arp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArpKey {
    pub sip: Ipv4Addr,
    pub tip: Ipv4Addr,
    pub op: u16,
    pub sha: MacAddr,
    pub tha: MacAddr,
}

/// Tunnel metadata, a nested attribute set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub id: Option<u64>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    pub tos: Option<u8>,
    pub ttl: Option<u8>,
    pub dont_fragment: bool,
    pub checksum: bool,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
    /// Tunnel attributes without a typed field, kept verbatim.
    pub extra: Vec<(u16, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowKey {
    Priority(u32),
    InPort(u32),
    Ethernet(EthernetKey),
    /// VLAN TCI.
    Vlan(u16),
    EtherType(u16),
    Ipv4(Ipv4Key),
    Ipv6(Ipv6Key),
    Tcp(PortsKey),
    Udp(PortsKey),
    Icmp(IcmpKey),
    Icmpv6(IcmpKey),
    Arp(ArpKey),
    SkbMark(u32),
    Tunnel(TunnelKey),
    Sctp(PortsKey),
    TcpFlags(u16),
    DpHash(u32),
    RecircId(u32),
    /// A key type this library has no layout for, with the attribute flag
    /// bits it was received with. Build one with [`FlowKey::opaque`].
    Opaque { kind: u16, flags: u16, value: Bytes },
}

impl FlowKey {
    /// Matches on source and destination MAC address.
    pub fn ethernet(src: MacAddr, dst: MacAddr) -> Self {
        Self::Ethernet(EthernetKey { src, dst })
    }

    /// An opaque key. Fails for types that have a typed variant, and for
    /// types that overlap the attribute flag bits.
    pub fn opaque(kind: u16, value: impl Into<Bytes>) -> Result<Self, KeyError> {
        let key = Self::Opaque { kind, flags: 0, value: value.into() };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<(), KeyError> {
        match self {
            Self::Opaque { kind, .. } if *kind & !ATTR_TYPE_MASK != 0 || is_typed(*kind) => {
                Err(KeyError::OpaqueKind(*kind))
            }
            _ => Ok(()),
        }
    }

    /// The attribute type of this key.
    pub fn kind(&self) -> u16 {
        match self {
            Self::Priority(_) => KEY_ATTR_PRIORITY,
            Self::InPort(_) => KEY_ATTR_IN_PORT,
            Self::Ethernet(_) => KEY_ATTR_ETHERNET,
            Self::Vlan(_) => KEY_ATTR_VLAN,
            Self::EtherType(_) => KEY_ATTR_ETHERTYPE,
            Self::Ipv4(_) => KEY_ATTR_IPV4,
            Self::Ipv6(_) => KEY_ATTR_IPV6,
            Self::Tcp(_) => KEY_ATTR_TCP,
            Self::Udp(_) => KEY_ATTR_UDP,
            Self::Icmp(_) => KEY_ATTR_ICMP,
            Self::Icmpv6(_) => KEY_ATTR_ICMPV6,
            Self::Arp(_) => KEY_ATTR_ARP,
            Self::SkbMark(_) => KEY_ATTR_SKB_MARK,
            Self::Tunnel(_) => KEY_ATTR_TUNNEL,
            Self::Sctp(_) => KEY_ATTR_SCTP,
            Self::TcpFlags(_) => KEY_ATTR_TCP_FLAGS,
            Self::DpHash(_) => KEY_ATTR_DP_HASH,
            Self::RecircId(_) => KEY_ATTR_RECIRC_ID,
            Self::Opaque { kind, .. } => *kind,
        }
    }

    pub fn encode(&self) -> Attr {
        let kind = self.kind();
        let mut buf = BytesMut::new();

        match self {
            Self::Priority(v)
            | Self::InPort(v)
            | Self::SkbMark(v)
            | Self::DpHash(v)
            | Self::RecircId(v) => buf.put_u32_ne(*v),
            Self::Vlan(v) | Self::EtherType(v) | Self::TcpFlags(v) => buf.put_u16(*v),
            Self::Ethernet(k) => {
                buf.put_slice(&k.src);
                buf.put_slice(&k.dst);
            }
            Self::Ipv4(k) => {
                buf.put_slice(&k.src.octets());
                buf.put_slice(&k.dst.octets());
                buf.put_slice(&[k.proto, k.tos, k.ttl, k.frag]);
            }
            Self::Ipv6(k) => {
                buf.put_slice(&k.src.octets());
                buf.put_slice(&k.dst.octets());
                buf.put_u32(k.label);
                buf.put_slice(&[k.proto, k.tclass, k.hlimit, k.frag]);
            }
            Self::Tcp(k) | Self::Udp(k) | Self::Sctp(k) => {
                buf.put_u16(k.src);
                buf.put_u16(k.dst);
            }
            Self::Icmp(k) | Self::Icmpv6(k) => buf.put_slice(&[k.kind, k.code]),
            Self::Arp(k) => {
                buf.put_slice(&k.sip.octets());
                buf.put_slice(&k.tip.octets());
                buf.put_u16(k.op);
                buf.put_slice(&k.sha);
                buf.put_slice(&k.tha);
                // sizeof(struct ovs_key_arp) is padded to 24
                buf.put_bytes(0, 2);
            }
            Self::Tunnel(k) => return Attr::nested(kind, k.encode()),
            Self::Opaque { flags, value, .. } => return Attr::new(kind, value.clone()).with_flags(*flags),
        }

        Attr::new(kind, buf.freeze())
    }

    pub fn decode(attr: &Attr) -> Result<Self, KeyError> {
        let key = match attr.kind() {
            KEY_ATTR_PRIORITY => Self::Priority(attr.as_u32()?),
            KEY_ATTR_IN_PORT => Self::InPort(attr.as_u32()?),
            KEY_ATTR_ETHERNET => {
                let b = attr.fixed::<12>()?;
                Self::Ethernet(EthernetKey { src: mac(&b[0..6]), dst: mac(&b[6..12]) })
            }
            KEY_ATTR_VLAN => Self::Vlan(attr.as_be16()?),
            KEY_ATTR_ETHERTYPE => Self::EtherType(attr.as_be16()?),
            KEY_ATTR_IPV4 => {
                let b = attr.fixed::<12>()?;
                Self::Ipv4(Ipv4Key {
                    src: ipv4(&b[0..4]),
                    dst: ipv4(&b[4..8]),
                    proto: b[8],
                    tos: b[9],
                    ttl: b[10],
                    frag: b[11],
                })
            }
            KEY_ATTR_IPV6 => {
                let b = attr.fixed::<40>()?;
                Self::Ipv6(Ipv6Key {
                    src: ipv6(&b[0..16]),
                    dst: ipv6(&b[16..32]),
                    label: u32::from_be_bytes([b[32], b[33], b[34], b[35]]),
                    proto: b[36],
                    tclass: b[37],
                    hlimit: b[38],
                    frag: b[39],
                })
            }
            KEY_ATTR_TCP => Self::Tcp(ports(attr)?),
            KEY_ATTR_UDP => Self::Udp(ports(attr)?),
            KEY_ATTR_SCTP => Self::Sctp(ports(attr)?),
            KEY_ATTR_ICMP => Self::Icmp(icmp(attr)?),
            KEY_ATTR_ICMPV6 => Self::Icmpv6(icmp(attr)?),
            KEY_ATTR_ARP => {
                let b = attr.fixed::<24>()?;
                Self::Arp(ArpKey {
                    sip: ipv4(&b[0..4]),
                    tip: ipv4(&b[4..8]),
                    op: u16::from_be_bytes([b[8], b[9]]),
                    sha: mac(&b[10..16]),
                    tha: mac(&b[16..22]),
                })
            }
            KEY_ATTR_SKB_MARK => Self::SkbMark(attr.as_u32()?),
            KEY_ATTR_TUNNEL => Self::Tunnel(TunnelKey::decode(&attr.as_nested()?)?),
            KEY_ATTR_TCP_FLAGS => Self::TcpFlags(attr.as_be16()?),
            KEY_ATTR_DP_HASH => Self::DpHash(attr.as_u32()?),
            KEY_ATTR_RECIRC_ID => Self::RecircId(attr.as_u32()?),
            kind => Self::Opaque { kind, flags: attr.flags(), value: attr.payload()? },
        };

        Ok(key)
    }
}

impl TunnelKey {
    fn encode(&self) -> Attrs {
        let mut attrs = Attrs::new();
        if let Some(id) = self.id {
            attrs.push_be64(TUNNEL_KEY_ATTR_ID, id);
        }
        if let Some(src) = self.ipv4_src {
            attrs.push_bytes(TUNNEL_KEY_ATTR_IPV4_SRC, src.octets().to_vec());
        }
        if let Some(dst) = self.ipv4_dst {
            attrs.push_bytes(TUNNEL_KEY_ATTR_IPV4_DST, dst.octets().to_vec());
        }
        if let Some(tos) = self.tos {
            attrs.push_u8(TUNNEL_KEY_ATTR_TOS, tos);
        }
        if let Some(ttl) = self.ttl {
            attrs.push_u8(TUNNEL_KEY_ATTR_TTL, ttl);
        }
        if self.dont_fragment {
            attrs.push_flag(TUNNEL_KEY_ATTR_DONT_FRAGMENT);
        }
        if self.checksum {
            attrs.push_flag(TUNNEL_KEY_ATTR_CSUM);
        }
        if let Some(port) = self.tp_src {
            attrs.push_be16(TUNNEL_KEY_ATTR_TP_SRC, port);
        }
        if let Some(port) = self.tp_dst {
            attrs.push_be16(TUNNEL_KEY_ATTR_TP_DST, port);
        }
        for (kind, value) in &self.extra {
            attrs.push_bytes(*kind, value.clone());
        }
        attrs
    }

    fn decode(attrs: &Attrs) -> Result<Self, KeyError> {
        let mut key = Self::default();
        for attr in attrs {
            match attr.kind() {
                TUNNEL_KEY_ATTR_ID => key.id = Some(attr.as_be64()?),
                TUNNEL_KEY_ATTR_IPV4_SRC => key.ipv4_src = Some(ipv4(&attr.fixed::<4>()?)),
                TUNNEL_KEY_ATTR_IPV4_DST => key.ipv4_dst = Some(ipv4(&attr.fixed::<4>()?)),
                TUNNEL_KEY_ATTR_TOS => key.tos = Some(attr.as_u8()?),
                TUNNEL_KEY_ATTR_TTL => key.ttl = Some(attr.as_u8()?),
                TUNNEL_KEY_ATTR_DONT_FRAGMENT => key.dont_fragment = true,
                TUNNEL_KEY_ATTR_CSUM => key.checksum = true,
                TUNNEL_KEY_ATTR_TP_SRC => key.tp_src = Some(attr.as_be16()?),
                TUNNEL_KEY_ATTR_TP_DST => key.tp_dst = Some(attr.as_be16()?),
                kind => key.extra.push((kind, attr.payload()?)),
            }
        }
        Ok(key)
    }
}

/// A set of flow keys, at most one per key type, iterated in ascending type
/// order. Two sets are equal when they hold the same keys, regardless of the
/// order they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowKeys(BTreeMap<u16, FlowKey>);

impl FlowKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key. Fails if a key of the same type is already present.
    pub fn insert(&mut self, key: FlowKey) -> Result<(), KeyError> {
        key.validate()?;
        let kind = key.kind();
        if self.0.contains_key(&kind) {
            return Err(KeyError::Duplicate(kind));
        }
        self.0.insert(kind, key);
        Ok(())
    }

    pub fn get(&self, kind: u16) -> Option<&FlowKey> {
        self.0.get(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowKey> {
        self.0.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encodes the set in ascending type order, as the kernel expects.
    pub fn encode(&self) -> Attrs {
        self.0.values().map(FlowKey::encode).collect()
    }

    pub fn decode(attrs: &Attrs) -> Result<Self, KeyError> {
        let mut keys = Self::new();
        for attr in attrs {
            keys.insert(FlowKey::decode(attr)?)?;
        }
        Ok(keys)
    }
}

impl TryFrom<Vec<FlowKey>> for FlowKeys {
    type Error = KeyError;

    fn try_from(keys: Vec<FlowKey>) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for key in keys {
            set.insert(key)?;
        }
        Ok(set)
    }
}

/// Encodes a collection of keys, rejecting duplicate types.
pub fn encode_keys<'a>(keys: impl IntoIterator<Item = &'a FlowKey>) -> Result<Attrs, KeyError> {
    let mut set = FlowKeys::new();
    for key in keys {
        set.insert(key.clone())?;
    }
    Ok(set.encode())
}

pub fn decode_keys(attrs: &Attrs) -> Result<FlowKeys, KeyError> {
    FlowKeys::decode(attrs)
}

/// Key types decoded into a typed [`FlowKey`] variant.
fn is_typed(kind: u16) -> bool {
    matches!(kind, KEY_ATTR_PRIORITY..=KEY_ATTR_ARP | KEY_ATTR_SKB_MARK..=KEY_ATTR_RECIRC_ID)
}

fn mac(b: &[u8]) -> MacAddr {
    let mut out = [0u8; 6];
    out.copy_from_slice(b);
    out
}

fn ipv4(b: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(b[0], b[1], b[2], b[3])
}

fn ipv6(b: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(b);
    Ipv6Addr::from(octets)
}

fn ports(attr: &Attr) -> Result<PortsKey, KeyError> {
    let b = attr.fixed::<4>()?;
    Ok(PortsKey { src: u16::from_be_bytes([b[0], b[1]]), dst: u16::from_be_bytes([b[2], b[3]]) })
}

fn icmp(attr: &Attr) -> Result<IcmpKey, KeyError> {
    let [kind, code] = attr.fixed::<2>()?;
    Ok(IcmpKey { kind, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::ATTR_F_NESTED;

    fn catalogue() -> Vec<FlowKey> {
        vec![
            FlowKey::Priority(7),
            FlowKey::InPort(3),
            FlowKey::ethernet([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1]),
            FlowKey::Vlan(0x1064),
            FlowKey::EtherType(0x0800),
            FlowKey::Ipv4(Ipv4Key {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                proto: 6,
                tos: 0x10,
                ttl: 64,
                frag: 0,
            }),
            FlowKey::Ipv6(Ipv6Key {
                src: "fe80::1".parse().unwrap(),
                dst: "fe80::2".parse().unwrap(),
                label: 0xabcde,
                proto: 17,
                tclass: 0,
                hlimit: 255,
                frag: 1,
            }),
            FlowKey::Tcp(PortsKey { src: 49152, dst: 80 }),
            FlowKey::Udp(PortsKey { src: 5353, dst: 53 }),
            FlowKey::Icmp(IcmpKey { kind: 8, code: 0 }),
            FlowKey::Icmpv6(IcmpKey { kind: 135, code: 0 }),
            FlowKey::Arp(ArpKey {
                sip: Ipv4Addr::new(192, 168, 0, 1),
                tip: Ipv4Addr::new(192, 168, 0, 2),
                op: 1,
                sha: [0xaa; 6],
                tha: [0; 6],
            }),
            FlowKey::SkbMark(0xdead),
            FlowKey::Tunnel(TunnelKey {
                id: Some(0x1234_5678_9abc),
                ipv4_src: Some(Ipv4Addr::new(172, 16, 0, 1)),
                ipv4_dst: Some(Ipv4Addr::new(172, 16, 0, 2)),
                tos: Some(0),
                ttl: Some(64),
                dont_fragment: true,
                checksum: false,
                tp_src: Some(4789),
                tp_dst: None,
                extra: vec![(8, Bytes::from_static(&[1, 2, 3, 4]))],
            }),
            FlowKey::Sctp(PortsKey { src: 1, dst: 2 }),
            FlowKey::TcpFlags(0x012),
            FlowKey::DpHash(99),
            FlowKey::RecircId(5),
            FlowKey::opaque(60, Bytes::from_static(&[1, 2, 3])).unwrap(),
        ]
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        for key in catalogue() {
            let mut attrs = Attrs::new();
            attrs.push(key.encode());
            let wire = Attrs::decode(attrs.to_bytes().unwrap()).unwrap();

            let decoded = FlowKey::decode(wire.iter().next().unwrap()).unwrap();
            assert_eq!(decoded, key, "key type {}", key.kind());
        }
    }

    #[test]
    fn test_keys_emitted_in_ascending_order() {
        let mut keys = catalogue();
        keys.reverse();

        let attrs = encode_keys(&keys).unwrap();
        let kinds: Vec<u16> = attrs.iter().map(Attr::kind).collect();
        let mut sorted = kinds.clone();
        sorted.sort_unstable();
        assert_eq!(kinds, sorted);
        assert_eq!(kinds.len(), keys.len());
    }

    #[test]
    fn test_set_equality_ignores_insertion_order() {
        let keys = catalogue();
        let forward = FlowKeys::try_from(keys.clone()).unwrap();
        let backward = FlowKeys::try_from(keys.into_iter().rev().collect::<Vec<_>>()).unwrap();
        assert_eq!(forward, backward);

        let mut other = FlowKeys::new();
        other.insert(FlowKey::ethernet([1, 2, 3, 4, 5, 7], [6, 5, 4, 3, 2, 1])).unwrap();
        assert_ne!(forward, other);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut keys = FlowKeys::new();
        keys.insert(FlowKey::InPort(1)).unwrap();
        assert_eq!(keys.insert(FlowKey::InPort(2)), Err(KeyError::Duplicate(KEY_ATTR_IN_PORT)));

        let dup = [FlowKey::EtherType(0x0800), FlowKey::EtherType(0x86dd)];
        assert_eq!(encode_keys(&dup).unwrap_err(), KeyError::Duplicate(KEY_ATTR_ETHERTYPE));

        let mut attrs = Attrs::new();
        attrs.push_u32(KEY_ATTR_SKB_MARK, 1).push_u32(KEY_ATTR_SKB_MARK, 2);
        assert_eq!(decode_keys(&attrs).unwrap_err(), KeyError::Duplicate(KEY_ATTR_SKB_MARK));
    }

    #[test]
    fn test_no_implicit_padding_or_truncation() {
        // An 11 byte ethernet key
        let short = Attr::new(KEY_ATTR_ETHERNET, vec![0u8; 11]);
        assert_eq!(
            FlowKey::decode(&short).unwrap_err(),
            KeyError::Length { kind: KEY_ATTR_ETHERNET, expected: 12, actual: 11 }
        );

        // A 22 byte ARP key, missing its trailing padding
        let arp = Attr::new(KEY_ATTR_ARP, vec![0u8; 22]);
        assert!(matches!(FlowKey::decode(&arp), Err(KeyError::Length { expected: 24, .. })));

        let wide = Attr::new(KEY_ATTR_IN_PORT, vec![0u8; 8]);
        assert!(FlowKey::decode(&wide).is_err());
    }

    #[test]
    fn test_unknown_key_kept_opaque() {
        let mut attrs = Attrs::new();
        attrs.push_u32(KEY_ATTR_IN_PORT, 1).push_bytes(KEY_ATTR_ND, vec![0u8; 28]);

        let keys = decode_keys(&attrs).unwrap();
        assert!(matches!(
            keys.get(KEY_ATTR_ND),
            Some(FlowKey::Opaque { kind: KEY_ATTR_ND, flags: 0, value }) if value.len() == 28
        ));
        assert_eq!(keys.encode().to_bytes().unwrap(), attrs.to_bytes().unwrap());
    }

    #[test]
    fn test_opaque_key_keeps_attribute_flags() {
        let mut inner = Attrs::new();
        inner.push_be16(KEY_ATTR_ETHERTYPE, 0x0800);
        let mut attrs = Attrs::new();
        attrs.push(Attr::nested(KEY_ATTR_ENCAP, inner).with_flags(ATTR_F_NESTED));
        let wire = attrs.to_bytes().unwrap();

        let keys = decode_keys(&Attrs::decode(wire.clone()).unwrap()).unwrap();
        assert!(matches!(
            keys.get(KEY_ATTR_ENCAP),
            Some(FlowKey::Opaque { kind: KEY_ATTR_ENCAP, flags: ATTR_F_NESTED, .. })
        ));
        assert_eq!(keys.encode().to_bytes().unwrap(), wire);
    }

    #[test]
    fn test_opaque_kind_must_be_untyped() {
        assert_eq!(
            FlowKey::opaque(KEY_ATTR_IN_PORT, vec![1, 0, 0, 0]),
            Err(KeyError::OpaqueKind(KEY_ATTR_IN_PORT))
        );
        assert_eq!(FlowKey::opaque(0x8020, vec![0u8; 4]), Err(KeyError::OpaqueKind(0x8020)));
        assert!(FlowKey::opaque(KEY_ATTR_ND, vec![0u8; 28]).is_ok());

        // Built by hand, the same keys are refused by the set
        let mut keys = FlowKeys::new();
        let typed =
            FlowKey::Opaque { kind: KEY_ATTR_IN_PORT, flags: 0, value: Bytes::from_static(&[1, 0, 0, 0]) };
        assert_eq!(keys.insert(typed), Err(KeyError::OpaqueKind(KEY_ATTR_IN_PORT)));
        assert!(keys.is_empty());
    }
}
