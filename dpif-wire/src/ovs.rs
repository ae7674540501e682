//! Open vSwitch datapath families (`include/uapi/linux/openvswitch.h`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::attr::{Attr, Attrs, CodecError};

pub const DATAPATH_FAMILY: &str = "ovs_datapath";
pub const VPORT_FAMILY: &str = "ovs_vport";
pub const FLOW_FAMILY: &str = "ovs_flow";
pub const PACKET_FAMILY: &str = "ovs_packet";

pub const DATAPATH_MCGROUP: &str = "ovs_datapath";
pub const VPORT_MCGROUP: &str = "ovs_vport";
pub const FLOW_MCGROUP: &str = "ovs_flow";

pub const DATAPATH_VERSION: u8 = 2;
pub const VPORT_VERSION: u8 = 1;
pub const FLOW_VERSION: u8 = 1;

/// Length of [`OvsHeader`] on the wire.
pub const OVS_HEADER_LEN: usize = 4;

// Commands are shared by the three families.
pub const CMD_NEW: u8 = 1;
pub const CMD_DEL: u8 = 2;
pub const CMD_GET: u8 = 3;
pub const CMD_SET: u8 = 4;

pub const DP_ATTR_NAME: u16 = 1;
pub const DP_ATTR_UPCALL_PID: u16 = 2;
pub const DP_ATTR_STATS: u16 = 3;
pub const DP_ATTR_MEGAFLOW_STATS: u16 = 4;
pub const DP_ATTR_USER_FEATURES: u16 = 5;

pub const VPORT_ATTR_PORT_NO: u16 = 1;
pub const VPORT_ATTR_TYPE: u16 = 2;
pub const VPORT_ATTR_NAME: u16 = 3;
pub const VPORT_ATTR_OPTIONS: u16 = 4;
pub const VPORT_ATTR_UPCALL_PID: u16 = 5;
pub const VPORT_ATTR_STATS: u16 = 6;

pub const VPORT_TYPE_NETDEV: u32 = 1;
pub const VPORT_TYPE_INTERNAL: u32 = 2;
pub const VPORT_TYPE_GRE: u32 = 3;
pub const VPORT_TYPE_VXLAN: u32 = 4;
pub const VPORT_TYPE_GENEVE: u32 = 5;

/// `OVS_TUNNEL_ATTR_DST_PORT`, inside `VPORT_ATTR_OPTIONS`.
pub const TUNNEL_ATTR_DST_PORT: u16 = 1;

pub const FLOW_ATTR_KEY: u16 = 1;
pub const FLOW_ATTR_ACTIONS: u16 = 2;
pub const FLOW_ATTR_STATS: u16 = 3;
pub const FLOW_ATTR_TCP_FLAGS: u16 = 4;
pub const FLOW_ATTR_USED: u16 = 5;
pub const FLOW_ATTR_CLEAR: u16 = 6;
pub const FLOW_ATTR_MASK: u16 = 7;

/// Fixed header following the generic header in every datapath family message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OvsHeader {
    /// ifindex of the datapath's local port, 0 to address a datapath by name.
    pub dp_ifindex: u32,
}

/// Encodes a message body: the [`OvsHeader`] followed by `attrs`.
pub fn encode_body(header: OvsHeader, attrs: &Attrs) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::with_capacity(OVS_HEADER_LEN + attrs.encoded_len());
    buf.put_u32_ne(header.dp_ifindex);
    attrs.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Splits a message body into its [`OvsHeader`] and attributes.
pub fn decode_body(mut body: Bytes) -> Result<(OvsHeader, Attrs), CodecError> {
    if body.len() < OVS_HEADER_LEN {
        return Err(CodecError::Truncated { remaining: body.len() });
    }

    let header = OvsHeader { dp_ifindex: body.get_u32_ne() };
    Ok((header, Attrs::decode(body)?))
}

/// `struct ovs_dp_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatapathStats {
    pub hit: u64,
    pub missed: u64,
    pub lost: u64,
    pub flows: u64,
}

impl DatapathStats {
    pub fn decode(attr: &Attr) -> Result<Self, CodecError> {
        let [hit, missed, lost, flows] = read_u64s(&attr.fixed::<32>()?);
        Ok(Self { hit, missed, lost, flows })
    }

    pub fn encode(&self, kind: u16) -> Attr {
        Attr::new(kind, write_u64s(&[self.hit, self.missed, self.lost, self.flows]))
    }
}

/// `struct ovs_vport_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VportStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl VportStats {
    pub fn decode(attr: &Attr) -> Result<Self, CodecError> {
        let [rx_packets, tx_packets, rx_bytes, tx_bytes, rx_errors, tx_errors, rx_dropped, tx_dropped] =
            read_u64s(&attr.fixed::<64>()?);
        Ok(Self { rx_packets, tx_packets, rx_bytes, tx_bytes, rx_errors, tx_errors, rx_dropped, tx_dropped })
    }

    pub fn encode(&self, kind: u16) -> Attr {
        Attr::new(
            kind,
            write_u64s(&[
                self.rx_packets,
                self.tx_packets,
                self.rx_bytes,
                self.tx_bytes,
                self.rx_errors,
                self.tx_errors,
                self.rx_dropped,
                self.tx_dropped,
            ]),
        )
    }
}

/// `struct ovs_flow_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub packets: u64,
    pub bytes: u64,
}

impl FlowStats {
    pub fn decode(attr: &Attr) -> Result<Self, CodecError> {
        let [packets, bytes] = read_u64s(&attr.fixed::<16>()?);
        Ok(Self { packets, bytes })
    }

    pub fn encode(&self, kind: u16) -> Attr {
        Attr::new(kind, write_u64s(&[self.packets, self.bytes]))
    }
}

fn read_u64s<const N: usize, const B: usize>(buf: &[u8; B]) -> [u64; N] {
    let mut out = [0u64; N];
    for (value, chunk) in out.iter_mut().zip(buf.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        *value = u64::from_ne_bytes(word);
    }
    out
}

fn write_u64s(values: &[u64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(values.len() * 8);
    for value in values {
        buf.put_u64_ne(*value);
    }
    buf.freeze()
}
