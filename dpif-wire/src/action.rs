//! Flow actions, carried as the attributes of `FLOW_ATTR_ACTIONS`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    attr::{Attr, Attrs},
    key::{FlowKey, KeyError},
};

pub const ACTION_ATTR_OUTPUT: u16 = 1;
pub const ACTION_ATTR_USERSPACE: u16 = 2;
pub const ACTION_ATTR_SET: u16 = 3;
pub const ACTION_ATTR_PUSH_VLAN: u16 = 4;
pub const ACTION_ATTR_POP_VLAN: u16 = 5;
pub const ACTION_ATTR_RECIRC: u16 = 7;

pub const USERSPACE_ATTR_PID: u16 = 1;
pub const USERSPACE_ATTR_USERDATA: u16 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    /// Sends the packet out of the given port.
    Output(u32),
    /// Sends the packet to userspace on the given netlink port.
    Userspace { pid: u32, userdata: Option<Bytes> },
    /// Rewrites the header field described by the key.
    Set(FlowKey),
    PushVlan { tpid: u16, tci: u16 },
    PopVlan,
    Recirc(u32),
    Opaque { kind: u16, value: Bytes },
}

impl Action {
    pub fn kind(&self) -> u16 {
        match self {
            Self::Output(_) => ACTION_ATTR_OUTPUT,
            Self::Userspace { .. } => ACTION_ATTR_USERSPACE,
            Self::Set(_) => ACTION_ATTR_SET,
            Self::PushVlan { .. } => ACTION_ATTR_PUSH_VLAN,
            Self::PopVlan => ACTION_ATTR_POP_VLAN,
            Self::Recirc(_) => ACTION_ATTR_RECIRC,
            Self::Opaque { kind, .. } => *kind,
        }
    }

    pub fn encode(&self) -> Attr {
        let kind = self.kind();
        match self {
            Self::Output(port) | Self::Recirc(port) => Attr::new(kind, port.to_ne_bytes().to_vec()),
            Self::Userspace { pid, userdata } => {
                let mut attrs = Attrs::new();
                attrs.push_u32(USERSPACE_ATTR_PID, *pid);
                if let Some(data) = userdata {
                    attrs.push_bytes(USERSPACE_ATTR_USERDATA, data.clone());
                }
                Attr::nested(kind, attrs)
            }
            Self::Set(key) => Attr::nested(kind, std::iter::once(key.encode()).collect()),
            Self::PushVlan { tpid, tci } => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u16(*tpid);
                buf.put_u16(*tci);
                Attr::new(kind, buf.freeze())
            }
            Self::PopVlan => Attr::new(kind, Bytes::new()),
            Self::Opaque { value, .. } => Attr::new(kind, value.clone()),
        }
    }

    pub fn decode(attr: &Attr) -> Result<Self, KeyError> {
        let kind = attr.kind();
        let action = match kind {
            ACTION_ATTR_OUTPUT => Self::Output(attr.as_u32()?),
            ACTION_ATTR_RECIRC => Self::Recirc(attr.as_u32()?),
            ACTION_ATTR_USERSPACE => {
                let attrs = attr.as_nested()?;
                let pid = attrs
                    .get(USERSPACE_ATTR_PID)
                    .ok_or(KeyError::InvalidAction { kind, reason: "missing pid" })?
                    .as_u32()?;
                let userdata = attrs.get(USERSPACE_ATTR_USERDATA).map(Attr::payload).transpose()?;
                Self::Userspace { pid, userdata }
            }
            ACTION_ATTR_SET => {
                let attrs = attr.as_nested()?;
                let mut iter = attrs.iter();
                match (iter.next(), iter.next()) {
                    (Some(key), None) => Self::Set(FlowKey::decode(key)?),
                    _ => {
                        return Err(KeyError::InvalidAction { kind, reason: "expected exactly one key" })
                    }
                }
            }
            ACTION_ATTR_PUSH_VLAN => {
                let b = attr.fixed::<4>()?;
                Self::PushVlan {
                    tpid: u16::from_be_bytes([b[0], b[1]]),
                    tci: u16::from_be_bytes([b[2], b[3]]),
                }
            }
            ACTION_ATTR_POP_VLAN => {
                attr.fixed::<0>()?;
                Self::PopVlan
            }
            kind => Self::Opaque { kind, value: attr.payload()? },
        };

        Ok(action)
    }
}

/// Encodes actions in the order given; the kernel applies them in sequence.
pub fn encode_actions(actions: &[Action]) -> Attrs {
    actions.iter().map(Action::encode).collect()
}

pub fn decode_actions(attrs: &Attrs) -> Result<Vec<Action>, KeyError> {
    attrs.iter().map(Action::decode).collect()
}
