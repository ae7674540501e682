//! The generic netlink controller family, used to look up other families.

use crate::attr::{Attrs, CodecError};

/// Fixed id of the controller family.
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_VERSION: u8 = 2;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_GETFAMILY: u8 = 3;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_VERSION: u16 = 3;
pub const CTRL_ATTR_HDRSIZE: u16 = 4;
pub const CTRL_ATTR_MAXATTR: u16 = 5;
pub const CTRL_ATTR_OPS: u16 = 6;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;

pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// A multicast group registered by a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastGroup {
    pub name: String,
    pub id: u32,
}

/// The description of a family, as returned by `CTRL_CMD_GETFAMILY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyInfo {
    pub name: String,
    pub id: u16,
    pub version: u32,
    pub hdr_size: u32,
    pub max_attr: u32,
    pub mcast_groups: Vec<McastGroup>,
}

impl FamilyInfo {
    /// Builds the attributes of a `CTRL_CMD_GETFAMILY` request for `name`.
    pub fn request(name: &str) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.push_str(CTRL_ATTR_FAMILY_NAME, name);
        attrs
    }

    /// Decodes a `CTRL_CMD_NEWFAMILY` reply. Returns `Ok(None)` when the reply
    /// carries no family id.
    pub fn decode(attrs: &Attrs) -> Result<Option<Self>, CodecError> {
        let Some(id) = attrs.get(CTRL_ATTR_FAMILY_ID) else {
            return Ok(None);
        };

        let mut info = Self {
            name: String::new(),
            id: id.as_u16()?,
            version: 0,
            hdr_size: 0,
            max_attr: 0,
            mcast_groups: Vec::new(),
        };

        for attr in attrs {
            match attr.kind() {
                CTRL_ATTR_FAMILY_NAME => info.name = attr.as_str()?,
                CTRL_ATTR_VERSION => info.version = attr.as_u32()?,
                CTRL_ATTR_HDRSIZE => info.hdr_size = attr.as_u32()?,
                CTRL_ATTR_MAXATTR => info.max_attr = attr.as_u32()?,
                CTRL_ATTR_MCAST_GROUPS => {
                    // An array: each entry is a nested attribute indexed from 1
                    for entry in &attr.as_nested()? {
                        let group = entry.as_nested()?;
                        let (Some(name), Some(id)) =
                            (group.get(CTRL_ATTR_MCAST_GRP_NAME), group.get(CTRL_ATTR_MCAST_GRP_ID))
                        else {
                            continue;
                        };
                        info.mcast_groups.push(McastGroup { name: name.as_str()?, id: id.as_u32()? });
                    }
                }
                _ => {}
            }
        }

        Ok(Some(info))
    }

    /// Returns the id of the multicast group called `name`.
    pub fn mcast_group(&self, name: &str) -> Option<u32> {
        self.mcast_groups.iter().find(|group| group.name == name).map(|group| group.id)
    }

    pub fn encode(&self) -> Attrs {
        let mut groups = Attrs::new();
        for (i, group) in self.mcast_groups.iter().enumerate() {
            let mut entry = Attrs::new();
            entry.push_u32(CTRL_ATTR_MCAST_GRP_ID, group.id).push_str(CTRL_ATTR_MCAST_GRP_NAME, &group.name);
            groups.push_nested(i as u16 + 1, entry);
        }

        let mut attrs = Attrs::new();
        attrs
            .push_str(CTRL_ATTR_FAMILY_NAME, &self.name)
            .push_u16(CTRL_ATTR_FAMILY_ID, self.id)
            .push_u32(CTRL_ATTR_VERSION, self.version)
            .push_u32(CTRL_ATTR_HDRSIZE, self.hdr_size)
            .push_u32(CTRL_ATTR_MAXATTR, self.max_attr);
        if !groups.is_empty() {
            attrs.push_nested(CTRL_ATTR_MCAST_GROUPS, groups);
        }
        attrs
    }
}
