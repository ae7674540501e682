use std::collections::HashMap;

use futures::{stream::BoxStream, TryStreamExt};

use dpif_wire::{
    attr::Attrs,
    netlink::flags,
    ovs::{
        OvsHeader, VportStats, CMD_DEL, CMD_GET, CMD_NEW, TUNNEL_ATTR_DST_PORT, VPORT_ATTR_NAME, VPORT_ATTR_OPTIONS,
        VPORT_ATTR_PORT_NO, VPORT_ATTR_STATS, VPORT_ATTR_TYPE, VPORT_ATTR_UPCALL_PID, VPORT_TYPE_GENEVE, VPORT_TYPE_GRE,
        VPORT_TYPE_INTERNAL, VPORT_TYPE_NETDEV, VPORT_TYPE_VXLAN,
    },
};

use crate::{Connection, Datapath, Error, FamilyKind, KernelError};

/// What backs a vport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VportSpec {
    /// An existing network device of the same name.
    Netdev,
    /// A virtual device created with the vport.
    Internal,
    Gre,
    Vxlan { dst_port: u16 },
    Geneve { dst_port: u16 },
    /// A type this library does not know, kept as received.
    Unknown { kind: u32, options: Option<Attrs> },
}

impl VportSpec {
    pub fn kind(&self) -> u32 {
        match self {
            Self::Netdev => VPORT_TYPE_NETDEV,
            Self::Internal => VPORT_TYPE_INTERNAL,
            Self::Gre => VPORT_TYPE_GRE,
            Self::Vxlan { .. } => VPORT_TYPE_VXLAN,
            Self::Geneve { .. } => VPORT_TYPE_GENEVE,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    fn options(&self) -> Option<Attrs> {
        match self {
            Self::Vxlan { dst_port } | Self::Geneve { dst_port } => {
                let mut options = Attrs::new();
                options.push_u16(TUNNEL_ATTR_DST_PORT, *dst_port);
                Some(options)
            }
            Self::Unknown { options, .. } => options.clone(),
            _ => None,
        }
    }

    fn decode(kind: u32, options: Option<Attrs>) -> Result<Self, Error> {
        let dst_port = || -> Result<u16, Error> {
            let port = options
                .as_ref()
                .and_then(|options| options.get(TUNNEL_ATTR_DST_PORT))
                .ok_or(Error::Malformed("tunnel vport without a destination port"))?;
            Ok(port.as_u16()?)
        };

        Ok(match kind {
            VPORT_TYPE_NETDEV => Self::Netdev,
            VPORT_TYPE_INTERNAL => Self::Internal,
            VPORT_TYPE_GRE => Self::Gre,
            VPORT_TYPE_VXLAN => Self::Vxlan { dst_port: dst_port()? },
            VPORT_TYPE_GENEVE => Self::Geneve { dst_port: dst_port()? },
            kind => Self::Unknown { kind, options },
        })
    }
}

/// A handle to a vport of a datapath.
#[derive(Clone)]
pub struct Vport<'a> {
    conn: &'a Connection,
    name: String,
    port_no: u32,
    dp_index: u32,
    spec: VportSpec,
    upcall_pid: Option<u32>,
    stats: Option<VportStats>,
}

impl std::fmt::Debug for Vport<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vport")
            .field("name", &self.name)
            .field("port_no", &self.port_no)
            .field("dp_index", &self.dp_index)
            .field("spec", &self.spec)
            .finish()
    }
}

impl<'a> Vport<'a> {
    fn decode(conn: &'a Connection, header: OvsHeader, attrs: Attrs) -> Result<Self, Error> {
        let name = attrs.get(VPORT_ATTR_NAME).ok_or(Error::Malformed("vport without a name"))?.as_str()?;
        let port_no = attrs.get(VPORT_ATTR_PORT_NO).ok_or(Error::Malformed("vport without a port number"))?.as_u32()?;
        let kind = attrs.get(VPORT_ATTR_TYPE).ok_or(Error::Malformed("vport without a type"))?.as_u32()?;
        let options = attrs.get(VPORT_ATTR_OPTIONS).map(|attr| attr.as_nested()).transpose()?;
        let upcall_pid = attrs.get(VPORT_ATTR_UPCALL_PID).map(|attr| attr.as_u32()).transpose()?;
        let stats = attrs.get(VPORT_ATTR_STATS).map(VportStats::decode).transpose()?;

        Ok(Self {
            conn,
            name,
            port_no,
            dp_index: header.dp_ifindex,
            spec: VportSpec::decode(kind, options)?,
            upcall_pid,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_no(&self) -> u32 {
        self.port_no
    }

    /// Index of the datapath the vport belongs to.
    pub fn dp_index(&self) -> u32 {
        self.dp_index
    }

    pub fn spec(&self) -> &VportSpec {
        &self.spec
    }

    pub fn upcall_pid(&self) -> Option<u32> {
        self.upcall_pid
    }

    pub fn stats(&self) -> Option<&VportStats> {
        self.stats.as_ref()
    }

    pub async fn delete(self) -> Result<(), Error> {
        self.remove(self.conn).await
    }

    /// Deletes the vport by port number, so a rename since the lookup does
    /// not redirect the delete to another vport.
    async fn remove(&self, conn: &Connection) -> Result<(), Error> {
        let mut attrs = Attrs::new();
        attrs.push_u32(VPORT_ATTR_PORT_NO, self.port_no);
        conn.request(FamilyKind::Vport, CMD_DEL, flags::ACK, self.dp_index, &attrs).await?;

        tracing::debug!(vport = %self.name, port_no = self.port_no, dp_index = self.dp_index, "Deleted vport");
        Ok(())
    }
}

impl<'a> Datapath<'a> {
    /// Attaches a new vport to the datapath.
    pub async fn create_vport(&self, name: &str, spec: VportSpec) -> Result<Vport<'a>, Error> {
        let conn = self.connection();

        let mut attrs = Attrs::new();
        attrs
            .push_str(VPORT_ATTR_NAME, name)
            .push_u32(VPORT_ATTR_TYPE, spec.kind())
            .push_u32(VPORT_ATTR_UPCALL_PID, conn.upcall_pid());
        if let Some(options) = spec.options() {
            attrs.push_nested(VPORT_ATTR_OPTIONS, options);
        }

        let (header, attrs) = conn
            .request_entity(FamilyKind::Vport, CMD_NEW, flags::ECHO | flags::CREATE | flags::EXCL, self.index(), &attrs)
            .await?;

        let vport = Vport::decode(conn, header, attrs)?;
        tracing::debug!(vport = %vport.name, port_no = vport.port_no, datapath = %self.name(), "Created vport");
        Ok(vport)
    }

    /// Looks up a vport of this datapath by name. Returns `None` if there is none.
    pub async fn lookup_vport(&self, name: &str) -> Result<Option<Vport<'a>>, Error> {
        let mut attrs = Attrs::new();
        attrs.push_str(VPORT_ATTR_NAME, name);
        self.get_vport(attrs).await
    }

    /// Looks up a vport of this datapath by port number.
    pub async fn lookup_vport_by_port(&self, port_no: u32) -> Result<Option<Vport<'a>>, Error> {
        let mut attrs = Attrs::new();
        attrs.push_u32(VPORT_ATTR_PORT_NO, port_no);
        self.get_vport(attrs).await
    }

    async fn get_vport(&self, attrs: Attrs) -> Result<Option<Vport<'a>>, Error> {
        let conn = self.connection();
        match conn.request_entity(FamilyKind::Vport, CMD_GET, 0, self.index(), &attrs).await {
            Ok((header, attrs)) => Vport::decode(conn, header, attrs).map(Some),
            Err(e) if e.kernel() == Some(KernelError::NoSuchVport) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes a vport. The request is addressed to the datapath the vport
    /// was read from.
    pub async fn delete_vport(&self, vport: &Vport<'_>) -> Result<(), Error> {
        vport.remove(self.connection()).await
    }

    /// Streams the vports of this datapath.
    pub async fn dump_vports(&self) -> Result<BoxStream<'a, Result<Vport<'a>, Error>>, Error> {
        self.connection().dump_entities(FamilyKind::Vport, self.index(), Vport::decode).await
    }

    /// Collects the vports of this datapath by name.
    pub async fn enumerate_vports(&self) -> Result<HashMap<String, Vport<'a>>, Error> {
        self.dump_vports().await?.map_ok(|vport| (vport.name.clone(), vport)).try_collect().await
    }
}
