use std::collections::HashMap;

use futures::{stream::BoxStream, TryStreamExt};

use dpif_wire::{
    attr::Attrs,
    netlink::flags,
    ovs::{DatapathStats, OvsHeader, CMD_DEL, CMD_GET, CMD_NEW, DP_ATTR_NAME, DP_ATTR_STATS, DP_ATTR_UPCALL_PID},
};

use crate::{Connection, Error, FamilyKind, KernelError};

/// A handle to a datapath in the kernel.
///
/// The handle is a snapshot: it is not invalidated when the datapath is
/// deleted elsewhere, operations on it then fail with
/// [`KernelError::NoSuchDatapath`].
#[derive(Clone)]
pub struct Datapath<'a> {
    conn: &'a Connection,
    name: String,
    index: u32,
    stats: Option<DatapathStats>,
}

impl std::fmt::Debug for Datapath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datapath")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'a> Datapath<'a> {
    fn decode(conn: &'a Connection, header: OvsHeader, attrs: Attrs) -> Result<Self, Error> {
        let name = attrs.get(DP_ATTR_NAME).ok_or(Error::Malformed("datapath without a name"))?.as_str()?;
        let stats = attrs.get(DP_ATTR_STATS).map(DatapathStats::decode).transpose()?;

        Ok(Self { conn, name, index: header.dp_ifindex, stats })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ifindex of the datapath's local port.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Lookup and flow counters, as of when the handle was obtained.
    pub fn stats(&self) -> Option<&DatapathStats> {
        self.stats.as_ref()
    }

    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    /// Deletes the datapath, together with its vports and flows.
    pub async fn delete(self) -> Result<(), Error> {
        self.conn.delete_datapath(&self).await
    }

    /// Identifies the datapath in a request: by index, or by name if the
    /// index is unknown.
    pub(crate) fn target(&self) -> (u32, Attrs) {
        let mut attrs = Attrs::new();
        if self.index == 0 {
            attrs.push_str(DP_ATTR_NAME, &self.name);
        }
        (self.index, attrs)
    }
}

impl Connection {
    /// Creates a datapath. Fails with [`KernelError::AlreadyExists`] if the
    /// name is taken.
    pub async fn create_datapath(&self, name: &str) -> Result<Datapath<'_>, Error> {
        let mut attrs = Attrs::new();
        attrs.push_str(DP_ATTR_NAME, name).push_u32(DP_ATTR_UPCALL_PID, self.upcall_pid());

        let (header, attrs) = self
            .request_entity(
                FamilyKind::Datapath,
                CMD_NEW,
                flags::ECHO | flags::CREATE | flags::EXCL,
                0,
                &attrs,
            )
            .await?;

        let dp = Datapath::decode(self, header, attrs)?;
        tracing::debug!(datapath = %dp.name, index = dp.index, "Created datapath");
        Ok(dp)
    }

    /// Looks up a datapath by name. Returns `None` if there is none.
    pub async fn lookup_datapath(&self, name: &str) -> Result<Option<Datapath<'_>>, Error> {
        let mut attrs = Attrs::new();
        attrs.push_str(DP_ATTR_NAME, name);

        match self.request_entity(FamilyKind::Datapath, CMD_GET, 0, 0, &attrs).await {
            Ok((header, attrs)) => Datapath::decode(self, header, attrs).map(Some),
            Err(e) if e.kernel() == Some(KernelError::NoSuchDatapath) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_datapath(&self, dp: &Datapath<'_>) -> Result<(), Error> {
        let (index, attrs) = dp.target();
        self.request(FamilyKind::Datapath, CMD_DEL, flags::ACK, index, &attrs).await?;

        tracing::debug!(datapath = %dp.name, "Deleted datapath");
        Ok(())
    }

    /// Streams every datapath in the kernel.
    pub async fn dump_datapaths(&self) -> Result<BoxStream<'_, Result<Datapath<'_>, Error>>, Error> {
        self.dump_entities(FamilyKind::Datapath, 0, Datapath::decode).await
    }

    /// Collects every datapath by name.
    pub async fn enumerate_datapaths(&self) -> Result<HashMap<String, Datapath<'_>>, Error> {
        self.dump_datapaths().await?.map_ok(|dp| (dp.name.clone(), dp)).try_collect().await
    }
}
