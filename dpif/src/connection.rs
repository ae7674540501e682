use futures::{stream::BoxStream, StreamExt};

use dpif_socket::{family, FamilyTable, ResolveError, Session, SessionError, SessionOptions, SessionStats};
use dpif_transport::Transport;
use dpif_wire::{
    attr::Attrs,
    ovs::{
        decode_body, encode_body, OvsHeader, CMD_GET, DATAPATH_FAMILY, DATAPATH_VERSION, FLOW_FAMILY, FLOW_VERSION,
        VPORT_FAMILY, VPORT_VERSION,
    },
    GenlHeader, Message,
};

use crate::{Error, FamilyKind};

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub session: SessionOptions,
    /// Netlink port that new datapaths and vports send upcalls to. 0 disables upcalls.
    pub upcall_pid: u32,
    pub datapath_family: String,
    pub vport_family: String,
    pub flow_family: String,
}

impl ConnectionOptions {
    pub fn with_session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    pub fn with_upcall_pid(mut self, pid: u32) -> Self {
        self.upcall_pid = pid;
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            upcall_pid: 0,
            datapath_family: DATAPATH_FAMILY.to_string(),
            vport_family: VPORT_FAMILY.to_string(),
            flow_family: FLOW_FAMILY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Family {
    id: u16,
    version: u8,
}

/// A connection to the kernel datapath.
///
/// Every family it needs is resolved when it is opened, so a kernel without
/// the datapath module fails here rather than on first use. Entity handles
/// borrow the connection and cannot outlive it.
#[derive(Debug)]
pub struct Connection {
    session: Session,
    families: FamilyTable,
    datapath: Family,
    vport: Family,
    flow: Family,
    upcall_pid: u32,
}

impl Connection {
    /// Opens a connection with the default options.
    pub async fn open<T: Transport>(transport: &T) -> Result<Self, Error> {
        Self::open_with_options(transport, ConnectionOptions::default()).await
    }

    pub async fn open_with_options<T: Transport>(transport: &T, options: ConnectionOptions) -> Result<Self, Error> {
        let session = Session::open_with_options(transport, options.session.clone()).await.map_err(Error::Session)?;

        let names = [options.datapath_family.as_str(), options.vport_family.as_str(), options.flow_family.as_str()];
        let families = match family::resolve_all(&session, names).await {
            Ok(families) => families,
            Err(e) => {
                session.close().await;
                return Err(e.into());
            }
        };

        let family = |name: &str, version: u8| {
            families
                .id(name)
                .map(|id| Family { id, version })
                .ok_or_else(|| ResolveError::NoSuchFamily(name.to_string()))
        };
        let datapath = family(&options.datapath_family, DATAPATH_VERSION)?;
        let vport = family(&options.vport_family, VPORT_VERSION)?;
        let flow = family(&options.flow_family, FLOW_VERSION)?;

        tracing::debug!(datapath = datapath.id, vport = vport.id, flow = flow.id, "Connection opened");

        Ok(Self { session, families, datapath, vport, flow, upcall_pid: options.upcall_pid })
    }

    /// Closes the connection. Requests still in flight on other tasks fail
    /// with [`SessionError::Closed`].
    pub async fn close(self) {
        self.session.close().await;
        tracing::debug!("Connection closed");
    }

    /// The families resolved when the connection was opened.
    pub fn families(&self) -> &FamilyTable {
        &self.families
    }

    pub fn stats(&self) -> &SessionStats {
        self.session.stats()
    }

    pub(crate) fn upcall_pid(&self) -> u32 {
        self.upcall_pid
    }

    fn family(&self, kind: FamilyKind) -> Family {
        match kind {
            FamilyKind::Datapath => self.datapath,
            FamilyKind::Vport => self.vport,
            FamilyKind::Flow => self.flow,
        }
    }

    fn message(&self, kind: FamilyKind, cmd: u8, flags: u16, dp_ifindex: u32, attrs: &Attrs) -> Result<Message, Error> {
        let family = self.family(kind);
        let body = encode_body(OvsHeader { dp_ifindex }, attrs)?;

        Ok(Message::genl(family.id, flags, GenlHeader { cmd, version: family.version }, body))
    }

    /// Sends a request to `kind` and decodes its reply, if the kernel sent one.
    pub(crate) async fn request(
        &self,
        kind: FamilyKind,
        cmd: u8,
        flags: u16,
        dp_ifindex: u32,
        attrs: &Attrs,
    ) -> Result<Option<(OvsHeader, Attrs)>, Error> {
        let msg = self.message(kind, cmd, flags, dp_ifindex, attrs)?;
        let reply = self.session.request(msg).await.map_err(|e| Error::from_session(kind, e))?;

        reply.map(decode_reply).transpose()
    }

    /// Like [`Connection::request`], for requests that must be answered with an entity.
    pub(crate) async fn request_entity(
        &self,
        kind: FamilyKind,
        cmd: u8,
        flags: u16,
        dp_ifindex: u32,
        attrs: &Attrs,
    ) -> Result<(OvsHeader, Attrs), Error> {
        self.request(kind, cmd, flags, dp_ifindex, attrs).await?.ok_or(Error::Session(SessionError::MissingReply))
    }

    /// Starts a dump of `kind` scoped to `dp_ifindex`, 0 for every datapath.
    pub(crate) async fn dump(
        &self,
        kind: FamilyKind,
        dp_ifindex: u32,
    ) -> Result<BoxStream<'static, Result<(OvsHeader, Attrs), Error>>, Error> {
        let msg = self.message(kind, CMD_GET, 0, dp_ifindex, &Attrs::new())?;
        let dump = self.session.send_dump(msg).await.map_err(|e| Error::from_session(kind, e))?;

        Ok(dump.map(move |msg| msg.map_err(|e| Error::from_session(kind, e)).and_then(decode_reply)).boxed())
    }

    /// Starts a dump and decodes every entity with `decode`.
    pub(crate) async fn dump_entities<'a, T, F>(
        &'a self,
        kind: FamilyKind,
        dp_ifindex: u32,
        decode: F,
    ) -> Result<BoxStream<'a, Result<T, Error>>, Error>
    where
        T: Send + 'a,
        F: Fn(&'a Connection, OvsHeader, Attrs) -> Result<T, Error> + Send + 'a,
    {
        let dump = self.dump(kind, dp_ifindex).await?;

        Ok(dump.map(move |entity| entity.and_then(|(header, attrs)| decode(self, header, attrs))).boxed())
    }
}

fn decode_reply(msg: Message) -> Result<(OvsHeader, Attrs), Error> {
    let (_, body) = msg.genl_body().ok_or(Error::Malformed("reply without a generic header"))?;

    Ok(decode_body(body.clone())?)
}
