//! Resolution of generic netlink family names to the ids the kernel assigned
//! them at module load time.

use std::collections::HashMap;

use futures::future::try_join_all;
use thiserror::Error;

use dpif_wire::{
    attr::{Attrs, CodecError},
    ctrl::{FamilyInfo, CTRL_CMD_GETFAMILY, CTRL_VERSION, GENL_ID_CTRL},
    netlink::flags,
    GenlHeader, Message,
};

use crate::{Session, SessionError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No such generic netlink family: {0}")]
    NoSuchFamily(String),
    #[error("Reply for family {family} is missing {attr}")]
    MissingAttribute { family: String, attr: &'static str },
    #[error("Malformed reply for family {family}: {source}")]
    Codec { family: String, source: CodecError },
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// The families resolved for a connection. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct FamilyTable {
    families: HashMap<String, FamilyInfo>,
}

impl FamilyTable {
    pub fn get(&self, name: &str) -> Option<&FamilyInfo> {
        self.families.get(name)
    }

    /// Returns the id of the family called `name`.
    pub fn id(&self, name: &str) -> Option<u16> {
        self.get(name).map(|family| family.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FamilyInfo> {
        self.families.values()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}

impl FromIterator<FamilyInfo> for FamilyTable {
    fn from_iter<I: IntoIterator<Item = FamilyInfo>>(iter: I) -> Self {
        Self { families: iter.into_iter().map(|family| (family.name.clone(), family)).collect() }
    }
}

/// Looks up a single family through the generic netlink controller.
pub async fn resolve(session: &Session, name: &str) -> Result<FamilyInfo, ResolveError> {
    let codec_err = |source| ResolveError::Codec { family: name.to_string(), source };

    let body = FamilyInfo::request(name).to_bytes().map_err(codec_err)?;
    let request = Message::genl(
        GENL_ID_CTRL,
        flags::REQUEST,
        GenlHeader { cmd: CTRL_CMD_GETFAMILY, version: CTRL_VERSION },
        body,
    );

    let reply = match session.request_reply(request).await {
        Ok(reply) => reply,
        Err(SessionError::Kernel(libc::ENOENT)) => return Err(ResolveError::NoSuchFamily(name.to_string())),
        Err(e) => return Err(e.into()),
    };

    let missing = |attr| ResolveError::MissingAttribute { family: name.to_string(), attr };

    let (_, body) = reply.genl_body().ok_or_else(|| missing("generic header"))?;
    let attrs = Attrs::decode(body.clone()).map_err(codec_err)?;
    let mut info = FamilyInfo::decode(&attrs).map_err(codec_err)?.ok_or_else(|| missing("CTRL_ATTR_FAMILY_ID"))?;

    if info.name.is_empty() {
        info.name = name.to_string();
    }

    tracing::debug!(family = name, id = info.id, version = info.version, "Resolved family");
    Ok(info)
}

/// Resolves every family in `names` concurrently. Fails on the first family
/// that cannot be resolved.
pub async fn resolve_all<'a>(
    session: &Session,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<FamilyTable, ResolveError> {
    let families = try_join_all(names.into_iter().map(|name| resolve(session, name))).await?;

    Ok(families.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use dpif_common::{datagram_channel, DatagramChannel};
    use dpif_wire::{
        ctrl::{McastGroup, CTRL_ATTR_FAMILY_NAME, CTRL_CMD_NEWFAMILY},
        netlink::Codec,
    };

    use super::*;
    use crate::SessionOptions;

    /// Answers controller requests for the families in `known`.
    async fn serve_ctrl(mut peer: DatagramChannel, known: Vec<FamilyInfo>) {
        let mut codec = Codec::new();
        while let Some(datagram) = peer.recv().await {
            let request = codec.decode(&mut BytesMut::from(datagram.as_ref())).unwrap().unwrap();
            let (_, body) = request.genl_body().unwrap();
            let attrs = Attrs::decode(body.clone()).unwrap();
            let name = attrs.get(CTRL_ATTR_FAMILY_NAME).unwrap().as_str().unwrap();

            let reply = match known.iter().find(|family| family.name == name) {
                Some(family) => {
                    let mut reply = Message::genl(
                        GENL_ID_CTRL,
                        0,
                        GenlHeader { cmd: CTRL_CMD_NEWFAMILY, version: CTRL_VERSION },
                        family.encode().to_bytes().unwrap(),
                    );
                    reply.set_seq(request.seq());
                    reply
                }
                None => Message::error(*request.header(), -libc::ENOENT),
            };

            let mut buf = BytesMut::new();
            codec.encode(reply, &mut buf).unwrap();
            peer.send(buf.freeze()).await.unwrap();
        }
    }

    fn family(name: &str, id: u16) -> FamilyInfo {
        FamilyInfo {
            name: name.to_string(),
            id,
            version: 1,
            hdr_size: 4,
            max_attr: 8,
            mcast_groups: vec![McastGroup { name: name.to_string(), id: id as u32 + 100 }],
        }
    }

    fn session(known: Vec<FamilyInfo>) -> Session {
        let _ = tracing_subscriber::fmt::try_init();

        let (local, peer) = datagram_channel(16);
        tokio::spawn(serve_ctrl(peer, known));
        Session::new(local, SessionOptions::default())
    }

    #[tokio::test]
    async fn test_resolve_all() {
        let session = session(vec![family("ovs_datapath", 0x1a), family("ovs_vport", 0x1b)]);

        let table = resolve_all(&session, ["ovs_datapath", "ovs_vport"]).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.id("ovs_vport"), Some(0x1b));
        assert_eq!(table.get("ovs_datapath").unwrap().mcast_group("ovs_datapath"), Some(0x1a + 100));
        assert_eq!(table.id("ovs_flow"), None);
    }

    #[tokio::test]
    async fn test_unknown_family() {
        let session = session(vec![family("ovs_datapath", 0x1a)]);

        let err = resolve_all(&session, ["ovs_datapath", "ovs_flow"]).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoSuchFamily(name) if name == "ovs_flow"));
    }
}
