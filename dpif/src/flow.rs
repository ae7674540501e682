use futures::{stream::BoxStream, TryStreamExt};

use dpif_wire::{
    action::{decode_actions, encode_actions},
    attr::Attrs,
    key::FlowKeys,
    netlink::flags,
    ovs::{
        FlowStats, OvsHeader, CMD_DEL, CMD_NEW, FLOW_ATTR_ACTIONS, FLOW_ATTR_KEY, FLOW_ATTR_STATS, FLOW_ATTR_TCP_FLAGS,
        FLOW_ATTR_USED,
    },
    Action, FlowKey, KeyError,
};

use crate::{Connection, Datapath, Error, FamilyKind};

/// A flow: the keys a packet must match and the actions applied to it.
///
/// A flow has no name; its identity is its key set. Flows returned by the
/// kernel also carry their counters.
#[derive(Debug, Clone, Default)]
pub struct FlowSpec {
    keys: FlowKeys,
    actions: Vec<Action>,
    stats: Option<FlowStats>,
    used: Option<u64>,
    tcp_flags: Option<u16>,
}

impl FlowSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a match key. Fails if a key of the same type is already present.
    pub fn add_key(&mut self, key: FlowKey) -> Result<&mut Self, KeyError> {
        self.keys.insert(key)?;
        Ok(self)
    }

    pub fn with_key(mut self, key: FlowKey) -> Result<Self, KeyError> {
        self.keys.insert(key)?;
        Ok(self)
    }

    /// Appends an action. Actions are applied in the order they were added.
    pub fn add_action(&mut self, action: Action) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn keys(&self) -> &FlowKeys {
        &self.keys
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Packet and byte counters, present once the flow has matched traffic.
    pub fn stats(&self) -> Option<&FlowStats> {
        self.stats.as_ref()
    }

    /// Milliseconds since boot at which the flow last matched a packet.
    pub fn used(&self) -> Option<u64> {
        self.used
    }

    /// Union of the TCP flags seen on packets matching the flow.
    pub fn tcp_flags(&self) -> Option<u16> {
        self.tcp_flags
    }

    /// Returns true if both flows match on the same keys. Actions and
    /// counters are not compared.
    pub fn equals(&self, other: &FlowSpec) -> bool {
        self.keys == other.keys
    }

    fn decode(_: &Connection, _: OvsHeader, attrs: Attrs) -> Result<Self, Error> {
        let keys = attrs.get(FLOW_ATTR_KEY).ok_or(Error::Malformed("flow without keys"))?.as_nested()?;
        let actions = match attrs.get(FLOW_ATTR_ACTIONS) {
            Some(attr) => decode_actions(&attr.as_nested()?)?,
            None => Vec::new(),
        };

        Ok(Self {
            keys: FlowKeys::decode(&keys)?,
            actions,
            stats: attrs.get(FLOW_ATTR_STATS).map(FlowStats::decode).transpose()?,
            used: attrs.get(FLOW_ATTR_USED).map(|attr| attr.as_u64()).transpose()?,
            tcp_flags: attrs.get(FLOW_ATTR_TCP_FLAGS).map(|attr| attr.as_be16()).transpose()?,
        })
    }

    fn key_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.push_nested(FLOW_ATTR_KEY, self.keys.encode());
        attrs
    }
}

impl<'a> Datapath<'a> {
    /// Installs a flow. Fails with [`KernelError::AlreadyExists`](crate::KernelError::AlreadyExists)
    /// if a flow with the same keys is installed.
    pub async fn create_flow(&self, flow: &FlowSpec) -> Result<(), Error> {
        let mut attrs = flow.key_attrs();
        attrs.push_nested(FLOW_ATTR_ACTIONS, encode_actions(&flow.actions));

        self.connection()
            .request(FamilyKind::Flow, CMD_NEW, flags::ACK | flags::CREATE | flags::EXCL, self.index(), &attrs)
            .await?;

        tracing::trace!(datapath = %self.name(), keys = flow.keys.len(), "Created flow");
        Ok(())
    }

    /// Removes the flow with the same keys as `flow`.
    pub async fn delete_flow(&self, flow: &FlowSpec) -> Result<(), Error> {
        self.connection().request(FamilyKind::Flow, CMD_DEL, flags::ACK, self.index(), &flow.key_attrs()).await?;

        tracing::trace!(datapath = %self.name(), keys = flow.keys.len(), "Deleted flow");
        Ok(())
    }

    /// Removes every flow of this datapath.
    pub async fn flush_flows(&self) -> Result<(), Error> {
        self.connection().request(FamilyKind::Flow, CMD_DEL, flags::ACK, self.index(), &Attrs::new()).await?;

        tracing::debug!(datapath = %self.name(), "Flushed flows");
        Ok(())
    }

    /// Streams the flows of this datapath.
    pub async fn dump_flows(&self) -> Result<BoxStream<'a, Result<FlowSpec, Error>>, Error> {
        self.connection().dump_entities(FamilyKind::Flow, self.index(), FlowSpec::decode).await
    }

    /// Collects the flows of this datapath.
    pub async fn enumerate_flows(&self) -> Result<Vec<FlowSpec>, Error> {
        self.dump_flows().await?.try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use dpif_wire::key::{PortsKey, KEY_ATTR_IN_PORT};

    use super::*;

    #[test]
    fn test_equality_ignores_key_order_and_actions() {
        let mut a = FlowSpec::new();
        a.add_key(FlowKey::InPort(1))
            .unwrap()
            .add_key(FlowKey::ethernet([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1]))
            .unwrap()
            .add_action(Action::Output(2));

        let b = FlowSpec::new()
            .with_key(FlowKey::ethernet([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1]))
            .unwrap()
            .with_key(FlowKey::InPort(1))
            .unwrap();

        assert!(a.equals(&b));
        assert!(!a.equals(&b.clone().with_key(FlowKey::Tcp(PortsKey { src: 1, dst: 2 })).unwrap()));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut flow = FlowSpec::new();
        flow.add_key(FlowKey::InPort(1)).unwrap();

        assert_eq!(flow.add_key(FlowKey::InPort(2)).unwrap_err(), KeyError::Duplicate(KEY_ATTR_IN_PORT));
        assert_eq!(flow.keys().len(), 1);
    }
}
