//! Simulated kernel state and request handling.
//!
//! Handlers return either the entity messages of the reply or a positive
//! errno, which is sent back the way the kernel reports failures.

use std::{collections::BTreeMap, time::Instant};

use bytes::Bytes;

use dpif_wire::{
    action::decode_actions,
    attr::Attrs,
    ctrl::{FamilyInfo, McastGroup, CTRL_ATTR_FAMILY_NAME, CTRL_CMD_GETFAMILY, CTRL_CMD_NEWFAMILY, CTRL_VERSION, GENL_ID_CTRL},
    key::{decode_keys, FlowKeys},
    netlink::{flags, Header},
    ovs::*,
    GenlHeader, Message,
};

type Errno = i32;

/// First id handed out to registered families.
const FAMILY_ID_BASE: u16 = 0x1c;
const MCAST_GROUP_BASE: u32 = 10;
/// First ifindex assigned to a datapath.
const IFINDEX_BASE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyKind {
    Datapath,
    Vport,
    Flow,
    Other,
}

#[derive(Debug)]
struct Family {
    kind: FamilyKind,
    info: FamilyInfo,
}

#[derive(Debug)]
struct DatapathEntry {
    name: String,
    ifindex: u32,
    upcall_pid: u32,
    hit: u64,
    vports: BTreeMap<u32, VportEntry>,
    flows: Vec<FlowEntry>,
}

#[derive(Debug)]
struct VportEntry {
    name: String,
    port_no: u32,
    kind: u32,
    options: Option<Attrs>,
    upcall_pid: u32,
}

#[derive(Debug)]
struct FlowEntry {
    keys: FlowKeys,
    actions: Attrs,
    stats: FlowStats,
    used: u64,
}

/// What to send back for a request.
pub(crate) enum Outcome {
    /// Messages sent together in one datagram. Empty when nothing is sent.
    Reply(Vec<Message>),
    /// The data messages of a dump. Framing and the terminator are added when
    /// the dump is sent.
    Dump { seq: u32, messages: Vec<Message> },
}

#[derive(Debug)]
pub(crate) struct Kernel {
    families: Vec<Family>,
    datapaths: BTreeMap<u32, DatapathEntry>,
    next_ifindex: u32,
    started: Instant,
}

impl Kernel {
    pub(crate) fn new(names: &[String]) -> Self {
        let families = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let (kind, version, max_attr) = match name.as_str() {
                    DATAPATH_FAMILY => (FamilyKind::Datapath, DATAPATH_VERSION, DP_ATTR_USER_FEATURES),
                    VPORT_FAMILY => (FamilyKind::Vport, VPORT_VERSION, VPORT_ATTR_STATS),
                    FLOW_FAMILY => (FamilyKind::Flow, FLOW_VERSION, FLOW_ATTR_MASK),
                    _ => (FamilyKind::Other, 1, 0),
                };

                Family {
                    kind,
                    info: FamilyInfo {
                        name: name.clone(),
                        id: FAMILY_ID_BASE + i as u16,
                        version: version as u32,
                        hdr_size: OVS_HEADER_LEN as u32,
                        max_attr: max_attr as u32,
                        mcast_groups: vec![McastGroup { name: name.clone(), id: MCAST_GROUP_BASE + i as u32 }],
                    },
                }
            })
            .collect();

        Self { families, datapaths: BTreeMap::new(), next_ifindex: IFINDEX_BASE, started: Instant::now() }
    }

    pub(crate) fn datapath_names(&self) -> Vec<String> {
        self.datapaths.values().map(|dp| dp.name.clone()).collect()
    }

    pub(crate) fn flow_count(&self, name: &str) -> Option<usize> {
        self.datapaths.values().find(|dp| dp.name == name).map(|dp| dp.flows.len())
    }

    pub(crate) fn record_hit(&mut self, name: &str, keys: &FlowKeys, packets: u64, bytes: u64) -> bool {
        let used = self.started.elapsed().as_millis() as u64 + 1;
        let Some(dp) = self.datapaths.values_mut().find(|dp| dp.name == name) else {
            return false;
        };
        let Some(flow) = dp.flows.iter_mut().find(|flow| &flow.keys == keys) else {
            return false;
        };

        flow.stats.packets += packets;
        flow.stats.bytes += bytes;
        flow.used = used;
        dp.hit += packets;
        true
    }

    pub(crate) fn handle(&mut self, request: &Message) -> Outcome {
        let header = *request.header();
        let Some((genl, body)) = request.genl_body() else {
            tracing::trace!(kind = header.kind, "Simulated kernel ignoring control message");
            return Outcome::Reply(Vec::new());
        };

        let dump = header.flags & flags::DUMP == flags::DUMP;

        let result = if header.kind == GENL_ID_CTRL {
            self.ctrl(genl, body)
        } else {
            let family = self
                .families
                .iter()
                .find(|family| family.info.id == header.kind)
                .map(|family| (family.kind, family.info.id, family.info.version as u8));
            match family {
                Some((kind, id, version)) => self.ovs(kind, (id, version), &header, genl, body.clone()),
                None => Err(libc::ENOENT),
            }
        };

        let mut messages = match result {
            Ok(messages) => messages,
            Err(errno) => {
                tracing::debug!(seq = header.seq, errno, "Simulated kernel refusing request");
                return Outcome::Reply(vec![Message::error(header, -errno)]);
            }
        };

        for msg in messages.iter_mut() {
            msg.set_seq(header.seq);
        }

        if dump && genl.cmd == CMD_GET {
            return Outcome::Dump { seq: header.seq, messages };
        }

        // Only lookups reply with the entity unless the request asked for an echo
        let wants_data = header.kind == GENL_ID_CTRL || genl.cmd == CMD_GET || header.flags & flags::ECHO != 0;
        if !wants_data {
            messages.clear();
        }
        if header.flags & flags::ACK != 0 {
            messages.push(Message::error(header, 0));
        }

        Outcome::Reply(messages)
    }

    fn ctrl(&self, genl: GenlHeader, body: &Bytes) -> Result<Vec<Message>, Errno> {
        if genl.cmd != CTRL_CMD_GETFAMILY {
            return Err(libc::EOPNOTSUPP);
        }

        let attrs = Attrs::decode(body.clone()).map_err(|_| libc::EINVAL)?;
        let name = string(&attrs, CTRL_ATTR_FAMILY_NAME)?;

        let family = self.families.iter().find(|family| family.info.name == name).ok_or(libc::ENOENT)?;
        let body = family.info.encode().to_bytes().map_err(|_| libc::EMSGSIZE)?;

        Ok(vec![Message::genl(GENL_ID_CTRL, 0, GenlHeader { cmd: CTRL_CMD_NEWFAMILY, version: CTRL_VERSION }, body)])
    }

    fn ovs(
        &mut self,
        kind: FamilyKind,
        family: (u16, u8),
        header: &Header,
        genl: GenlHeader,
        body: Bytes,
    ) -> Result<Vec<Message>, Errno> {
        let (ovs, attrs) = decode_body(body).map_err(|_| libc::EINVAL)?;
        let dump = header.flags & flags::DUMP == flags::DUMP;

        let replies = match (kind, genl.cmd) {
            (FamilyKind::Datapath, CMD_NEW) => vec![self.new_datapath(&attrs)?],
            (FamilyKind::Datapath, CMD_DEL) => {
                let ifindex = self.find_datapath(ovs.dp_ifindex, &attrs)?;
                let dp = self.datapaths.remove(&ifindex).ok_or(libc::ENODEV)?;
                tracing::debug!(datapath = %dp.name, ifindex, "Deleted datapath");
                vec![(ifindex, dp.attrs())]
            }
            (FamilyKind::Datapath, CMD_GET) if dump => {
                self.datapaths.values().map(|dp| (dp.ifindex, dp.attrs())).collect()
            }
            (FamilyKind::Datapath, CMD_GET) => {
                let ifindex = self.find_datapath(ovs.dp_ifindex, &attrs)?;
                self.datapaths.get(&ifindex).map(|dp| (dp.ifindex, dp.attrs())).into_iter().collect()
            }
            (FamilyKind::Vport, cmd) => {
                let dp = self.datapaths.get_mut(&ovs.dp_ifindex).ok_or(libc::ENODEV)?;
                let ifindex = dp.ifindex;
                match cmd {
                    CMD_NEW => vec![(ifindex, dp.new_vport(&attrs)?)],
                    CMD_DEL => {
                        let port_no = dp.find_vport(&attrs)?;
                        let vport = dp.vports.remove(&port_no).ok_or(libc::ENODEV)?;
                        vec![(ifindex, vport.attrs())]
                    }
                    CMD_GET if dump => dp.vports.values().map(|vport| (ifindex, vport.attrs())).collect(),
                    CMD_GET => {
                        let port_no = dp.find_vport(&attrs)?;
                        dp.vports.get(&port_no).map(|vport| (ifindex, vport.attrs())).into_iter().collect()
                    }
                    _ => return Err(libc::EOPNOTSUPP),
                }
            }
            (FamilyKind::Flow, cmd) => {
                let dp = self.datapaths.get_mut(&ovs.dp_ifindex).ok_or(libc::ENODEV)?;
                let ifindex = dp.ifindex;
                match cmd {
                    CMD_NEW => vec![(ifindex, dp.new_flow(&attrs, header.flags)?)],
                    CMD_DEL if attrs.get(FLOW_ATTR_KEY).is_none() => {
                        tracing::debug!(datapath = %dp.name, flows = dp.flows.len(), "Flushing flows");
                        dp.flows.clear();
                        Vec::new()
                    }
                    CMD_DEL => {
                        let index = dp.find_flow(&attrs)?;
                        vec![(ifindex, dp.flows.remove(index).attrs())]
                    }
                    CMD_GET if dump => dp.flows.iter().map(|flow| (ifindex, flow.attrs())).collect(),
                    CMD_GET => {
                        let index = dp.find_flow(&attrs)?;
                        vec![(ifindex, dp.flows[index].attrs())]
                    }
                    _ => return Err(libc::EOPNOTSUPP),
                }
            }
            _ => return Err(libc::EOPNOTSUPP),
        };

        let (id, version) = family;
        replies
            .into_iter()
            .map(|(dp_ifindex, attrs)| {
                let body = encode_body(OvsHeader { dp_ifindex }, &attrs).map_err(|_| libc::EMSGSIZE)?;
                Ok(Message::genl(id, 0, GenlHeader { cmd: genl.cmd, version }, body))
            })
            .collect()
    }

    fn new_datapath(&mut self, attrs: &Attrs) -> Result<(u32, Attrs), Errno> {
        let name = string(attrs, DP_ATTR_NAME)?;
        let upcall_pid = u32_attr(attrs, DP_ATTR_UPCALL_PID)?;

        if self.datapaths.values().any(|dp| dp.name == name) {
            return Err(libc::EEXIST);
        }

        let ifindex = self.next_ifindex;
        self.next_ifindex += 1;

        tracing::debug!(datapath = %name, ifindex, "Created datapath");
        let dp =
            DatapathEntry { name, ifindex, upcall_pid, hit: 0, vports: BTreeMap::new(), flows: Vec::new() };
        let attrs = dp.attrs();
        self.datapaths.insert(ifindex, dp);

        Ok((ifindex, attrs))
    }

    /// Finds a datapath by ifindex, or by name when the ifindex is 0.
    fn find_datapath(&self, ifindex: u32, attrs: &Attrs) -> Result<u32, Errno> {
        if ifindex != 0 {
            return self.datapaths.contains_key(&ifindex).then_some(ifindex).ok_or(libc::ENODEV);
        }

        let name = string(attrs, DP_ATTR_NAME).map_err(|_| libc::ENODEV)?;
        self.datapaths.values().find(|dp| dp.name == name).map(|dp| dp.ifindex).ok_or(libc::ENODEV)
    }
}

impl DatapathEntry {
    fn attrs(&self) -> Attrs {
        let stats = DatapathStats { hit: self.hit, missed: 0, lost: 0, flows: self.flows.len() as u64 };

        let mut attrs = Attrs::new();
        attrs.push_str(DP_ATTR_NAME, &self.name).push(stats.encode(DP_ATTR_STATS));
        attrs
    }

    fn new_vport(&mut self, attrs: &Attrs) -> Result<Attrs, Errno> {
        let name = string(attrs, VPORT_ATTR_NAME)?;
        let kind = u32_attr(attrs, VPORT_ATTR_TYPE)?;
        let upcall_pid = u32_attr(attrs, VPORT_ATTR_UPCALL_PID)?;
        let options = attrs.get(VPORT_ATTR_OPTIONS).map(|attr| attr.as_nested()).transpose().map_err(|_| libc::EINVAL)?;

        match kind {
            VPORT_TYPE_NETDEV | VPORT_TYPE_INTERNAL | VPORT_TYPE_GRE => {}
            VPORT_TYPE_VXLAN | VPORT_TYPE_GENEVE => {
                // Tunnels need a destination port
                options.as_ref().and_then(|options| options.get(TUNNEL_ATTR_DST_PORT)).ok_or(libc::EINVAL)?;
            }
            _ => return Err(libc::EAFNOSUPPORT),
        }

        if self.vports.values().any(|vport| vport.name == name) {
            return Err(libc::EEXIST);
        }

        let port_no = match attrs.get(VPORT_ATTR_PORT_NO) {
            Some(attr) => {
                let port_no = attr.as_u32().map_err(|_| libc::EINVAL)?;
                if self.vports.contains_key(&port_no) {
                    return Err(libc::EBUSY);
                }
                port_no
            }
            None => (1..).find(|port_no| !self.vports.contains_key(port_no)).ok_or(libc::EFBIG)?,
        };

        tracing::debug!(datapath = %self.name, vport = %name, port_no, "Created vport");
        let vport = VportEntry { name, port_no, kind, options, upcall_pid };
        let attrs = vport.attrs();
        self.vports.insert(port_no, vport);

        Ok(attrs)
    }

    /// Finds a vport by port number, or by name.
    fn find_vport(&self, attrs: &Attrs) -> Result<u32, Errno> {
        if let Some(attr) = attrs.get(VPORT_ATTR_PORT_NO) {
            let port_no = attr.as_u32().map_err(|_| libc::EINVAL)?;
            return self.vports.contains_key(&port_no).then_some(port_no).ok_or(libc::ENODEV);
        }

        let name = string(attrs, VPORT_ATTR_NAME)?;
        self.vports.values().find(|vport| vport.name == name).map(|vport| vport.port_no).ok_or(libc::ENODEV)
    }

    fn new_flow(&mut self, attrs: &Attrs, request_flags: u16) -> Result<Attrs, Errno> {
        let keys = flow_keys(attrs)?;
        if keys.is_empty() {
            return Err(libc::EINVAL);
        }

        let actions = attrs.get(FLOW_ATTR_ACTIONS).ok_or(libc::EINVAL)?.as_nested().map_err(|_| libc::EINVAL)?;
        decode_actions(&actions).map_err(|_| libc::EINVAL)?;

        if let Some(flow) = self.flows.iter_mut().find(|flow| flow.keys == keys) {
            if request_flags & flags::EXCL != 0 {
                return Err(libc::EEXIST);
            }
            flow.actions = actions;
            return Ok(flow.attrs());
        }

        let flow = FlowEntry { keys, actions, stats: FlowStats::default(), used: 0 };
        let attrs = flow.attrs();
        self.flows.push(flow);

        Ok(attrs)
    }

    fn find_flow(&self, attrs: &Attrs) -> Result<usize, Errno> {
        let keys = flow_keys(attrs)?;
        self.flows.iter().position(|flow| flow.keys == keys).ok_or(libc::ENOENT)
    }
}

impl VportEntry {
    fn attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs
            .push_u32(VPORT_ATTR_PORT_NO, self.port_no)
            .push_u32(VPORT_ATTR_TYPE, self.kind)
            .push_str(VPORT_ATTR_NAME, &self.name);
        if let Some(options) = &self.options {
            attrs.push_nested(VPORT_ATTR_OPTIONS, options.clone());
        }
        attrs.push_u32(VPORT_ATTR_UPCALL_PID, self.upcall_pid).push(VportStats::default().encode(VPORT_ATTR_STATS));
        attrs
    }
}

impl FlowEntry {
    fn attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.push_nested(FLOW_ATTR_KEY, self.keys.encode()).push_nested(FLOW_ATTR_ACTIONS, self.actions.clone());
        // Idle flows carry neither stats nor a last-used time
        if self.stats.packets > 0 {
            attrs.push(self.stats.encode(FLOW_ATTR_STATS));
        }
        if self.used > 0 {
            attrs.push_u64(FLOW_ATTR_USED, self.used);
        }
        attrs
    }
}

fn string(attrs: &Attrs, kind: u16) -> Result<String, Errno> {
    attrs.get(kind).ok_or(libc::EINVAL)?.as_str().map_err(|_| libc::EINVAL)
}

fn u32_attr(attrs: &Attrs, kind: u16) -> Result<u32, Errno> {
    attrs.get(kind).ok_or(libc::EINVAL)?.as_u32().map_err(|_| libc::EINVAL)
}

fn flow_keys(attrs: &Attrs) -> Result<FlowKeys, Errno> {
    let nested = attrs.get(FLOW_ATTR_KEY).ok_or(libc::EINVAL)?.as_nested().map_err(|_| libc::EINVAL)?;
    decode_keys(&nested).map_err(|_| libc::EINVAL)
}
