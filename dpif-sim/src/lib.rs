//! An in-process stand-in for the Open vSwitch kernel module.
//!
//! [`Simulator::start`] spawns a task that accepts sockets opened through the
//! [`Mem`] transport returned by [`Simulator::transport`] and answers them the
//! way the kernel answers generic netlink requests: the controller family,
//! and the datapath, vport and flow families. State is shared by every
//! connection and outlives them, like kernel state outlives a process.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};

use dpif_common::DatagramChannel;
use dpif_transport::mem::{self, Mem};
use dpif_wire::{
    key::FlowKeys,
    netlink::{flags, Codec},
    ovs::{DATAPATH_FAMILY, FLOW_FAMILY, PACKET_FAMILY, VPORT_FAMILY},
    Message,
};

mod kernel;
use kernel::{Kernel, Outcome};

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Messages per datagram when answering a dump.
    pub dump_batch_size: usize,
    /// Mark every dump as interrupted after its first message.
    pub interrupt_dumps: bool,
    /// Close the socket after the first datagram of a dump, before the terminator.
    pub close_mid_dump: bool,
    /// Families the simulated kernel registers.
    pub families: Vec<String>,
}

impl SimOptions {
    pub fn with_dump_batch_size(mut self, size: usize) -> Self {
        self.dump_batch_size = size.max(1);
        self
    }

    pub fn with_interrupted_dumps(mut self) -> Self {
        self.interrupt_dumps = true;
        self
    }

    pub fn with_close_mid_dump(mut self) -> Self {
        self.close_mid_dump = true;
        self
    }

    pub fn with_families<I, S>(mut self, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.families = families.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            dump_batch_size: 4,
            interrupt_dumps: false,
            close_mid_dump: false,
            families: [DATAPATH_FAMILY, VPORT_FAMILY, FLOW_FAMILY, PACKET_FAMILY]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// A running simulated kernel. Dropping it stops accepting new sockets.
#[derive(Debug)]
pub struct Simulator {
    transport: Mem,
    kernel: Arc<Mutex<Kernel>>,
    task: JoinHandle<()>,
}

impl Simulator {
    /// Starts the simulator. Must be called from within a tokio runtime.
    pub fn start(options: SimOptions) -> Self {
        let (transport, mut listener) = Mem::new(mem::Config::default());
        let kernel = Arc::new(Mutex::new(Kernel::new(&options.families)));
        let options = Arc::new(options);

        let task = tokio::spawn({
            let kernel = Arc::clone(&kernel);
            async move {
                while let Some(conn) = listener.accept().await {
                    tracing::debug!("Simulated kernel accepted a socket");
                    tokio::spawn(serve(Arc::clone(&kernel), Arc::clone(&options), conn));
                }
            }
        });

        Self { transport, kernel, task }
    }

    /// The transport to open sockets to this simulator with.
    pub fn transport(&self) -> Mem {
        self.transport.clone()
    }

    /// Names of the datapaths that currently exist.
    pub fn datapath_names(&self) -> Vec<String> {
        self.kernel.lock().datapath_names()
    }

    /// Number of flows installed in the datapath called `datapath`.
    pub fn flow_count(&self, datapath: &str) -> Option<usize> {
        self.kernel.lock().flow_count(datapath)
    }

    /// Accounts `packets` and `bytes` to the flow matching `keys`, as if
    /// traffic had hit it. Returns false when no such flow exists.
    pub fn record_hit(&self, datapath: &str, keys: &FlowKeys, packets: u64, bytes: u64) -> bool {
        self.kernel.lock().record_hit(datapath, keys, packets, bytes)
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answers the requests of a single socket until it is closed.
async fn serve(kernel: Arc<Mutex<Kernel>>, options: Arc<SimOptions>, mut conn: DatagramChannel) {
    let mut codec = Codec::new();

    while let Some(datagram) = conn.recv().await {
        let mut buf = BytesMut::from(datagram.as_ref());

        loop {
            let request = match codec.decode_eof(&mut buf) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Simulated kernel dropping malformed datagram: {:?}", e);
                    break;
                }
            };

            tracing::trace!(seq = request.seq(), family = request.kind(), "Simulated kernel handling request");
            let outcome = kernel.lock().handle(&request);

            let sent = match outcome {
                Outcome::Reply(messages) if messages.is_empty() => true,
                Outcome::Reply(messages) => send(&mut conn, messages).await,
                Outcome::Dump { seq, messages } => send_dump(&mut conn, &options, seq, messages).await,
            };

            if !sent {
                conn.close();
                return;
            }
        }
    }

    tracing::debug!("Simulated kernel socket closed");
}

/// Sends `messages` as one datagram. Returns false if the socket is gone.
async fn send(conn: &mut DatagramChannel, messages: Vec<Message>) -> bool {
    let mut codec = Codec::new();
    let mut buf = BytesMut::new();
    for msg in messages {
        if let Err(e) = codec.encode(msg, &mut buf) {
            tracing::error!("Simulated kernel failed to encode reply: {:?}", e);
            return false;
        }
    }

    conn.send(buf.freeze()).await.is_ok()
}

/// Sends the messages of a dump in batches, followed by the terminator.
async fn send_dump(conn: &mut DatagramChannel, options: &SimOptions, seq: u32, messages: Vec<Message>) -> bool {
    let batch_size = options.dump_batch_size.max(1);
    let interrupted = |index: usize| if options.interrupt_dumps && index > 0 { flags::DUMP_INTR } else { 0 };

    let total = messages.len();
    let mut batch = Vec::with_capacity(batch_size + 1);
    let mut datagrams = 0;

    for (index, mut msg) in messages.into_iter().enumerate() {
        msg.set_flags(flags::MULTI | interrupted(index));
        batch.push(msg);

        if batch.len() == batch_size && index + 1 < total {
            if !send(conn, std::mem::take(&mut batch)).await {
                return false;
            }
            datagrams += 1;

            if options.close_mid_dump {
                tracing::debug!(seq, "Simulated kernel closing socket mid-dump");
                return false;
            }
        }
    }

    batch.push(Message::done(seq, interrupted(total)));

    if options.close_mid_dump && datagrams == 0 {
        // Nothing was sent yet: send what we have but not the terminator
        batch.pop();
        if !batch.is_empty() {
            let _ = send(conn, batch).await;
        }
        return false;
    }

    send(conn, batch).await
}
