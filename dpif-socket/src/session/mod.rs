use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use dpif_wire::{netlink, Message};

mod driver;
mod socket;
mod stats;
use driver::*;
pub use socket::*;
pub use stats::SessionStats;

const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_RECV_BATCH_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Wire protocol error: {0:?}")]
    Wire(#[from] netlink::Error),
    #[error("Malformed datagram: {remaining} bytes could not be read")]
    Malformed { remaining: usize },
    #[error("Kernel error: errno {0}")]
    Kernel(i32),
    #[error("Dump interrupted by a concurrent change")]
    DumpInterrupted,
    #[error("Session closed")]
    Closed,
    #[error("Transport error: {0:?}")]
    Transport(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("Request completed without a reply message")]
    MissingReply,
}

impl SessionError {
    /// Returns the kernel errno if the kernel refused the request.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel(errno) => Some(*errno),
            _ => None,
        }
    }
}

pub(crate) enum Command {
    Send { seq: u32, datagram: Bytes, pending: Pending },
    Shutdown { done: oneshot::Sender<()> },
}

/// What the driver does with the replies to an outstanding request.
pub(crate) enum Pending {
    Reply {
        /// The request asked for an acknowledgement: keep the data reply
        /// until the ACK arrives.
        ack: bool,
        data: Option<Message>,
        sender: oneshot::Sender<Result<Option<Message>, SessionError>>,
    },
    Dump { sender: mpsc::UnboundedSender<DumpEvent> },
}

#[derive(Debug)]
pub(crate) enum DumpEvent {
    Message(Message),
    Done,
    Failed(SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Capacity of the command channel between session handles and the driver.
    pub channel_buffer_size: usize,
    /// Datagrams the driver processes before yielding back to the runtime.
    pub recv_batch_limit: usize,
}

impl SessionOptions {
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    pub fn with_recv_batch_limit(mut self, limit: usize) -> Self {
        self.recv_batch_limit = limit.max(1);
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { channel_buffer_size: DEFAULT_BUFFER_SIZE, recv_batch_limit: DEFAULT_RECV_BATCH_LIMIT }
    }
}

/// Session state, shared between the driver task and the session handles.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) stats: SessionStats,
}
