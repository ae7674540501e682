use futures::{Future, Stream, StreamExt};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{ready, Context, Poll},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use dpif_transport::{Datagrams, Transport};
use dpif_wire::{netlink::flags, Message};

use super::{Command, DumpEvent, Pending, SessionDriver, SessionError, SessionOptions, SessionState, SessionStats};
use crate::RequestId;

/// A request/response session over one kernel socket.
///
/// The socket is owned by a driver task spawned on the tokio runtime. Handles
/// are cheap to clone and share the driver, so requests from any number of
/// tasks may be in flight at once. Every reply is matched to its request by
/// sequence number alone.
#[derive(Debug, Clone)]
pub struct Session {
    /// Command channel to the driver task.
    to_driver: mpsc::Sender<Command>,
    /// Next sequence number, shared by all handles.
    seq: Arc<AtomicU32>,
    /// Session state. This is shared with the driver task.
    state: Arc<SessionState>,
}

impl Session {
    /// Opens a socket through `transport` and starts a session on it.
    pub async fn open<T: Transport>(transport: &T) -> Result<Self, SessionError> {
        Self::open_with_options(transport, SessionOptions::default()).await
    }

    pub async fn open_with_options<T: Transport>(
        transport: &T,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let io = transport.open().await.map_err(|e| SessionError::Transport(Box::new(e)))?;

        Ok(Self::new(io, options))
    }

    /// Starts a session on an already opened socket. Must be called from
    /// within a tokio runtime.
    pub fn new<Io: Datagrams>(io: Io, options: SessionOptions) -> Self {
        let (to_driver, from_session) = mpsc::channel(options.channel_buffer_size.max(1));
        let state = Arc::new(SessionState::default());

        let driver = SessionDriver::new(io, from_session, Arc::new(options), Arc::clone(&state));

        // Spawn the driver task
        tokio::spawn(driver);
        tracing::debug!("Session driver started");

        Self { to_driver, seq: Arc::new(AtomicU32::new(1)), state }
    }

    pub fn stats(&self) -> &SessionStats {
        &self.state.stats
    }

    /// Returns true once the driver has stopped, after [`Session::close`] or
    /// a socket failure.
    pub fn is_closed(&self) -> bool {
        self.to_driver.is_closed()
    }

    /// Returns the next sequence number. Wraps around and skips 0, which the
    /// kernel uses for notifications.
    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn submit(&self, mut message: Message, pending: Pending) -> Result<RequestId, SessionError> {
        let seq = self.next_seq();
        message.set_seq(seq);
        let datagram = message.to_bytes()?;

        self.to_driver
            .send(Command::Send { seq, datagram, pending })
            .await
            .map_err(|_| SessionError::Closed)?;

        self.state.stats.increment_requests();
        Ok(RequestId::new(seq))
    }

    /// Sends a single request. The returned [`PendingReply`] resolves with the
    /// data reply, or `None` when the kernel only acknowledged the request.
    ///
    /// The `REQUEST` flag is always set. If the message also carries `ACK`,
    /// the reply resolves on the acknowledgement, with any data reply that
    /// preceded it.
    pub async fn send_request(&self, mut message: Message) -> Result<PendingReply, SessionError> {
        message.set_flags(message.flags() | flags::REQUEST);
        let ack = message.flags() & flags::ACK != 0;

        let (sender, rx) = oneshot::channel();
        let id = self.submit(message, Pending::Reply { ack, data: None, sender }).await?;

        Ok(PendingReply { id, rx })
    }

    /// Sends a dump request. The returned [`Dump`] yields every message of the
    /// multi-part reply in order and ends after the kernel's terminator.
    pub async fn send_dump(&self, mut message: Message) -> Result<Dump, SessionError> {
        message.set_flags(message.flags() | flags::REQUEST | flags::DUMP);

        let (sender, rx) = mpsc::unbounded_channel();
        let id = self.submit(message, Pending::Dump { sender }).await?;

        Ok(Dump { id, events: UnboundedReceiverStream::new(rx), finished: false })
    }

    /// Sends a request and waits for its reply.
    pub async fn request(&self, message: Message) -> Result<Option<Message>, SessionError> {
        self.send_request(message).await?.await
    }

    /// Sends a request and waits for its reply, failing with
    /// [`SessionError::MissingReply`] when only an acknowledgement arrives.
    pub async fn request_reply(&self, message: Message) -> Result<Message, SessionError> {
        self.request(message).await?.ok_or(SessionError::MissingReply)
    }

    /// Sends a dump request and collects every message.
    pub async fn dump(&self, message: Message) -> Result<Vec<Message>, SessionError> {
        let mut dump = self.send_dump(message).await?;

        let mut messages = Vec::new();
        while let Some(msg) = dump.next().await {
            messages.push(msg?);
        }

        Ok(messages)
    }

    /// Stops the driver and closes the socket. Every pending request, on any
    /// handle, resolves with [`SessionError::Closed`].
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.to_driver.send(Command::Shutdown { done }).await.is_ok() {
            let _ = wait.await;
        }
    }
}

/// A request waiting for its reply. Dropping it abandons the request.
#[derive(Debug)]
pub struct PendingReply {
    id: RequestId,
    rx: oneshot::Receiver<Result<Option<Message>, SessionError>>,
}

impl PendingReply {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Option<Message>, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.rx).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(SessionError::Closed)),
        }
    }
}

/// The messages of a multi-part reply. Dropping it abandons the dump.
///
/// The stream ends after the kernel's terminator. Any failure, including the
/// socket going away before the terminator, is yielded as a final error.
#[derive(Debug)]
pub struct Dump {
    id: RequestId,
    events: UnboundedReceiverStream<DumpEvent>,
    finished: bool,
}

impl Dump {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Stream for Dump {
    type Item = Result<Message, SessionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let item = match ready!(self.events.poll_next_unpin(cx)) {
            Some(DumpEvent::Message(msg)) => return Poll::Ready(Some(Ok(msg))),
            Some(DumpEvent::Done) => None,
            Some(DumpEvent::Failed(e)) => Some(Err(e)),
            None => Some(Err(SessionError::Closed)),
        };

        self.finished = true;
        Poll::Ready(item)
    }
}
