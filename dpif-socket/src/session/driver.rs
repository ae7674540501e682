use bytes::{Bytes, BytesMut};
use futures::{Future, SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;

use dpif_transport::Datagrams;
use dpif_wire::{
    netlink::{self, flags, Codec},
    Message, Payload,
};

use super::{Command, DumpEvent, Pending, SessionError, SessionOptions, SessionState};

/// The session driver. Endless future that owns the socket, writes queued
/// requests and dispatches every received message to its pending request by
/// sequence number.
pub(crate) struct SessionDriver<Io: Datagrams> {
    /// Options shared with the session.
    pub(crate) options: Arc<SessionOptions>,
    /// State shared with the session.
    pub(crate) state: Arc<SessionState>,
    /// Commands from the session handles.
    pub(crate) from_session: mpsc::Receiver<Command>,
    /// The socket to the kernel.
    pub(crate) conn: Io,
    /// Splits received datagrams into messages.
    pub(crate) codec: Codec,
    /// The outgoing datagram queue, with the sequence number of each request.
    pub(crate) egress_queue: VecDeque<(u32, Bytes)>,
    /// Requests handed to the socket but not yet flushed.
    pub(crate) unflushed: Vec<u32>,
    /// The currently pending requests, keyed by sequence number.
    pub(crate) pending: FxHashMap<u32, Pending>,
    /// Set once a shutdown was requested. The driver finishes after closing the socket.
    pub(crate) closing: Option<Vec<oneshot::Sender<()>>>,
}

impl<Io: Datagrams> SessionDriver<Io> {
    pub(crate) fn new(
        conn: Io,
        from_session: mpsc::Receiver<Command>,
        options: Arc<SessionOptions>,
        state: Arc<SessionState>,
    ) -> Self {
        Self {
            options,
            state,
            from_session,
            conn,
            codec: Codec::new(),
            egress_queue: VecDeque::new(),
            unflushed: Vec::new(),
            pending: FxHashMap::default(),
            closing: None,
        }
    }

    fn on_datagram(&mut self, datagram: Bytes) {
        self.state.stats.increment_rx(datagram.len());

        let mut buf = BytesMut::from(datagram.as_ref());
        loop {
            let seq = netlink::peek_seq(&buf);
            match self.codec.decode_eof(&mut buf) {
                Ok(Some(msg)) => self.on_message(msg),
                Ok(None) => break,
                Err(netlink::Error::Overrun) => {
                    // Messages were lost, so no dump in flight can be trusted.
                    tracing::warn!("Receive buffer overrun, failing pending dumps");
                    self.fail_dumps(|| SessionError::Wire(netlink::Error::Overrun));
                }
                Err(e @ netlink::Error::Truncated { .. }) => {
                    // The frame was consumed, the next message is still readable
                    tracing::warn!(?seq, "Malformed message: {:?}", e);
                    self.fail_seq(seq, SessionError::Wire(e));
                }
                Err(e) => {
                    let remaining = buf.len();
                    tracing::warn!(?seq, remaining, "Unreadable datagram: {:?}", e);
                    self.fail_seq(seq, SessionError::Wire(e));
                    // Whatever followed in the datagram is lost, including dump terminators
                    self.fail_dumps(|| SessionError::Malformed { remaining });
                    break;
                }
            }
        }
    }

    /// Resolves the request the malformed message was addressed to.
    fn fail_seq(&mut self, seq: Option<u32>, err: SessionError) {
        match seq.and_then(|seq| self.pending.remove(&seq)) {
            Some(pending) => fail(pending, err),
            None => self.state.stats.increment_dropped(),
        }
    }

    fn on_message(&mut self, msg: Message) {
        let seq = msg.seq();
        let Some(pending) = self.pending.remove(&seq) else {
            tracing::trace!(seq, kind = msg.kind(), "Dropping message for unknown request");
            self.state.stats.increment_dropped();
            return;
        };

        if let Some(pending) = self.dispatch(seq, pending, msg) {
            self.pending.insert(seq, pending);
        }
    }

    /// Delivers `msg` to `pending`. Returns the request back if it expects
    /// more messages.
    fn dispatch(&self, seq: u32, pending: Pending, msg: Message) -> Option<Pending> {
        match pending {
            Pending::Reply { ack, mut data, sender } => {
                let result = match msg.payload() {
                    Payload::Error { code: 0, .. } => Ok(data.take()),
                    Payload::Error { code, .. } => {
                        self.state.stats.increment_kernel_errors();
                        Err(SessionError::Kernel(code.wrapping_neg()))
                    }
                    Payload::Genl { .. } if ack => {
                        if sender.is_closed() {
                            tracing::trace!(seq, "Request abandoned");
                            return None;
                        }
                        if data.is_some() {
                            tracing::debug!(seq, "Multiple replies to a single request, keeping the last");
                        }
                        data = Some(msg);
                        return Some(Pending::Reply { ack, data, sender });
                    }
                    Payload::Genl { .. } => Ok(Some(msg)),
                    Payload::Done | Payload::Noop => return Some(Pending::Reply { ack, data, sender }),
                };

                if sender.send(result).is_err() {
                    tracing::trace!(seq, "Request abandoned");
                }
                None
            }
            Pending::Dump { sender } => {
                let event = if msg.flags() & flags::DUMP_INTR != 0 {
                    DumpEvent::Failed(SessionError::DumpInterrupted)
                } else {
                    match msg.payload() {
                        Payload::Genl { .. } => {
                            self.state.stats.increment_dump_messages();
                            // Delivery fails once the dump was dropped
                            if sender.send(DumpEvent::Message(msg)).is_err() {
                                tracing::trace!(seq, "Dump abandoned");
                                return None;
                            }
                            return Some(Pending::Dump { sender });
                        }
                        Payload::Done => DumpEvent::Done,
                        Payload::Error { code: 0, .. } | Payload::Noop => return Some(Pending::Dump { sender }),
                        Payload::Error { code, .. } => {
                            self.state.stats.increment_kernel_errors();
                            DumpEvent::Failed(SessionError::Kernel(code.wrapping_neg()))
                        }
                    }
                };

                let _ = sender.send(event);
                None
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { seq, datagram, pending } => {
                tracing::trace!(seq, len = datagram.len(), "Queueing request");
                if self.pending.insert(seq, pending).is_some() {
                    // Only possible after the sequence space wrapped around
                    tracing::warn!(seq, "Sequence number reused while a request was pending");
                }
                self.egress_queue.push_back((seq, datagram));
            }
            Command::Shutdown { done } => {
                tracing::debug!("Session closed, shutting down driver");
                self.closing.get_or_insert_with(Vec::new).push(done);
                self.fail_all(|| SessionError::Closed);
            }
        }
    }

    /// Resolves every pending request with the error built by `err`.
    fn fail_all(&mut self, err: impl Fn() -> SessionError) {
        for (_, pending) in self.pending.drain() {
            fail(pending, err());
        }
    }

    fn fail_dumps(&mut self, err: impl Fn() -> SessionError) {
        self.pending.retain(|_, pending| match pending {
            Pending::Dump { sender } => {
                let _ = sender.send(DumpEvent::Failed(err()));
                false
            }
            Pending::Reply { .. } => true,
        });
    }

    /// Fails the requests whose datagrams the socket could not send. The
    /// session stays usable.
    fn on_send_error(&mut self, e: io::Error, seqs: impl IntoIterator<Item = u32>) {
        tracing::error!("Failed to send datagram: {:?}", e);
        let kind = e.kind();
        for seq in seqs {
            if let Some(pending) = self.pending.remove(&seq) {
                fail(pending, SessionError::Io(io::Error::new(kind, "socket send failed")));
            }
        }
    }

    fn poll_shutdown(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Err(e) = ready!(self.conn.poll_close_unpin(cx)) {
            tracing::debug!("Failed to close socket: {:?}", e);
        }

        self.from_session.close();
        for done in self.closing.take().unwrap_or_default() {
            let _ = done.send(());
        }

        Poll::Ready(())
    }
}

impl<Io: Datagrams> Future for SessionDriver<Io> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut received = 0;

        loop {
            if this.closing.is_some() {
                return this.poll_shutdown(cx);
            }

            match this.conn.poll_flush_unpin(cx) {
                Poll::Ready(Ok(())) => this.unflushed.clear(),
                Poll::Ready(Err(e)) => {
                    let failed = std::mem::take(&mut this.unflushed);
                    this.on_send_error(e, failed);
                }
                Poll::Pending => {}
            }

            // Check for incoming datagrams from the socket
            match this.conn.poll_next_unpin(cx) {
                Poll::Ready(Some(result)) => {
                    match result {
                        Ok(datagram) => this.on_datagram(datagram),
                        Err(e) => {
                            // Replies may have been lost (ENOBUFS), so nothing
                            // in flight can be trusted to complete.
                            tracing::error!("Socket error: {:?}", e);
                            let kind = e.kind();
                            this.fail_all(|| SessionError::Io(io::Error::new(kind, "socket receive failed")));
                        }
                    }

                    received += 1;
                    if received >= this.options.recv_batch_limit {
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }

                    continue;
                }
                Poll::Ready(None) => {
                    tracing::debug!("Socket closed, shutting down driver");
                    this.fail_all(|| {
                        SessionError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "socket closed"))
                    });
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            if !this.egress_queue.is_empty() {
                match this.conn.poll_ready_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        if let Some((seq, datagram)) = this.egress_queue.pop_front() {
                            let size = datagram.len();
                            match this.conn.start_send_unpin(datagram) {
                                Ok(_) => {
                                    this.state.stats.increment_tx(size);
                                    this.unflushed.push(seq);
                                }
                                Err(e) => this.on_send_error(e, [seq]),
                            }
                            // We might be able to send more queued datagrams
                            continue;
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        // The next queued request is failed too, so a broken
                        // socket drains the queue instead of spinning on it.
                        let mut failed = std::mem::take(&mut this.unflushed);
                        failed.extend(this.egress_queue.pop_front().map(|(seq, _)| seq));
                        this.on_send_error(e, failed);
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            // Check for commands from the session handles
            match this.from_session.poll_recv(cx) {
                Poll::Ready(Some(cmd)) => {
                    this.on_command(cmd);

                    continue;
                }
                Poll::Ready(None) => {
                    tracing::debug!("Session dropped, shutting down driver and closing socket");
                    this.closing.get_or_insert_with(Vec::new);
                    this.fail_all(|| SessionError::Closed);

                    continue;
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}

fn fail(pending: Pending, err: SessionError) {
    match pending {
        Pending::Reply { sender, .. } => {
            let _ = sender.send(Err(err));
        }
        Pending::Dump { sender } => {
            let _ = sender.send(DumpEvent::Failed(err));
        }
    }
}
