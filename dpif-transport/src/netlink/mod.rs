use std::{
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use netlink_sys::{protocols::NETLINK_GENERIC, AsyncSocket, SocketAddr, TokioSocket};
use tracing::debug;

use crate::Transport;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Size of the kernel receive buffer, `None` keeps the system default.
    /// Large dumps need room for several datagrams.
    pub recv_buffer_size: Option<usize>,
}

/// Opens `NETLINK_GENERIC` sockets to the kernel.
#[derive(Debug, Clone, Default)]
pub struct Netlink {
    config: Config,
}

impl Netlink {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for Netlink {
    type Io = NetlinkSocket;
    type Error = io::Error;

    async fn open(&self) -> Result<Self::Io, Self::Error> {
        let mut socket = TokioSocket::new(NETLINK_GENERIC)?;

        let inner = socket.socket_mut();
        let local = inner.bind_auto()?;
        // Kernel is port 0
        inner.connect(&SocketAddr::new(0, 0))?;
        if let Some(size) = self.config.recv_buffer_size {
            inner.set_rx_buf_sz(size)?;
        }

        debug!(port = local.port_number(), "Opened generic netlink socket");

        Ok(NetlinkSocket { socket, pending: None })
    }
}

/// A connected generic netlink socket. Sending buffers at most one datagram.
pub struct NetlinkSocket {
    socket: TokioSocket,
    pending: Option<Bytes>,
}

impl std::fmt::Debug for NetlinkSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSocket").field("pending", &self.pending.as_ref().map(Bytes::len)).finish()
    }
}

impl NetlinkSocket {
    /// Sends the buffered datagram. It is discarded once the send completed,
    /// whether or not it succeeded.
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(datagram) = self.pending.as_ref() else {
            return Poll::Ready(Ok(()));
        };

        let len = datagram.len();
        let result = ready!(self.socket.poll_send(cx, datagram));
        self.pending = None;

        match result {
            Ok(sent) if sent == len => Poll::Ready(Ok(())),
            Ok(sent) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short netlink write: {sent} of {len} bytes"),
            ))),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Stream for NetlinkSocket {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match ready!(this.socket.poll_recv_from_full(cx)) {
            Ok((datagram, _from)) => Poll::Ready(Some(Ok(Bytes::from(datagram)))),
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }
}

impl Sink<Bytes> for NetlinkSocket {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_flush_pending(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.get_mut().pending = Some(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_flush_pending(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_flush_pending(cx)
    }
}
