use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream};
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::sync::PollSender;

/// One end of a bounded, bi-directional datagram channel. Relies on Tokio's
/// [`mpsc`] channel and preserves datagram boundaries.
///
/// Implements [`Stream`] and [`Sink`] with [`io::Error`] so it can stand in
/// for a datagram socket. Closing one end ends the peer's stream once the
/// datagrams already sent have been received.
pub struct DatagramChannel {
    tx: PollSender<Bytes>,
    rx: Receiver<Bytes>,
}

/// Creates a connected pair of datagram channels, each buffering up to
/// `buffer` datagrams in either direction.
pub fn datagram_channel(buffer: usize) -> (DatagramChannel, DatagramChannel) {
    let (tx1, rx1) = mpsc::channel(buffer);
    let (tx2, rx2) = mpsc::channel(buffer);

    (
        DatagramChannel { tx: PollSender::new(tx1), rx: rx2 },
        DatagramChannel { tx: PollSender::new(tx2), rx: rx1 },
    )
}

impl std::fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel").field("closed", &self.tx.is_closed()).finish()
    }
}

fn broken_pipe<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "datagram channel closed")
}

impl DatagramChannel {
    /// Sends a datagram, waiting until there is capacity.
    pub async fn send(&mut self, datagram: Bytes) -> io::Result<()> {
        SinkExt::send(self, datagram).await
    }

    /// Receives the next datagram. Returns `None` once the peer has closed
    /// its end and every datagram it sent has been received.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Closes both directions.
    pub fn close(&mut self) {
        self.tx.close();
        self.rx.close();
    }

    /// Returns `true` if the peer can no longer receive.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Stream for DatagramChannel {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|datagram| datagram.map(Ok))
    }
}

impl Sink<Bytes> for DatagramChannel {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_ready_unpin(cx).map_err(broken_pipe)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.tx.start_send_unpin(item).map_err(broken_pipe)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_flush_unpin(cx).map_err(broken_pipe)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_close_unpin(cx).map_err(broken_pipe)
    }
}
