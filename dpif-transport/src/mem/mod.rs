use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use dpif_common::{datagram_channel, DatagramChannel};

use crate::Transport;

const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Datagrams buffered per direction on every opened socket.
    pub buffer_size: usize,
    /// Sockets waiting to be accepted by the listener.
    pub backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_BUFFER_SIZE, backlog: 64 }
    }
}

/// An in-process transport. Every socket opened through it is a
/// [`DatagramChannel`] whose peer end is handed to the paired [`MemListener`],
/// which plays the role of the kernel.
#[derive(Debug, Clone)]
pub struct Mem {
    config: Config,
    to_listener: mpsc::Sender<DatagramChannel>,
}

/// The accepting side of a [`Mem`] transport.
#[derive(Debug)]
pub struct MemListener {
    from_transport: mpsc::Receiver<DatagramChannel>,
}

impl Mem {
    pub fn new(config: Config) -> (Self, MemListener) {
        let (to_listener, from_transport) = mpsc::channel(config.backlog);
        (Self { config, to_listener }, MemListener { from_transport })
    }
}

impl MemListener {
    /// Waits for the next opened socket. Returns `None` once every [`Mem`]
    /// handle has been dropped.
    pub async fn accept(&mut self) -> Option<DatagramChannel> {
        self.from_transport.recv().await
    }
}

impl Stream for MemListener {
    type Item = DatagramChannel;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.from_transport.poll_recv(cx)
    }
}

#[async_trait]
impl Transport for Mem {
    type Io = DatagramChannel;
    type Error = io::Error;

    async fn open(&self) -> Result<Self::Io, Self::Error> {
        let (local, peer) = datagram_channel(self.config.buffer_size);

        self.to_listener
            .send(peer)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;

        debug!("Opened in-memory socket");
        Ok(local)
    }
}
