//! Transports carry raw netlink datagrams between the session and the kernel.
//! The session never touches a socket directly: it opens one through a
//! [`Transport`] and reads and writes whole datagrams through the returned
//! [`Transport::Io`].

use bytes::Bytes;
use futures::{Sink, Stream};
use std::io;

pub mod mem;
#[cfg(target_os = "linux")]
pub mod netlink;

pub use mem::{Mem, MemListener};
#[cfg(target_os = "linux")]
pub use netlink::Netlink;

/// A datagram socket to the kernel RPC endpoint.
///
/// Every item of the stream is one received datagram, which may hold several
/// netlink messages. Every item sent is one datagram. The stream ending means
/// the socket was closed. Closing the sink closes the socket.
pub trait Datagrams:
    Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Unpin + Send + 'static
{
}

impl<T> Datagrams for T where
    T: Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Unpin + Send + 'static
{
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Io: Datagrams;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opens a new socket.
    async fn open(&self) -> Result<Self::Io, Self::Error>;
}
