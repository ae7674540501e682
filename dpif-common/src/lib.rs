//! Common functions and types shared by the dpif crates.

mod channel;
pub use channel::{datagram_channel, DatagramChannel};
