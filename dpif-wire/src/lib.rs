//! Wire formats for talking to the Open vSwitch kernel datapath over generic
//! netlink: the attribute codec, message framing, flow keys and actions.

pub mod action;
pub mod attr;
pub mod ctrl;
pub mod key;
pub mod netlink;
pub mod ovs;

pub use action::Action;
pub use attr::{Attr, Attrs, CodecError};
pub use key::{FlowKey, FlowKeys, KeyError};
pub use netlink::{GenlHeader, Message, Payload};
