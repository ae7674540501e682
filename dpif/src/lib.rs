//! Control the Open vSwitch kernel datapath over generic netlink.
//!
//! ```no_run
//! # async fn run() -> Result<(), dpif::Error> {
//! use dpif::{Action, Connection, FlowKey, FlowSpec, Netlink, VportSpec};
//!
//! let conn = Connection::open(&Netlink::default()).await?;
//!
//! let dp = conn.create_datapath("dp0").await?;
//! let port = dp.create_vport("dp0-int", VportSpec::Internal).await?;
//!
//! let flow = FlowSpec::new()
//!     .with_key(FlowKey::InPort(port.port_no()))?
//!     .with_action(Action::Output(0));
//! dp.create_flow(&flow).await?;
//!
//! for flow in dp.enumerate_flows().await? {
//!     println!("{:?} -> {:?}", flow.keys(), flow.actions());
//! }
//!
//! dp.delete().await?;
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod datapath;
mod error;
mod flow;
mod vport;

pub use connection::{Connection, ConnectionOptions};
pub use datapath::Datapath;
pub use error::{Error, FamilyKind, KernelError};
pub use flow::FlowSpec;
pub use vport::{Vport, VportSpec};

pub use dpif_socket::{FamilyTable, RequestId, ResolveError, Session, SessionError, SessionOptions, SessionStats};
pub use dpif_transport::*;
pub use dpif_wire::{
    action::Action,
    key::{self, FlowKey, FlowKeys},
    ovs::{DatapathStats, FlowStats, VportStats},
    CodecError, KeyError,
};
