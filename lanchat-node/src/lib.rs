//! LAN chat node: presence over UDP broadcast, messages over TCP.

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod node;
pub mod transport;

pub use config::Config;
pub use discovery::PresenceService;
pub use error::NodeError;
pub use events::{EventReceiver, EventSender, NodeEvent};
pub use node::Node;
pub use transport::{Outbound, TransportService};
