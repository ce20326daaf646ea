//! Events handed to the front-end. Network tasks push them into a bounded
//! queue which the front-end drains on its own loop.

use std::net::IpAddr;

use lanchat_core::Envelope;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// First heartbeat of a presence episode.
    PeerDiscovered { ip: IpAddr, name: String },
    /// No heartbeat for longer than the expiry; ends the episode.
    PeerLost { ip: IpAddr },
    /// Inbound envelope with `sender_ip` set from the socket.
    Message(Envelope),
}

pub type EventSender = mpsc::Sender<NodeEvent>;
pub type EventReceiver = mpsc::Receiver<NodeEvent>;

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}
