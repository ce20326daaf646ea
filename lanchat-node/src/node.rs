//! Presence and transport wired together behind one handle for front-ends.

use std::net::SocketAddr;

use lanchat_core::Peer;

use crate::config::Config;
use crate::discovery::PresenceService;
use crate::events::{self, EventReceiver};
use crate::transport::{Outbound, TransportService};

pub struct Node {
    presence: PresenceService,
    transport: TransportService,
    outbound: Outbound,
}

impl Node {
    /// Start both services. A service whose port cannot be bound stays
    /// disabled (already logged); the other one keeps running.
    pub async fn start(config: Config) -> (Node, EventReceiver) {
        let (tx, rx) = events::channel(config.event_capacity);
        let mut presence = PresenceService::new(config.clone(), tx.clone());
        let mut transport = TransportService::new(config, tx);
        let _ = presence.start().await;
        let _ = transport.start().await;
        let outbound = transport.outbound();
        (
            Node {
                presence,
                transport,
                outbound,
            },
            rx,
        )
    }

    pub async fn stop(&mut self) {
        self.presence.stop().await;
        self.transport.stop().await;
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub async fn peers(&self) -> Vec<Peer> {
        let mut peers = self.presence.peers().await;
        peers.sort_by_key(|p| p.ip);
        peers
    }

    pub fn presence_running(&self) -> bool {
        self.presence.is_running()
    }

    pub fn transport_running(&self) -> bool {
        self.transport.is_running()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.presence.local_addr()
    }

    pub fn transport_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }
}
