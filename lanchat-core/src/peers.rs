//! Presence table: who is reachable, keyed by IP, aged out by last heartbeat.
//! Host-driven: callers pass the current `Instant`, so the table does no I/O or clock reads.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A reachable peer. Consumers only ever receive clones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub display_name: String,
    pub last_seen_at: Instant,
}

pub struct PeerTable {
    peers: HashMap<IpAddr, Peer>,
    expiry: Duration,
}

impl PeerTable {
    /// Peers silent for longer than `expiry` are removed by [`PeerTable::expire`].
    pub fn new(expiry: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Record a heartbeat from `ip`. Returns the peer when this starts a new
    /// presence episode; a known peer only gets its last-seen time and name refreshed.
    pub fn observe(&mut self, ip: IpAddr, name: &str, now: Instant) -> Option<Peer> {
        match self.peers.get_mut(&ip) {
            Some(peer) => {
                peer.last_seen_at = now;
                if peer.display_name != name {
                    peer.display_name = name.to_string();
                }
                None
            }
            None => {
                let peer = Peer {
                    ip,
                    display_name: name.to_string(),
                    last_seen_at: now,
                };
                self.peers.insert(ip, peer.clone());
                Some(peer)
            }
        }
    }

    /// Remove and return every peer whose last heartbeat is older than the expiry.
    pub fn expire(&mut self, now: Instant) -> Vec<Peer> {
        let stale: Vec<IpAddr> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen_at) > self.expiry)
            .map(|p| p.ip)
            .collect();
        stale
            .iter()
            .filter_map(|ip| self.peers.remove(ip))
            .collect()
    }

    pub fn get(&self, ip: &IpAddr) -> Option<&Peer> {
        self.peers.get(ip)
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
