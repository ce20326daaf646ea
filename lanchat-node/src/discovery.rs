//! LAN presence: UDP broadcast heartbeat, listen for peers' heartbeats, age out silent peers.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lanchat_core::{decode, Envelope, FrameEncodeError, MessageType, Peer, PeerTable};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::NodeError;
use crate::events::{EventSender, NodeEvent};

const MAX_DATAGRAM: usize = 65536;
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Presence service. Owns the peer table; consumers see copies through events or [`PresenceService::peers`].
pub struct PresenceService {
    config: Config,
    events: EventSender,
    table: Arc<Mutex<PeerTable>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl PresenceService {
    pub fn new(config: Config, events: EventSender) -> Self {
        let table = PeerTable::new(config.peer_expiry());
        Self {
            config,
            events,
            table: Arc::new(Mutex::new(table)),
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Bind both sockets and launch the broadcast, listen and cleanup loops.
    /// On bind failure the service stays stopped and the error is returned.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.is_running() {
            return Ok(());
        }
        // Reap loops left over from an earlier run that ended abnormally.
        self.stop().await;
        let port = self.config.discovery_port;
        let recv_socket = bind_udp(port).map_err(|source| {
            tracing::error!("failed to bind discovery port {}: {}", port, source);
            NodeError::Bind {
                kind: "discovery",
                port,
                source,
            }
        })?;
        let send_socket = bind_broadcast().map_err(|source| {
            tracing::error!("failed to open broadcast socket: {}", source);
            NodeError::Bind {
                kind: "broadcast",
                port: 0,
                source,
            }
        })?;
        let heartbeat = lanchat_core::encode(&Envelope::discovery(self.config.username.as_str()))
            .map_err(FrameEncodeError::from)?;
        let local = if self.config.filter_self {
            local_interface_addrs()
        } else {
            HashSet::new()
        };
        self.local_addr = recv_socket.local_addr().ok();
        *self.table.lock().await = PeerTable::new(self.config.peer_expiry());

        // Heartbeat to the port actually bound (differs from config only when it is 0).
        let bound_port = self.local_addr.map_or(port, |a| a.port());
        let dest = SocketAddr::new(IpAddr::V4(self.config.broadcast_addr), bound_port);
        let interval = self.config.heartbeat_interval();
        self.tasks.push(tokio::spawn(async move {
            broadcast_loop(send_socket, heartbeat, dest, interval).await
        }));

        let table = self.table.clone();
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            listen_loop(recv_socket, table, events, local).await
        }));

        let table = self.table.clone();
        let events = self.events.clone();
        let every = self.config.cleanup_interval();
        self.tasks.push(tokio::spawn(async move {
            cleanup_loop(table, events, every).await
        }));

        tracing::info!(
            "presence started on {:?} as {:?}, heartbeat to {} every {:?}",
            self.local_addr,
            self.config.username,
            dest,
            interval
        );
        Ok(())
    }

    /// Stop all loops. Returns once both sockets are closed.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.local_addr = None;
        tracing::info!("presence stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| !t.is_finished())
    }

    /// Address the heartbeat listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the peers currently considered reachable.
    pub async fn peers(&self) -> Vec<Peer> {
        self.table.lock().await.snapshot()
    }
}

impl Drop for PresenceService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn bind_udp(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn bind_broadcast() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    std_sock.set_broadcast(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Addresses of this host's interfaces, used to drop our own heartbeats.
fn local_interface_addrs() -> HashSet<IpAddr> {
    match local_ip_address::list_afinet_netifas() {
        Ok(list) => list.into_iter().map(|(_, ip)| ip).collect(),
        Err(e) => {
            tracing::warn!("cannot list local interfaces, own heartbeats will not be filtered: {}", e);
            HashSet::new()
        }
    }
}

async fn broadcast_loop(socket: UdpSocket, heartbeat: Vec<u8>, dest: SocketAddr, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = socket.send_to(&heartbeat, dest).await {
            tracing::warn!("heartbeat to {} failed: {}", dest, e);
        }
    }
}

async fn listen_loop(
    socket: UdpSocket,
    table: Arc<Mutex<PeerTable>>,
    events: EventSender,
    local: HashSet<IpAddr>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("discovery receive failed, retrying: {}", e);
                tokio::time::sleep(RECV_RETRY_DELAY).await;
                continue;
            }
        };
        let discovered = {
            let mut t = table.lock().await;
            handle_datagram(&mut t, &buf[..n], from, &local, Instant::now())
        };
        if let Some(peer) = discovered {
            tracing::info!("peer discovered: {} ({})", peer.display_name, peer.ip);
            let _ = events
                .send(NodeEvent::PeerDiscovered {
                    ip: peer.ip,
                    name: peer.display_name,
                })
                .await;
        }
    }
}

/// Apply one received datagram to the table. The peer is keyed by the UDP
/// source address; `sender_ip` inside the envelope is not trusted.
fn handle_datagram(
    table: &mut PeerTable,
    bytes: &[u8],
    from: SocketAddr,
    local: &HashSet<IpAddr>,
    now: Instant,
) -> Option<Peer> {
    if local.contains(&from.ip()) {
        return None;
    }
    let envelope = match decode(bytes) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("dropping datagram from {}: {}", from, e);
            return None;
        }
    };
    if envelope.kind() != MessageType::Discovery {
        tracing::debug!("ignoring {} datagram from {}", envelope.kind(), from);
        return None;
    }
    table.observe(from.ip(), envelope.sender_name(), now)
}

async fn cleanup_loop(table: Arc<Mutex<PeerTable>>, events: EventSender, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let lost = table.lock().await.expire(Instant::now());
        for peer in lost {
            tracing::info!("peer lost: {} ({})", peer.display_name, peer.ip);
            let _ = events.send(NodeEvent::PeerLost { ip: peer.ip }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 5000)
    }

    fn heartbeat(name: &str) -> Vec<u8> {
        lanchat_core::encode(&Envelope::discovery(name)).unwrap()
    }

    #[test]
    fn keyed_by_source_address_not_payload() {
        let mut table = PeerTable::new(Duration::from_secs(6));
        let spoofed = Envelope::discovery("alice").with_sender_ip("10.9.9.9");
        let bytes = lanchat_core::encode(&spoofed).unwrap();
        let peer = handle_datagram(&mut table, &bytes, from("10.0.0.5"), &HashSet::new(), Instant::now())
            .unwrap();
        assert_eq!(peer.ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(peer.display_name, "alice");
    }

    #[test]
    fn second_heartbeat_is_silent() {
        let mut table = PeerTable::new(Duration::from_secs(6));
        let now = Instant::now();
        let none = HashSet::new();
        assert!(handle_datagram(&mut table, &heartbeat("a"), from("10.0.0.5"), &none, now).is_some());
        assert!(handle_datagram(&mut table, &heartbeat("a"), from("10.0.0.5"), &none, now).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn malformed_and_non_discovery_dropped() {
        let mut table = PeerTable::new(Duration::from_secs(6));
        let none = HashSet::new();
        let now = Instant::now();
        assert!(handle_datagram(&mut table, b"not json", from("10.0.0.5"), &none, now).is_none());
        let text = lanchat_core::encode(&Envelope::text("a", "hi")).unwrap();
        assert!(handle_datagram(&mut table, &text, from("10.0.0.5"), &none, now).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn failed_heartbeat_send_keeps_broadcasting() {
        let socket = bind_broadcast().unwrap();
        // An IPv6 destination cannot be reached from an IPv4 socket, so every send fails.
        let dest: SocketAddr = "[::1]:5000".parse().unwrap();
        let looping = broadcast_loop(socket, heartbeat("a"), dest, Duration::from_millis(10));
        assert!(tokio::time::timeout(Duration::from_millis(100), looping)
            .await
            .is_err());
    }

    #[test]
    fn own_addresses_filtered() {
        let mut table = PeerTable::new(Duration::from_secs(6));
        let local: HashSet<IpAddr> = ["192.168.1.20".parse().unwrap()].into_iter().collect();
        let now = Instant::now();
        assert!(handle_datagram(&mut table, &heartbeat("me"), from("192.168.1.20"), &local, now).is_none());
        assert!(handle_datagram(&mut table, &heartbeat("you"), from("192.168.1.21"), &local, now).is_some());
    }
}
