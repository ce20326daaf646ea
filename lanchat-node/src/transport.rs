//! Message transport: TCP listener with a reader per inbound connection, and
//! one short-lived connection per outbound envelope.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use lanchat_core::{decode_frame, encode_frame, Envelope, FrameDecodeError, MessageType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::Config;
use crate::error::NodeError;
use crate::events::{EventSender, NodeEvent};

const READ_CHUNK: usize = 4096;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Why an inbound connection was abandoned.
#[derive(Debug, thiserror::Error)]
enum InboundError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
}

pub struct TransportService {
    config: Config,
    events: EventSender,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TransportService {
    pub fn new(config: Config, events: EventSender) -> Self {
        Self {
            config,
            events,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Bind the transport port and launch the accept loop.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.is_running() {
            return Ok(());
        }
        let port = self.config.transport_port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| {
                tracing::error!("failed to bind transport port {}: {}", port, source);
                NodeError::Bind {
                    kind: "transport",
                    port,
                    source,
                }
            })?;
        self.local_addr = listener.local_addr().ok();
        let events = self.events.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, events)));
        tracing::info!("transport listening on {:?}", self.local_addr);
        Ok(())
    }

    /// Close the listener and every open inbound connection.
    pub async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
            self.local_addr = None;
            tracing::info!("transport stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sender that dials peers on the configured transport port. With port 0
    /// configured it dials the port this listener was given, and port 0 if stopped.
    pub fn outbound(&self) -> Outbound {
        let port = match (self.config.transport_port, self.local_addr) {
            (0, Some(addr)) => addr.port(),
            (port, _) => port,
        };
        Outbound::new(self.config.username.clone(), port)
    }
}

impl Drop for TransportService {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            task.abort();
        }
    }
}

/// Handlers live in the JoinSet, so aborting this task also drops every connection.
async fn accept_loop(listener: TcpListener, events: EventSender) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("accepted connection from {}", peer);
                    handlers.spawn(handle_connection(stream, peer, events.clone()));
                }
                // EMFILE and friends clear up once connections close; keep listening.
                Err(e) => {
                    tracing::warn!("accept failed, retrying: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(done) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = done {
                    if e.is_panic() {
                        tracing::error!("connection handler panicked: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, events: EventSender) {
    match read_frames(&mut stream, peer.ip(), &events).await {
        Ok(()) => tracing::debug!("connection from {} closed", peer),
        Err(e) => tracing::warn!("dropping connection from {}: {}", peer, e),
    }
}

/// Read frames until the peer closes. A close in the middle of a frame is a
/// clean end, not an error.
async fn read_frames<R: AsyncRead + Unpin>(
    reader: &mut R,
    peer_ip: IpAddr,
    events: &EventSender,
) -> Result<(), InboundError> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    loop {
        loop {
            match decode_frame(&buf) {
                Ok((envelope, used)) => {
                    buf.drain(..used);
                    dispatch(envelope, peer_ip, events).await;
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => return Err(e.into()),
            }
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(&mut buf).await? == 0 {
            if !buf.is_empty() {
                tracing::debug!("{} closed mid-frame with {} bytes pending", peer_ip, buf.len());
            }
            return Ok(());
        }
    }
}

async fn dispatch(envelope: Envelope, peer_ip: IpAddr, events: &EventSender) {
    let envelope = envelope.with_sender_ip(peer_ip.to_string());
    if envelope.kind() == MessageType::FileData {
        tracing::debug!("ignoring FILE_DATA from {}", peer_ip);
        return;
    }
    if events.send(NodeEvent::Message(envelope)).await.is_err() {
        tracing::debug!("event receiver gone, dropping message from {}", peer_ip);
    }
}

/// Outbound sends. Every call opens, writes one frame and closes its own connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender_name: String,
    port: u16,
}

impl Outbound {
    pub fn new(sender_name: impl Into<String>, port: u16) -> Self {
        Self {
            sender_name: sender_name.into(),
            port,
        }
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub async fn send_text(&self, ip: IpAddr, text: &str) -> Result<(), NodeError> {
        let envelope = Envelope::text(self.sender_name.as_str(), text);
        self.send_envelope(SocketAddr::new(ip, self.port), &envelope)
            .await
    }

    /// Offer a local file by name and size. No file bytes are sent.
    pub async fn send_file_offer(&self, ip: IpAddr, path: &Path) -> Result<(), NodeError> {
        let meta = tokio::fs::metadata(path).await.map_err(|source| NodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !meta.is_file() {
            return Err(NodeError::NotAFile(path.to_path_buf()));
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NodeError::NotAFile(path.to_path_buf()))?;
        let envelope = Envelope::file_offer(self.sender_name.as_str(), filename, meta.len());
        self.send_envelope(SocketAddr::new(ip, self.port), &envelope)
            .await
    }

    pub async fn send_envelope(&self, addr: SocketAddr, envelope: &Envelope) -> Result<(), NodeError> {
        let frame = encode_frame(envelope)?;
        let result = write_frame(addr, &frame).await;
        if let Err(e) = &result {
            tracing::warn!("send {} to {} failed: {}", envelope.kind(), addr, e);
        }
        result.map_err(|source| NodeError::Connection { addr, source })
    }
}

async fn write_frame(addr: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(frame).await?;
    stream.shutdown().await
}
