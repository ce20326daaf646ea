//! Node errors. Inbound failures are logged where they happen; these surface
//! from `start()` and from outbound sends.

use std::net::SocketAddr;
use std::path::PathBuf;

use lanchat_core::FrameEncodeError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Well-known port unavailable; the service stays disabled.
    #[error("failed to bind {kind} port {port}: {source}")]
    Bind {
        kind: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    /// Peer unreachable, refused or reset while sending.
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a regular file", .0.display())]
    NotAFile(PathBuf),
}
