//! LAN chat protocol reference implementation.
//! Host-driven: no I/O; host passes bytes and timestamps and receives envelopes and events.

pub mod peers;
pub mod protocol;
pub mod wire;

pub use peers::{Peer, PeerTable};
pub use protocol::{
    decode, encode, DecodeError, EncodeError, Envelope, FileOffer, MessageType, CLEANUP_INTERVAL,
    DISCOVERY_PORT, EXPIRY_FACTOR, HEARTBEAT_INTERVAL, TRANSPORT_PORT,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN};
