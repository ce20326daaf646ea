//! LAN chat wire protocol: message types, the envelope, and its JSON codec.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Well-known UDP port for presence heartbeats.
pub const DISCOVERY_PORT: u16 = 5000;
/// Well-known TCP port for message transport.
pub const TRANSPORT_PORT: u16 = 5001;
/// Default heartbeat (DISCOVERY broadcast) interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// A peer is expired after this many silent heartbeat intervals.
pub const EXPIRY_FACTOR: u32 = 3;
/// How often the presence table is scanned for expired peers.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// All envelope types. Rendered on the wire by name, e.g. `"FILE_OFFER"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Presence heartbeat; empty payload.
    Discovery,
    /// Chat text; payload `{text}`.
    Text,
    /// Offer to send a file; payload `{filename, filesize}`.
    FileOffer,
    FileAccept,
    FileReject,
    /// Reserved for the file data path; accepted but never processed.
    FileData,
    FileEnd,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discovery => "DISCOVERY",
            MessageType::Text => "TEXT",
            MessageType::FileOffer => "FILE_OFFER",
            MessageType::FileAccept => "FILE_ACCEPT",
            MessageType::FileReject => "FILE_REJECT",
            MessageType::FileData => "FILE_DATA",
            MessageType::FileEnd => "FILE_END",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The message unit exchanged over both UDP and TCP.
///
/// Immutable once built. `sender_ip` is left empty by senders; receivers
/// replace it with the socket peer address via [`Envelope::with_sender_ip`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    sender_name: String,
    sender_ip: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    payload: Map<String, Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default())
}

/// Payload of a FILE_OFFER envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub filename: String,
    pub filesize: u64,
}

impl Envelope {
    pub fn new(
        kind: MessageType,
        sender_name: impl Into<String>,
        sender_ip: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind,
            sender_name: sender_name.into(),
            sender_ip: sender_ip.into(),
            payload,
        }
    }

    /// Presence heartbeat with an empty payload.
    pub fn discovery(sender_name: impl Into<String>) -> Self {
        Self::new(MessageType::Discovery, sender_name, "", Map::new())
    }

    pub fn text(sender_name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("text".into(), Value::String(text.into()));
        Self::new(MessageType::Text, sender_name, "", payload)
    }

    pub fn file_offer(sender_name: impl Into<String>, filename: impl Into<String>, filesize: u64) -> Self {
        let mut payload = Map::new();
        payload.insert("filename".into(), Value::String(filename.into()));
        payload.insert("filesize".into(), Value::from(filesize));
        Self::new(MessageType::FileOffer, sender_name, "", payload)
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn sender_name(&self) -> &str {
        &self.sender_name
    }

    pub fn sender_ip(&self) -> &str {
        &self.sender_ip
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Same envelope with `sender_ip` replaced (the receiver's view of the sender).
    pub fn with_sender_ip(self, sender_ip: impl Into<String>) -> Self {
        Self {
            sender_ip: sender_ip.into(),
            ..self
        }
    }

    /// Text of a TEXT envelope; None for other types or a malformed payload.
    pub fn text_body(&self) -> Option<&str> {
        if self.kind != MessageType::Text {
            return None;
        }
        self.payload.get("text")?.as_str()
    }

    /// Name and size of a FILE_OFFER envelope.
    pub fn file_offer_body(&self) -> Option<FileOffer> {
        if self.kind != MessageType::FileOffer {
            return None;
        }
        Some(FileOffer {
            filename: self.payload.get("filename")?.as_str()?.to_string(),
            filesize: self.payload.get("filesize")?.as_u64()?,
        })
    }
}

/// Serialize an envelope as UTF-8 JSON.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Error serializing an envelope. Not produced for well-formed envelopes.
#[derive(Debug, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Parse an envelope. Fails on invalid UTF-8, missing fields or an unknown `type`.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    Ok(serde_json::from_str(text)?)
}

/// Error decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("envelope is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}
