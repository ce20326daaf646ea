//! Framing: length-prefix (4 bytes BE) + JSON envelope body.

use crate::protocol::{self, DecodeError, EncodeError, Envelope};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an envelope into a single frame: 4 bytes BE length + body.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let body = protocol::encode(envelope)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Error encoding an envelope into a frame (codec or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let envelope = protocol::decode(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((envelope, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or codec failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared frame length {0} exceeds limit")]
    TooLarge(u32),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
