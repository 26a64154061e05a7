use bytes::{BufMut, Bytes, BytesMut};

use crate::checksum::frame_checksum;
use crate::error::{FrameError, Result};
use crate::varuint::{decode_varuint, encoded_len, put_varuint, MAX_VARUINT_SIZE};

/// Frame header constant, sent least significant byte first.
pub const HEADER: u16 = 0xab54;

/// The header as it appears on the wire.
pub const HEADER_BYTES: [u8; 2] = HEADER.to_le_bytes();

/// Header (2) + source (1) + destination (1).
pub const HEADER_SIZE: usize = 4;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 2;

/// Highest node id; ids are 7 bits wide.
pub const MAX_ID: u8 = 0x7f;

/// Set in the source byte when the sender wants a reply.
pub const RESPONSE_REQUESTED: u8 = 0x80;

/// Default maximum payload size, matching a typical node's receive buffer.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

/// Smallest possible frame: header, one byte length, no payload, checksum.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1 + CRC_SIZE;

/// Largest frame that can carry `max_payload` bytes.
pub const fn max_frame_size(max_payload: usize) -> usize {
    HEADER_SIZE + MAX_VARUINT_SIZE + max_payload + CRC_SIZE
}

/// One addressed, checksum-verified unit of bus traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender id (7 bits).
    pub source_id: u8,
    /// Whether the sender asked for a reply.
    pub response_requested: bool,
    /// Addressed node id.
    pub destination_id: u8,
    /// Zero or more subframes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame that does not request a reply.
    pub fn new(source_id: u8, destination_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            source_id,
            response_requested: false,
            destination_id,
            payload: payload.into(),
        }
    }

    /// Mark the frame as requesting a reply.
    pub fn with_response_requested(mut self) -> Self {
        self.response_requested = true;
        self
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + encoded_len(self.payload.len() as u32) + self.payload.len() + CRC_SIZE
    }

    /// Encode this frame, appending to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        encode_frame(
            self.source_id,
            self.response_requested,
            self.destination_id,
            &self.payload,
            dst,
        )
    }
}

/// Encode a frame into the wire format, appending to `dst`.
///
/// Wire format:
/// ```text
/// ┌───────────┬──────────┬──────────┬──────────┬─────────┬──────────┐
/// │ Header    │ Source   │ Dest     │ Length   │ Payload │ CRC-16   │
/// │ 0x54 0xab │ R|id(7)  │ id       │ varuint  │         │ (2B LE)  │
/// └───────────┴──────────┴──────────┴──────────┴─────────┴──────────┘
/// ```
///
/// `R` is the response-requested flag. The checksum covers every preceding
/// byte plus two zero bytes in place of itself.
pub fn encode_frame(
    source_id: u8,
    response_requested: bool,
    destination_id: u8,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    if source_id > MAX_ID {
        return Err(FrameError::InvalidId(source_id));
    }
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }

    let start = dst.len();
    dst.reserve(HEADER_SIZE + MAX_VARUINT_SIZE + payload.len() + CRC_SIZE);
    dst.put_slice(&HEADER_BYTES);
    dst.put_u8(if response_requested {
        source_id | RESPONSE_REQUESTED
    } else {
        source_id
    });
    dst.put_u8(destination_id);
    put_varuint(dst, payload.len() as u32);
    dst.put_slice(payload);
    let checksum = frame_checksum(&dst[start..]);
    dst.put_u16_le(checksum);
    Ok(())
}

/// Parse one complete, already delimited frame.
///
/// The checksum is verified before any other field is interpreted, so
/// corruption anywhere in `bytes` reports [`FrameError::ChecksumMismatch`].
pub fn parse_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < MIN_FRAME_SIZE {
        return Err(FrameError::FrameTooShort(bytes.len()));
    }

    let (body, trailer) = bytes.split_at(bytes.len() - CRC_SIZE);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let actual = frame_checksum(body);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    if body[..2] != HEADER_BYTES {
        return Err(FrameError::InvalidHeader);
    }

    let (declared, used) = decode_varuint(&body[HEADER_SIZE..])?;
    let payload = &body[HEADER_SIZE + used..];
    if declared as usize != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared: declared as usize,
            actual: payload.len(),
        });
    }

    Ok(Frame {
        source_id: body[2] & MAX_ID,
        response_requested: body[2] & RESPONSE_REQUESTED != 0,
        destination_id: body[3],
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Configuration for the frame reader and writer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 256.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
