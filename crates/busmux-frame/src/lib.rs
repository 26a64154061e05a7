//! Checksummed, addressed framing for the busmux multi-drop protocol.
//!
//! Every frame on the bus carries:
//! - A 2-byte header (0xab54, least significant byte first) for stream synchronization
//! - A source byte: 7-bit sender id plus a response-requested flag in bit 7
//! - A destination byte
//! - A varuint payload length, the payload, and a CRC-16 trailer
//!
//! Decoding is incremental: feed bytes as they arrive, get whole frames out.

pub mod checksum;
pub mod codec;
pub mod decoder;
pub mod error;
pub mod reader;
pub mod varuint;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

pub use checksum::{crc16, frame_checksum, Crc16};
pub use codec::{
    encode_frame, max_frame_size, parse_frame, Frame, FrameConfig, CRC_SIZE, DEFAULT_MAX_PAYLOAD,
    HEADER, HEADER_BYTES, HEADER_SIZE, MAX_ID, MIN_FRAME_SIZE,
};
pub use decoder::FrameDecoder;
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use varuint::{
    decode_varuint, encoded_len, get_varuint, put_varuint, VaruintError, MAX_VARUINT_SIZE,
};
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use async_codec::{MultiplexCodec, Received};
