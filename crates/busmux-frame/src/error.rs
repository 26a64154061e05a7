use crate::varuint::VaruintError;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A node id does not fit in the 7 bits the source byte reserves for it.
    #[error("invalid node id {0} (max 127)")]
    InvalidId(u8),

    /// An outgoing payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An incoming frame declares a payload larger than the receive buffer.
    #[error("receive overrun ({size} byte payload, max {max})")]
    ReceiveOverrun { size: usize, max: usize },

    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch (frame carries {expected:#06x}, computed {actual:#06x})")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// The payload length field is not a valid varuint.
    #[error("malformed varuint: {0}")]
    MalformedVaruint(#[from] VaruintError),

    /// The frame does not start with the 0xab54 header.
    #[error("invalid frame header (expected 0xab54)")]
    InvalidHeader,

    /// A delimited frame is shorter than the smallest possible frame.
    #[error("frame too short ({0} bytes)")]
    FrameTooShort(usize),

    /// A delimited frame's length field disagrees with its actual size.
    #[error("payload length mismatch (declared {declared}, actual {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for faults caused by bad bytes on the wire rather than by the
    /// stream itself. Receivers drop the offending frame and keep going.
    pub fn is_wire_fault(&self) -> bool {
        matches!(
            self,
            FrameError::ReceiveOverrun { .. }
                | FrameError::ChecksumMismatch { .. }
                | FrameError::MalformedVaruint(_)
                | FrameError::InvalidHeader
                | FrameError::FrameTooShort(_)
                | FrameError::LengthMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
