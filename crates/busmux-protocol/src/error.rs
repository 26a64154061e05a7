use std::path::PathBuf;
use std::time::Duration;

use crate::value::Register;

/// Errors raised by the server side: configuration and driver I/O.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] busmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] busmux_frame::FrameError),

    /// A node id outside 0..=127.
    #[error("invalid node id {0} (max 127)")]
    InvalidId(u8),

    /// Reading or writing a persisted node config failed.
    #[error("config file {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The byte stream ended.
    #[error("bus disconnected: {0}")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A subframe sequence that cannot be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubframeError {
    /// A type tag this node does not recognise. Everything before `offset`
    /// parsed fine.
    #[error("unknown subframe type {tag:#04x} at offset {offset}")]
    Unknown { tag: u32, offset: usize },

    /// A recognised subframe whose body is truncated or inconsistent, or a
    /// payload that breaks the tunnel exclusivity rule.
    #[error("malformed subframe at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// Errors raised by [`MultiplexClient`](crate::client::MultiplexClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] busmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] busmux_frame::FrameError),

    /// A reply is still expected from an earlier request.
    #[error("request to node {destination} is still awaiting a reply")]
    RequestOutstanding { destination: u8 },

    /// `receive_reply` was called with nothing in flight.
    #[error("no request is awaiting a reply")]
    NoRequestOutstanding,

    /// The addressed node did not answer in time.
    #[error("no reply after {0:?}")]
    Timeout(Duration),

    /// The byte stream ended.
    #[error("bus disconnected: {0}")]
    Disconnected(String),

    /// The reply payload could not be parsed.
    #[error("bad reply: {0}")]
    Subframe(#[from] SubframeError),

    /// The server reported a read error for a register.
    #[error("node refused to read register {register:#x} (code {code})")]
    ReadFailed { register: Register, code: u32 },

    /// The server reported a write error for a register.
    #[error("node refused to write register {register:#x} (code {code})")]
    WriteFailed { register: Register, code: u32 },

    /// The reply carried neither a value nor an error for a requested register.
    #[error("reply is missing register {register:#x}")]
    MissingSubframe { register: Register },

    /// The reply to a tunnel poll had no server-to-client subframe.
    #[error("reply is missing tunnel channel {channel}")]
    MissingTunnel { channel: u32 },

    /// A node id outside 0..=127.
    #[error("invalid node id {0} (max 127)")]
    InvalidId(u8),
}

impl ClientError {
    /// True if repeating the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Frame(err) => err.is_wire_fault(),
            _ => false,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
