//! Multi-drop serial multiplexing: register RPC and tunneled byte streams
//! over one shared, checksummed bus.
//!
//! # Crate Structure
//!
//! - [`transport`]: Byte-stream endpoints (Unix sockets, TCP serial bridges)
//! - [`frame`]: Varuint and CRC-16 framed wire codec
//! - [`protocol`]: Subframes, register RPC, tunnels, server and client
//!
//! The most used protocol types are re-exported at the crate root.

/// Re-export transport types.
pub mod transport {
    pub use busmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use busmux_frame::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use busmux_protocol::*;
}

pub use busmux_frame::{Frame, FrameError};
pub use busmux_protocol::{
    ClientError, ClientOptions, MultiplexClient, MultiplexServer, ProtocolError, RegisterBank,
    RegisterError, RegisterServer, RequestBuilder, ServerDriver, ServerOptions, Stats, Value,
    ValueKind,
};
pub use busmux_transport::{BusListener, BusStream, Endpoint};
