//! Byte-stream endpoints for the busmux protocol.
//!
//! The multiplex protocol runs over any ordered byte stream. On real hardware
//! that is a serial line; on a development host it is usually a Unix domain
//! socket standing in for the bus, or a TCP connection to a serial bridge
//! (ser2net and friends).
//!
//! This is the lowest layer of busmux. Everything else builds on top of
//! the [`BusStream`] type provided here.

pub mod endpoint;
pub mod error;
pub mod listener;
pub mod stream;

#[cfg(feature = "async")]
pub mod nonblocking;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use listener::{connect, BusListener};
pub use stream::BusStream;

#[cfg(feature = "async")]
pub use nonblocking::{connect_async, AsyncBusStream};
