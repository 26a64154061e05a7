//! Register RPC and tunneled byte streams over the busmux frame protocol.
//!
//! A [`MultiplexServer`] answers one node id on a shared bus: it applies
//! register reads and writes to a [`RegisterServer`] and moves tunnel bytes
//! between the master and [`TunnelStream`]s. A [`MultiplexClient`] is the
//! master that talks to such nodes one request at a time.

pub mod client;
pub mod config;
mod dispatch;
pub mod driver;
pub mod error;
pub mod register;
pub mod reply;
pub mod server;
pub mod stats;
pub mod subframe;
pub mod tunnel;
pub mod value;

#[cfg(feature = "async")]
pub mod async_client;
#[cfg(feature = "async")]
pub mod async_driver;

pub use client::{
    ClientOptions, FixedAttempts, MultiplexClient, NoRetry, RequestBuilder, RetryPolicy,
};
pub use config::{ConfigStore, JsonFileConfigStore, MemoryConfigStore, NodeConfig};
pub use driver::ServerDriver;
pub use error::{ClientError, ClientResult, ProtocolError, Result, SubframeError};
pub use register::{RegisterBank, RegisterError, RegisterServer};
pub use reply::{Reply, ReplyItem};
pub use server::{MultiplexServer, Received, ServerOptions, ServerState};
pub use stats::Stats;
pub use subframe::{Subframe, SubframeIter, Values};
pub use tunnel::{TunnelHandle, TunnelMux, TunnelStream};
pub use value::{Register, Value, ValueKind};

#[cfg(feature = "async")]
pub use async_client::AsyncMultiplexClient;
#[cfg(feature = "async")]
pub use async_driver::serve_async;
