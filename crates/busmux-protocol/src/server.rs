//! The node side of the protocol: a sans-IO state machine that turns
//! received bytes into register operations, tunnel traffic and reply frames.

use bytes::BytesMut;
use tracing::{debug, info, warn};

use busmux_frame::{encode_frame, max_frame_size, Frame, FrameDecoder, FrameError};

use crate::config::{ConfigStore, NodeConfig};
use crate::dispatch;
use crate::error::{Result, SubframeError};
use crate::register::RegisterServer;
use crate::reply::ReplyWriter;
use crate::stats::Stats;
use crate::tunnel::{RingBuffer, TunnelHandle, TunnelMux, TunnelStream};

/// Construction-time limits for a [`MultiplexServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Largest payload accepted or produced; also the size of each tunnel
    /// ring buffer and of the unknown-byte capture.
    pub buffer_size: usize,
    /// Number of tunnel channel slots.
    pub max_tunnel_streams: usize,
    /// Id used when the config store has nothing saved.
    pub default_id: u8,
    /// Destination id every node dispatches but never answers.
    pub broadcast_id: Option<u8>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            max_tunnel_streams: 1,
            default_id: NodeConfig::DEFAULT_ID,
            broadcast_id: None,
        }
    }
}

impl ServerOptions {
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn max_tunnel_streams(mut self, max_tunnel_streams: usize) -> Self {
        self.max_tunnel_streams = max_tunnel_streams;
        self
    }

    pub fn default_id(mut self, default_id: u8) -> Self {
        self.default_id = default_id;
        self
    }

    pub fn broadcast_id(mut self, broadcast_id: Option<u8>) -> Self {
        self.broadcast_id = broadcast_id;
        self
    }
}

/// Where the server is in handling the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    AccumulatingFrame,
    Validating,
    Dispatching,
    ComposingReply,
    /// A reply was handed out and has not been confirmed written.
    Sending,
}

/// Result of feeding bytes to [`MultiplexServer::receive`].
#[derive(Debug, PartialEq, Eq)]
pub enum Received<'a> {
    /// No complete frame yet.
    Incomplete,
    /// A frame (or a damaged one) was consumed and needs no answer.
    Handled,
    /// A frame was consumed; write these bytes back to the master.
    Reply(&'a [u8]),
}

pub struct MultiplexServer {
    options: ServerOptions,
    config: NodeConfig,
    store: Option<Box<dyn ConfigStore>>,
    decoder: FrameDecoder,
    state: ServerState,
    stats: Stats,
    tunnels: TunnelMux,
    reply: ReplyWriter,
    tx: BytesMut,
    unknown: RingBuffer,
}

impl MultiplexServer {
    /// A server whose id starts at `options.default_id` and is not persisted.
    pub fn new(options: ServerOptions) -> Result<Self> {
        let config = NodeConfig::new(options.default_id)?;
        Ok(Self::build(options, config, None))
    }

    /// A server that loads its id from `store` and saves changes back.
    pub fn with_store(options: ServerOptions, mut store: Box<dyn ConfigStore>) -> Result<Self> {
        let config = match store.load()? {
            Some(config) => config,
            None => NodeConfig::new(options.default_id)?,
        };
        config.validate()?;
        Ok(Self::build(options, config, Some(store)))
    }

    fn build(options: ServerOptions, config: NodeConfig, store: Option<Box<dyn ConfigStore>>) -> Self {
        info!(
            id = config.id,
            buffer_size = options.buffer_size,
            tunnels = options.max_tunnel_streams,
            "multiplex server ready"
        );
        Self {
            decoder: FrameDecoder::new(options.buffer_size),
            tunnels: TunnelMux::new(options.max_tunnel_streams, options.buffer_size),
            reply: ReplyWriter::new(options.buffer_size),
            tx: BytesMut::with_capacity(max_frame_size(options.buffer_size)),
            unknown: RingBuffer::with_capacity(options.buffer_size),
            state: ServerState::Idle,
            stats: Stats::default(),
            options,
            config,
            store,
        }
    }

    pub fn id(&self) -> u8 {
        self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Change the node id, persisting it if the server has a store.
    pub fn set_id(&mut self, id: u8) -> Result<()> {
        let config = NodeConfig::new(id)?;
        if let Some(store) = self.store.as_mut() {
            store.store(&config)?;
        }
        info!(old = self.config.id, new = id, "node id changed");
        self.config = config;
        Ok(())
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bind `channel` to a tunnel slot ahead of the first client poll.
    pub fn open_tunnel(&mut self, channel: u32) -> Option<TunnelHandle> {
        self.tunnels.open(channel)
    }

    /// Handle of an already bound channel.
    pub fn tunnel_handle(&self, channel: u32) -> Option<TunnelHandle> {
        self.tunnels.lookup(channel)
    }

    pub fn tunnel(&mut self, handle: TunnelHandle) -> TunnelStream<'_> {
        self.tunnels.stream(handle)
    }

    pub fn tunnels(&self) -> &TunnelMux {
        &self.tunnels
    }

    /// Drain captured bytes that were not part of a frame for this node.
    pub fn read_unknown(&mut self, buf: &mut [u8]) -> usize {
        self.unknown.pop(buf)
    }

    pub fn unknown_len(&self) -> usize {
        self.unknown.len()
    }

    /// Consume bytes from the front of `src` until one frame has been handled
    /// or more input is needed.
    pub fn receive<R: RegisterServer + ?Sized>(
        &mut self,
        src: &mut BytesMut,
        registers: &mut R,
    ) -> Received<'_> {
        self.state = ServerState::AccumulatingFrame;
        let unknown = &mut self.unknown;
        let decoded = self.decoder.decode_with(src, |skipped| {
            capture(unknown, skipped);
        });
        match decoded {
            Ok(None) => {
                if src.is_empty() {
                    self.state = ServerState::Idle;
                }
                Received::Incomplete
            }
            Err(err) => {
                self.record_fault(&err);
                Received::Handled
            }
            Ok(Some(frame)) => match self.process_frame(&frame, registers) {
                Some(reply) => Received::Reply(reply),
                None => Received::Handled,
            },
        }
    }

    /// Capture bytes that a decoder outside the server skipped while
    /// hunting for a frame header.
    pub fn record_discarded(&mut self, bytes: &[u8]) {
        capture(&mut self.unknown, bytes);
    }

    /// Count a framing fault reported by a decoder outside the server.
    pub fn record_fault(&mut self, err: &FrameError) {
        match err {
            FrameError::ChecksumMismatch { expected, actual } => {
                warn!(expected, actual, "dropping frame with bad checksum");
                Stats::bump(&mut self.stats.checksum_mismatch);
            }
            FrameError::ReceiveOverrun { .. } | FrameError::MalformedVaruint(_) => {
                warn!(error = %err, "dropping oversized frame");
                Stats::bump(&mut self.stats.receive_overrun);
            }
            other => debug!(error = %other, "frame fault"),
        }
        self.state = ServerState::Idle;
    }

    /// Handle one decoded frame. Returns the encoded reply frame, if any.
    pub fn process_frame<R: RegisterServer + ?Sized>(
        &mut self,
        frame: &Frame,
        registers: &mut R,
    ) -> Option<&[u8]> {
        self.state = ServerState::Validating;
        let broadcast = self.options.broadcast_id == Some(frame.destination_id)
            && frame.destination_id != self.config.id;
        if frame.destination_id != self.config.id && !broadcast {
            Stats::bump(&mut self.stats.wrong_id);
            self.capture_frame(frame);
            self.state = ServerState::Idle;
            return None;
        }

        let plan = match dispatch::plan(&frame.payload, self.options.buffer_size) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(source = frame.source_id, error = %err, "dropping malformed request");
                Stats::bump(&mut self.stats.malformed_subframe);
                self.state = ServerState::Idle;
                return None;
            }
        };
        if let Some(tag) = plan.unknown_tag {
            let err = SubframeError::Unknown {
                tag,
                offset: plan.executable,
            };
            debug!(source = frame.source_id, error = %err, "request truncated");
            Stats::bump(&mut self.stats.unknown_subframe);
        }

        self.state = ServerState::Dispatching;
        self.reply.clear();
        dispatch::execute(
            &frame.payload,
            &plan,
            registers,
            &mut self.tunnels,
            &mut self.reply,
        );

        self.state = ServerState::ComposingReply;
        self.reply.finish();
        if self.reply.omitted() > 0 {
            Stats::bump(&mut self.stats.reply_overflow);
            warn!(
                omitted = self.reply.omitted(),
                limit = self.options.buffer_size,
                "reply subframes did not fit"
            );
        }
        if broadcast || !(frame.response_requested || plan.needs_reply()) {
            self.state = ServerState::Idle;
            return None;
        }

        self.tx.clear();
        let payload = self.reply.as_bytes();
        if let Err(err) = encode_frame(self.config.id, false, frame.source_id, payload, &mut self.tx)
        {
            warn!(error = %err, "could not encode reply");
            self.state = ServerState::Idle;
            return None;
        }
        debug!(
            destination = frame.source_id,
            len = self.tx.len(),
            "reply ready"
        );
        self.state = ServerState::Sending;
        Some(&self.tx[..])
    }

    /// Note that the last reply has been written out.
    pub fn reply_sent(&mut self) {
        if self.state == ServerState::Sending {
            self.state = ServerState::Idle;
        }
    }

    fn capture_frame(&mut self, frame: &Frame) {
        if self.unknown.capacity() == 0 {
            return;
        }
        self.tx.clear();
        if frame.encode(&mut self.tx).is_ok() {
            capture(&mut self.unknown, &self.tx);
        }
    }
}

fn capture(unknown: &mut RingBuffer, bytes: &[u8]) {
    let kept = unknown.push(bytes);
    if kept < bytes.len() {
        debug!(dropped = bytes.len() - kept, "unknown-byte capture full");
    }
}

impl std::fmt::Debug for MultiplexServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexServer")
            .field("options", &self.options)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
