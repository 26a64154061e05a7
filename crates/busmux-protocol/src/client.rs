//! The master side: compose requests, send them to one node at a time and
//! validate what comes back.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use busmux_frame::{encode_frame, max_frame_size, Frame, FrameConfig, FrameError, FrameReader, MAX_ID};
use busmux_transport::{BusStream, Endpoint};

use crate::error::{ClientError, ClientResult};
use crate::reply::Reply;
use crate::stats::Stats;
use crate::subframe::{Subframe, Values};
use crate::value::{Register, Value, ValueKind};

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Id the client sends from; replies are addressed to it.
    pub source_id: u8,
    /// Largest payload sent or accepted.
    pub buffer_size: usize,
    /// How long [`MultiplexClient::receive_reply`] waits.
    pub reply_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            source_id: 0,
            buffer_size: 256,
            reply_timeout: Duration::from_secs(5),
        }
    }
}

/// Decides whether a failed request is sent again.
pub trait RetryPolicy: Send {
    /// `attempt` is 1 for the first try.
    fn should_retry(&mut self, attempt: u32, err: &ClientError) -> bool;
}

/// Never retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&mut self, _attempt: u32, _err: &ClientError) -> bool {
        false
    }
}

/// Up to `n` attempts in total, repeating only transient failures.
#[derive(Debug, Clone, Copy)]
pub struct FixedAttempts(pub u32);

impl RetryPolicy for FixedAttempts {
    fn should_retry(&mut self, attempt: u32, err: &ClientError) -> bool {
        attempt < self.0 && err.is_transient()
    }
}

/// Builds a request payload from register and tunnel operations.
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    payload: BytesMut,
    reads: Vec<(Register, u32)>,
    tunnel: Option<u32>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_single(mut self, register: Register, value: impl Into<Value>) -> Self {
        Subframe::WriteSingle {
            register,
            value: value.into(),
        }
        .encode(&mut self.payload);
        self
    }

    /// Write consecutive registers from `start`. Runs of one kind share a
    /// subframe.
    pub fn write_multiple(mut self, start: Register, values: &[Value]) -> Self {
        let mut register = start;
        for run in values.chunk_by(|a, b| a.kind() == b.kind()) {
            let kind = run[0].kind();
            let mut raw = Vec::with_capacity(run.len() * kind.size());
            for value in run {
                value.encode(&mut raw);
            }
            if let Some(values) = Values::new(kind, &raw) {
                Subframe::WriteMultiple {
                    start: register,
                    values,
                }
                .encode(&mut self.payload);
            }
            register = register.wrapping_add(run.len() as u32);
        }
        self
    }

    pub fn read_single(mut self, register: Register, kind: ValueKind) -> Self {
        Subframe::ReadSingle { register, kind }.encode(&mut self.payload);
        self.reads.push((register, 1));
        self
    }

    pub fn read_multiple(mut self, start: Register, count: u32, kind: ValueKind) -> Self {
        Subframe::ReadMultiple { start, count, kind }.encode(&mut self.payload);
        self.reads.push((start, count));
        self
    }

    /// Poll tunnel `channel`, delivering `data`. A tunnel poll must be the
    /// only subframe in its request.
    pub fn tunnel(mut self, channel: u32, data: &[u8]) -> Self {
        Subframe::ClientToServer { channel, data }.encode(&mut self.payload);
        self.tunnel = Some(channel);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Every register a read in this request covers.
    pub fn read_registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.reads
            .iter()
            .flat_map(|&(start, count)| (0..count).map(move |i| start.wrapping_add(i)))
    }

    pub fn tunnel_channel(&self) -> Option<u32> {
        self.tunnel
    }
}

/// Check that `reply` answers every read and the tunnel poll of `request`.
pub(crate) fn validate_reply(
    request: &RequestBuilder,
    payload: &Bytes,
    stats: &mut Stats,
) -> ClientResult<Reply> {
    let reply = Reply::parse(payload)?;
    for register in request.read_registers() {
        if reply.read_result(register).is_none() {
            Stats::bump(&mut stats.missing_subframe);
            return Err(ClientError::MissingSubframe { register });
        }
    }
    if let Some(channel) = request.tunnel_channel() {
        if reply.tunnel_data(channel).is_none() {
            Stats::bump(&mut stats.missing_subframe);
            return Err(ClientError::MissingTunnel { channel });
        }
    }
    Ok(reply)
}

pub(crate) fn check_request(options: &ClientOptions, destination: u8, payload: &[u8]) -> ClientResult<()> {
    if destination > MAX_ID {
        return Err(ClientError::InvalidId(destination));
    }
    if payload.len() > options.buffer_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: options.buffer_size,
        }
        .into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    destination: u8,
    sent_at: Instant,
}

/// Blocking protocol client. At most one request is outstanding.
pub struct MultiplexClient<S> {
    reader: FrameReader<S>,
    tx: BytesMut,
    options: ClientOptions,
    retry: Box<dyn RetryPolicy>,
    pending: Option<Pending>,
    /// A reply may still arrive for a request that was given up on.
    stale: bool,
    stats: Stats,
}

impl MultiplexClient<BusStream> {
    /// Connect to a bus endpoint. The reply timeout becomes the stream's
    /// read timeout.
    pub fn connect(endpoint: &Endpoint, options: ClientOptions) -> ClientResult<Self> {
        let stream = busmux_transport::connect(endpoint)?;
        let timeout = options.reply_timeout.max(Duration::from_millis(1));
        stream.set_read_timeout(Some(timeout))?;
        Ok(Self::new(stream, options))
    }
}

impl<S: Read + Write> MultiplexClient<S> {
    pub fn new(stream: S, options: ClientOptions) -> Self {
        let config = FrameConfig {
            max_payload_size: options.buffer_size,
            ..FrameConfig::default()
        };
        Self {
            reader: FrameReader::with_config(stream, config),
            tx: BytesMut::with_capacity(max_frame_size(options.buffer_size)),
            options,
            retry: Box::new(NoRetry),
            pending: None,
            stale: false,
            stats: Stats::default(),
        }
    }

    pub fn with_retry(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Box::new(policy);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Reply validation counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// Send one frame. With `response_requested` the client then waits for
    /// a reply before it will send again.
    ///
    /// After a cancel or timeout, frames already on the way are read and
    /// dropped first, so a late reply is not taken for the next one. This
    /// waits until the stream goes quiet, at most `reply_timeout`.
    pub fn send_request(
        &mut self,
        destination: u8,
        payload: &[u8],
        response_requested: bool,
    ) -> ClientResult<()> {
        if let Some(pending) = self.pending {
            return Err(ClientError::RequestOutstanding {
                destination: pending.destination,
            });
        }
        check_request(&self.options, destination, payload)?;
        if self.stale {
            self.drain_stale()?;
        }

        self.tx.clear();
        encode_frame(
            self.options.source_id,
            response_requested,
            destination,
            payload,
            &mut self.tx,
        )?;
        let stream = self.reader.get_mut();
        stream.write_all(&self.tx).map_err(FrameError::Io)?;
        stream.flush().map_err(FrameError::Io)?;
        debug!(destination, len = payload.len(), response_requested, "request sent");

        if response_requested {
            self.pending = Some(Pending {
                destination,
                sent_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Wait for the reply to the outstanding request.
    ///
    /// Frames from other nodes or for other clients are skipped, as are
    /// damaged frames. Gives up after `reply_timeout`; the deadline is only
    /// checked when the stream returns, so the stream needs a read timeout.
    pub fn receive_reply(&mut self) -> ClientResult<Frame> {
        let pending = self.pending.ok_or(ClientError::NoRequestOutstanding)?;
        loop {
            match self.reader.read_frame() {
                Ok(frame)
                    if frame.source_id == pending.destination
                        && frame.destination_id == self.options.source_id =>
                {
                    self.pending = None;
                    debug!(source = frame.source_id, len = frame.payload.len(), "reply received");
                    return Ok(frame);
                }
                Ok(frame) => {
                    debug!(
                        source = frame.source_id,
                        destination = frame.destination_id,
                        "skipping unrelated frame"
                    );
                }
                Err(err) if err.is_wire_fault() => {
                    debug!(error = %err, "skipping damaged frame");
                }
                Err(FrameError::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(FrameError::ConnectionClosed) => {
                    self.pending = None;
                    return Err(ClientError::Disconnected("end of stream".into()));
                }
                Err(err) => {
                    self.pending = None;
                    return Err(err.into());
                }
            }

            if pending.sent_at.elapsed() >= self.options.reply_timeout {
                self.pending = None;
                self.stale = true;
                return Err(ClientError::Timeout(self.options.reply_timeout));
            }
        }
    }

    /// Forget the outstanding request. Its reply, if one still comes, is
    /// dropped before the next request is sent.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(destination = pending.destination, "request cancelled");
            self.stale = true;
        }
    }

    fn drain_stale(&mut self) -> ClientResult<()> {
        let started = Instant::now();
        let result = loop {
            if started.elapsed() >= self.options.reply_timeout {
                break Ok(());
            }
            match self.reader.read_frame() {
                Ok(frame) => {
                    debug!(source = frame.source_id, "dropping late frame");
                }
                Err(err) if err.is_wire_fault() => {}
                Err(FrameError::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    break Ok(());
                }
                Err(FrameError::ConnectionClosed) => break Ok(()),
                Err(err) => break Err(err.into()),
            }
        };
        self.reader.discard_buffered();
        self.stale = false;
        result
    }

    /// Send `payload` with the response flag set and wait for the reply,
    /// retrying as the retry policy allows.
    pub fn request(&mut self, destination: u8, payload: &[u8]) -> ClientResult<Frame> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .send_request(destination, payload, true)
                .and_then(|()| self.receive_reply());
            match result {
                Ok(frame) => return Ok(frame),
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    warn!(destination, attempt, error = %err, "retrying request");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Send a composed request and check the reply covers it.
    pub fn query(&mut self, destination: u8, request: &RequestBuilder) -> ClientResult<Reply> {
        let frame = self.request(destination, request.payload())?;
        validate_reply(request, &frame.payload, &mut self.stats)
    }

    pub fn read_register(
        &mut self,
        destination: u8,
        register: Register,
        kind: ValueKind,
    ) -> ClientResult<Value> {
        let values = self.read_registers(destination, register, 1, kind)?;
        values
            .into_iter()
            .next()
            .ok_or(ClientError::MissingSubframe { register })
    }

    /// Read `count` consecutive registers.
    pub fn read_registers(
        &mut self,
        destination: u8,
        start: Register,
        count: u32,
        kind: ValueKind,
    ) -> ClientResult<Vec<Value>> {
        let request = if count == 1 {
            RequestBuilder::new().read_single(start, kind)
        } else {
            RequestBuilder::new().read_multiple(start, count, kind)
        };
        let reply = self.query(destination, &request)?;
        request
            .read_registers()
            .map(|register| match reply.read_result(register) {
                Some(Ok(value)) => Ok(value),
                Some(Err(code)) => Err(ClientError::ReadFailed { register, code }),
                None => Err(ClientError::MissingSubframe { register }),
            })
            .collect()
    }

    /// Write consecutive registers and confirm none were refused.
    pub fn write_registers(
        &mut self,
        destination: u8,
        start: Register,
        values: &[Value],
    ) -> ClientResult<()> {
        let request = match values {
            [value] => RequestBuilder::new().write_single(start, *value),
            _ => RequestBuilder::new().write_multiple(start, values),
        };
        let reply = self.query(destination, &request)?;
        let first = reply.write_errors().next();
        match first {
            Some((register, code)) => Err(ClientError::WriteFailed { register, code }),
            None => Ok(()),
        }
    }

    /// Deliver `data` on a tunnel channel and return what the node had queued.
    pub fn poll_tunnel(&mut self, destination: u8, channel: u32, data: &[u8]) -> ClientResult<Bytes> {
        let request = RequestBuilder::new().tunnel(channel, data);
        let reply = self.query(destination, &request)?;
        reply
            .tunnel_data(channel)
            .cloned()
            .ok_or(ClientError::MissingTunnel { channel })
    }
}

impl<S> std::fmt::Debug for MultiplexClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexClient")
            .field("options", &self.options)
            .field("pending", &self.pending)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{self, Cursor};

    use super::*;

    /// Replays canned replies and records what the client wrote.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    fn wire(source: u8, destination: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(source, false, destination, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client(input: Vec<u8>) -> MultiplexClient<Script> {
        let script = Script {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        MultiplexClient::new(script, ClientOptions::default())
    }

    #[test]
    fn builder_encodes_in_call_order() {
        let request = RequestBuilder::new()
            .write_single(1, 5i8)
            .read_multiple(2, 3, ValueKind::Int8);
        assert_eq!(request.payload(), &[0x10, 0x01, 0x05, 0x1c, 0x02, 0x03]);
        assert_eq!(request.read_registers().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn write_multiple_splits_runs_by_kind() {
        let request = RequestBuilder::new().write_multiple(
            5,
            &[Value::Int8(1), Value::Int8(2), Value::Int16(3)],
        );
        assert_eq!(
            request.payload(),
            &[0x14, 0x05, 0x02, 0x01, 0x02, 0x15, 0x07, 0x01, 0x03, 0x00]
        );
    }

    #[test]
    fn second_request_while_pending_is_refused() {
        let mut client = client(Vec::new());
        client.send_request(1, &[0x18, 0x01], true).unwrap();
        assert!(matches!(
            client.send_request(2, &[], true),
            Err(ClientError::RequestOutstanding { destination: 1 })
        ));
        client.cancel();
        assert!(client.send_request(2, &[], true).is_ok());
    }

    #[test]
    fn fire_and_forget_leaves_nothing_pending() {
        let mut client = client(Vec::new());
        client.send_request(1, &[0x10, 0x01, 0x05], false).unwrap();
        assert!(!client.is_pending());
        assert!(matches!(
            client.receive_reply(),
            Err(ClientError::NoRequestOutstanding)
        ));
    }

    #[test]
    fn request_frame_sets_response_flag() {
        let mut client = client(Vec::new());
        client.send_request(3, &[0x18, 0x01], true).unwrap();
        let sent = busmux_frame::parse_frame(&client.get_ref().output).unwrap();
        assert!(sent.response_requested);
        assert_eq!(sent.source_id, 0);
        assert_eq!(sent.destination_id, 3);
    }

    #[test]
    fn unrelated_frames_are_skipped() {
        let mut client = client(
            [
                wire(7, 0, &[0x20, 0x01, 0x63]),
                wire(3, 5, &[0x20, 0x01, 0x62]),
                wire(3, 0, &[0x20, 0x01, 0x2a]),
            ]
            .concat(),
        );
        let value = client.read_register(3, 1, ValueKind::Int8).unwrap();
        assert_eq!(value, Value::Int8(42));
    }

    #[test]
    fn read_error_becomes_read_failed() {
        let mut client = client(wire(3, 0, &[0x29, 0x01, 0x02]));
        assert!(matches!(
            client.read_register(3, 1, ValueKind::Int8),
            Err(ClientError::ReadFailed {
                register: 1,
                code: 2
            })
        ));
    }

    #[test]
    fn missing_register_is_counted() {
        let mut client = client(wire(3, 0, &[0x20, 0x02, 0x01]));
        assert!(matches!(
            client.read_registers(3, 1, 2, ValueKind::Int8),
            Err(ClientError::MissingSubframe { register: 1 })
        ));
        assert_eq!(client.stats().missing_subframe, 1);
    }

    /// A node that answers each written frame with the next queued reply.
    /// Reads with nothing queued time out.
    struct Bus {
        readable: VecDeque<u8>,
        answers: VecDeque<Vec<u8>>,
    }

    impl Read for Bus {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.readable.is_empty() {
                return Err(io::Error::from(ErrorKind::TimedOut));
            }
            self.readable.read(buf)
        }
    }

    impl Write for Bus {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(answer) = self.answers.pop_front() {
                self.readable.extend(answer);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn bus_client(answers: Vec<Vec<u8>>) -> MultiplexClient<Bus> {
        let bus = Bus {
            readable: VecDeque::new(),
            answers: answers.into(),
        };
        MultiplexClient::new(bus, ClientOptions::default())
    }

    #[test]
    fn late_reply_after_cancel_is_not_taken_for_the_next() {
        let mut client = bus_client(vec![
            wire(3, 0, &[0x20, 0x01, 11]),
            wire(3, 0, &[0x20, 0x02, 22]),
        ]);
        client.send_request(3, &[0x18, 0x01], true).unwrap();
        client.cancel();

        let value = client.read_register(3, 2, ValueKind::Int8).unwrap();
        assert_eq!(value, Value::Int8(22));
        assert!(client.get_ref().readable.is_empty());
    }

    #[test]
    fn late_reply_after_timeout_is_dropped() {
        let options = ClientOptions {
            reply_timeout: Duration::ZERO,
            ..ClientOptions::default()
        };
        let bus = Bus {
            readable: VecDeque::new(),
            answers: VecDeque::from(vec![Vec::new(), wire(3, 0, &[0x20, 0x02, 22])]),
        };
        let mut client = MultiplexClient::new(bus, options);
        client.send_request(3, &[0x18, 0x01], true).unwrap();
        assert!(matches!(client.receive_reply(), Err(ClientError::Timeout(_))));

        // the answer to the first request shows up only now
        client.get_mut().readable.extend(wire(3, 0, &[0x20, 0x01, 11]));
        client.options.reply_timeout = Duration::from_secs(1);
        let value = client.read_register(3, 2, ValueKind::Int8).unwrap();
        assert_eq!(value, Value::Int8(22));
    }

    #[test]
    fn accepted_writes_return_ok() {
        let mut client = client(wire(3, 0, &[]));
        client
            .write_registers(3, 5, &[Value::Int8(1), Value::Int8(2)])
            .unwrap();
    }

    #[test]
    fn write_errors_are_reported() {
        let mut client = client(wire(3, 0, &[0x28, 0x06, 0x01]));
        assert!(matches!(
            client.write_registers(3, 5, &[Value::Int8(1), Value::Int8(2)]),
            Err(ClientError::WriteFailed {
                register: 6,
                code: 1
            })
        ));
    }

    #[test]
    fn tunnel_poll_returns_queued_bytes() {
        let mut client = client(wire(3, 0, &[0x41, 0x01, 0x02, b'o', b'k']));
        let data = client.poll_tunnel(3, 1, b"hi").unwrap();
        assert_eq!(&data[..], b"ok");
    }

    #[test]
    fn end_of_stream_is_disconnect() {
        let mut client = client(Vec::new());
        assert!(matches!(
            client.request(3, &[]),
            Err(ClientError::Disconnected(_))
        ));
        assert!(!client.is_pending());
    }

    #[test]
    fn invalid_destination_is_rejected() {
        let mut client = client(Vec::new());
        assert!(matches!(
            client.send_request(128, &[], true),
            Err(ClientError::InvalidId(128))
        ));
    }

    #[test]
    fn fixed_attempts_only_retries_transient_errors() {
        let mut policy = FixedAttempts(3);
        let timeout = ClientError::Timeout(Duration::from_millis(1));
        assert!(policy.should_retry(1, &timeout));
        assert!(policy.should_retry(2, &timeout));
        assert!(!policy.should_retry(3, &timeout));
        assert!(!policy.should_retry(1, &ClientError::NoRequestOutstanding));
        assert!(!NoRetry.should_retry(1, &timeout));
    }
}
