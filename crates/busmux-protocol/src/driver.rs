use std::io::{ErrorKind, Read, Write};

use bytes::BytesMut;
use tracing::{debug, info};

use busmux_frame::{max_frame_size, FrameConfig, FrameError, FrameWriter};

use crate::error::{ProtocolError, Result};
use crate::register::RegisterServer;
use crate::server::{MultiplexServer, Received};

const READ_CHUNK_SIZE: usize = 256;

/// Runs a [`MultiplexServer`] over a blocking byte stream.
pub struct ServerDriver<S, R> {
    io: FrameWriter<S>,
    rx: BytesMut,
    server: MultiplexServer,
    registers: R,
}

impl<S: Read + Write, R: RegisterServer> ServerDriver<S, R> {
    pub fn new(server: MultiplexServer, stream: S, registers: R) -> Self {
        let buffer_size = server.options().buffer_size;
        let config = FrameConfig {
            max_payload_size: buffer_size,
            ..FrameConfig::default()
        };
        Self {
            io: FrameWriter::with_config(stream, config),
            rx: BytesMut::with_capacity(max_frame_size(buffer_size) + READ_CHUNK_SIZE),
            server,
            registers,
        }
    }

    /// Block until one frame (or one damaged frame) has been handled.
    ///
    /// Returns `ProtocolError::Disconnected` at end of stream. Read timeouts
    /// on the stream surface as `Frame(Io(..))` with `WouldBlock`/`TimedOut`.
    pub fn poll_once(&mut self) -> Result<()> {
        loop {
            match self.server.receive(&mut self.rx, &mut self.registers) {
                Received::Reply(reply) => {
                    let written = self.io.write_raw(reply);
                    self.server.reply_sent();
                    return Ok(written?);
                }
                Received::Handled => return Ok(()),
                Received::Incomplete => {}
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.io.get_mut().read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err).into()),
            };
            if read == 0 {
                if !self.rx.is_empty() {
                    debug!(len = self.rx.len(), "discarding partial frame at end of stream");
                    self.rx.clear();
                }
                return Err(ProtocolError::Disconnected("end of stream".into()));
            }
            self.rx.extend_from_slice(&chunk[..read]);
        }
    }

    /// Serve until the stream closes.
    pub fn run(&mut self) -> Result<()> {
        self.run_until(|_| true)
    }

    /// Serve until the stream closes or `keep_going` returns false.
    ///
    /// `keep_going` runs after every handled frame and every read timeout,
    /// which is where the application services its tunnels.
    pub fn run_until(&mut self, mut keep_going: impl FnMut(&mut Self) -> bool) -> Result<()> {
        loop {
            match self.poll_once() {
                Ok(()) => {}
                Err(ProtocolError::Disconnected(reason)) => {
                    info!(%reason, "bus stream closed");
                    return Ok(());
                }
                Err(ProtocolError::Frame(FrameError::Io(err)))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => return Err(err),
            }
            if !keep_going(self) {
                return Ok(());
            }
        }
    }

    /// Send bytes to the master outside of framing.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.io.write_raw(bytes)?)
    }

    pub fn server(&self) -> &MultiplexServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut MultiplexServer {
        &mut self.server
    }

    pub fn registers(&self) -> &R {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut R {
        &mut self.registers
    }

    pub fn get_ref(&self) -> &S {
        self.io.get_ref()
    }

    pub fn into_parts(self) -> (MultiplexServer, S, R) {
        (self.server, self.io.into_inner(), self.registers)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use bytes::Bytes;

    use busmux_frame::{encode_frame, parse_frame, FrameDecoder};

    use super::*;
    use crate::register::RegisterBank;
    use crate::reply::Reply;
    use crate::server::ServerOptions;
    use crate::value::Value;

    /// Reads from a script, collects writes.
    struct Script {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
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

    fn request(rr: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(0, rr, 1, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    fn driver(input: Vec<u8>) -> ServerDriver<Script, RegisterBank> {
        let mut bank = RegisterBank::new();
        bank.define(1, 1i8).define(2, 2i8);
        let server = MultiplexServer::new(ServerOptions::default()).unwrap();
        let stream = Script {
            input: Cursor::new(input),
            output: Vec::new(),
        };
        ServerDriver::new(server, stream, bank)
    }

    fn replies(output: &[u8]) -> Vec<Reply> {
        let mut buf = BytesMut::from(output);
        let mut decoder = FrameDecoder::new(256);
        let mut replies = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf).unwrap() {
            replies.push(Reply::parse(&frame.payload).unwrap());
        }
        replies
    }

    #[test]
    fn run_answers_every_request_then_stops_at_eof() {
        let mut input = request(false, &[0x18, 0x01]);
        input.extend(request(false, &[0x10, 0x02, 0x09]));
        input.extend(request(false, &[0x18, 0x02]));

        let mut driver = driver(input);
        driver.run().unwrap();

        let (server, stream, bank) = driver.into_parts();
        let replies = replies(&stream.output);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].read_result(1), Some(Ok(Value::Int8(1))));
        assert_eq!(replies[1].read_result(2), Some(Ok(Value::Int8(9))));
        assert_eq!(bank.get(2), Some(Value::Int8(9)));
        assert_eq!(server.stats().total(), 0);
    }

    #[test]
    fn poll_once_reports_disconnect() {
        let mut driver = driver(Vec::new());
        assert!(matches!(
            driver.poll_once(),
            Err(ProtocolError::Disconnected(_))
        ));
    }

    #[test]
    fn run_until_stops_when_asked() {
        let mut input = request(true, &[]);
        input.extend(request(true, &[]));
        let mut driver = driver(input);
        let mut polls = 0;
        driver
            .run_until(|_| {
                polls += 1;
                false
            })
            .unwrap();
        assert_eq!(polls, 1);
        assert_eq!(replies(&driver.get_ref().output).len(), 1);
    }

    #[test]
    fn raw_bytes_bypass_framing() {
        let mut driver = driver(Vec::new());
        driver.write_raw(b"boot ok\n").unwrap();
        assert_eq!(driver.get_ref().output, b"boot ok\n");
    }

    #[test]
    fn replies_carry_node_id() {
        let mut driver = driver(request(true, &[]));
        driver.server_mut().set_id(3).unwrap();
        // Frame was addressed to 1, so after the id change it is foreign.
        driver.poll_once().unwrap();
        assert_eq!(driver.server().stats().wrong_id, 1);
        assert!(driver.get_ref().output.is_empty());

        let mut buf = BytesMut::new();
        encode_frame(0, true, 3, &[], &mut buf).unwrap();
        let mut driver = ServerDriver::new(
            driver.into_parts().0,
            Script {
                input: Cursor::new(buf.to_vec()),
                output: Vec::new(),
            },
            RegisterBank::new(),
        );
        driver.poll_once().unwrap();
        let reply = parse_frame(&driver.get_ref().output).unwrap();
        assert_eq!(reply.source_id, 3);
        assert_eq!(reply.payload, Bytes::new());
    }
}
