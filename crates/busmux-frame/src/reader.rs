use std::io::{ErrorKind, Read};

use busmux_transport::BusStream;
use bytes::BytesMut;

use crate::codec::{max_frame_size, Frame, FrameConfig};
use crate::decoder::FrameDecoder;
use crate::error::{FrameError, Result};

const READ_CHUNK_SIZE: usize = 256;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete, checksum
/// verified frames. Wire faults (bad checksum, overrun) are returned as errors
/// after the offending bytes were dropped, so reading can simply continue.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    decoder: FrameDecoder,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(2 * max_frame_size(config.max_payload_size)),
            decoder: FrameDecoder::new(config.max_payload_size),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        self.read_frame_with(|_| {})
    }

    /// Read the next frame, handing bytes skipped while hunting for a frame
    /// header to `on_discard`.
    pub fn read_frame_with(&mut self, mut on_discard: impl FnMut(&[u8])) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode_with(&mut self.buf, &mut on_discard)? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Drop any partially accumulated frame.
    pub fn discard_buffered(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes received but not yet consumed as a frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
        self.decoder.set_max_payload(max_payload_size);
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<BusStream> {
    /// Create a frame reader for `BusStream` and apply read timeout from config.
    pub fn with_config_bus(inner: BusStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_frame_error(err: busmux_transport::TransportError) -> FrameError {
    match err {
        busmux_transport::TransportError::Io(io)
        | busmux_transport::TransportError::Accept(io) => FrameError::Io(io),
        busmux_transport::TransportError::Bind { source, .. }
        | busmux_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BufMut;

    use super::*;
    use crate::codec::{encode_frame, HEADER_BYTES};

    fn wire(source: u8, dest: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(source, false, dest, payload, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let mut reader = FrameReader::new(Cursor::new(wire(0, 1, b"\x18\x00")));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.destination_id, 1);
        assert_eq!(frame.payload.as_ref(), b"\x18\x00");
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = [wire(0, 1, b"one"), wire(0, 2, b"two"), wire(0, 3, b"three")].concat();
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.destination_id, f1.payload.as_ref()), (1, b"one".as_ref()));
        assert_eq!((f2.destination_id, f2.payload.as_ref()), (2, b"two".as_ref()));
        assert_eq!((f3.destination_id, f3.payload.as_ref()), (3, b"three".as_ref()));
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(4, 5, b"slow"),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.source_id, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_slice(&HEADER_BYTES);
        partial.put_slice(&[0x00, 0x01, 0x10]);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert!(reader.buffered_len() > 0);
        reader.discard_buffered();
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn corrupt_frame_reported_then_reading_continues() {
        let mut bytes = [wire(1, 1, b"bad"), wire(1, 1, b"good")].concat();
        bytes[5] ^= 0x01;
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let err = reader.read_frame().unwrap_err();
        assert!(err.is_wire_fault());
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"good");
    }

    #[test]
    fn oversized_frame_in_stream() {
        let cfg = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let mut reader =
            FrameReader::with_config(Cursor::new(wire(1, 1, b"oversized")), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ReceiveOverrun { size: 9, max: 4 }));
    }

    #[test]
    fn noise_is_handed_to_discard_sink() {
        let mut bytes = b"AT+RST\r\n".to_vec();
        bytes.extend_from_slice(&wire(1, 1, b"x"));
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let mut noise = Vec::new();

        let frame = reader
            .read_frame_with(|skipped| noise.extend_from_slice(skipped))
            .unwrap();
        assert_eq!(frame.payload.as_ref(), b"x");
        assert_eq!(noise, b"AT+RST\r\n");
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: wire(8, 9, b"ok"),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.source_id, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn would_block_propagates_io_error() {
        let mut framed = FrameReader::new(WouldBlockReader);
        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn set_max_payload_applies_to_decoder() {
        let mut reader = FrameReader::new(Cursor::new(wire(1, 1, b"12345678")));
        reader.set_max_payload_size(4);
        assert_eq!(reader.config().max_payload_size, 4);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::ReceiveOverrun { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_bus_stream_pair() {
        let (left, right) = BusStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_secs(2)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_bus(right, cfg).unwrap();

        writer.send(0, true, 1, b"\x19\x05").unwrap();
        let frame = reader.read_frame().unwrap();

        assert!(frame.response_requested);
        assert_eq!(frame.payload.as_ref(), b"\x19\x05");
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct WouldBlockReader;

    impl Read for WouldBlockReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }
}
