//! `tokio_util::codec` adapter around [`FrameDecoder`].

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{encode_frame, Frame, DEFAULT_MAX_PAYLOAD};
use crate::decoder::FrameDecoder;
use crate::error::FrameError;

/// What the codec pulled off the wire.
///
/// Wire faults are items rather than decoder errors: a `Framed` stream ends
/// after its first error, while a corrupt frame on a shared bus is routine.
#[derive(Debug)]
pub enum Received {
    Frame(Frame),
    Rejected(FrameError),
    /// Bytes skipped while hunting for a frame header, in wire order.
    Discarded(Bytes),
}

/// Frame codec for use with `tokio_util::codec::Framed`.
#[derive(Debug)]
pub struct MultiplexCodec {
    decoder: FrameDecoder,
    max_payload: usize,
    /// Decoded in the same pass as a discard, yielded right after it.
    queued: Option<Received>,
}

impl MultiplexCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_payload),
            max_payload,
            queued: None,
        }
    }
}

impl Default for MultiplexCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for MultiplexCodec {
    type Item = Received;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.queued.take() {
            return Ok(Some(item));
        }
        let mut discarded = BytesMut::new();
        let item = match self
            .decoder
            .decode_with(src, |skipped| discarded.extend_from_slice(skipped))
        {
            Ok(frame) => frame.map(Received::Frame),
            Err(err) if err.is_wire_fault() => Some(Received::Rejected(err)),
            Err(err) => return Err(err),
        };
        if discarded.is_empty() {
            return Ok(item);
        }
        self.queued = item;
        Ok(Some(Received::Discarded(discarded.freeze())))
    }

    /// A partial frame at end of stream is noise, not an error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let item = self.decode(src)?;
        if item.is_none() && !src.is_empty() {
            return Ok(Some(Received::Discarded(src.split().freeze())));
        }
        Ok(item)
    }
}

impl Encoder<Frame> for MultiplexCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            });
        }
        encode_frame(
            frame.source_id,
            frame.response_requested,
            frame.destination_id,
            &frame.payload,
            dst,
        )
    }
}

/// Pre-encoded bytes (a reply frame or raw traffic) pass through untouched.
impl Encoder<Bytes> for MultiplexCodec {
    type Error = FrameError;

    fn encode(&mut self, bytes: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
