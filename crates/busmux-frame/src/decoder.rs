use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::checksum::frame_checksum;
use crate::codec::{Frame, CRC_SIZE, HEADER_BYTES, HEADER_SIZE, MAX_ID, RESPONSE_REQUESTED};
use crate::error::{FrameError, Result};
use crate::varuint::{decode_varuint, VaruintError};

/// Incremental frame decoder.
///
/// Feed it a buffer that the byte stream keeps appending to. Each call either
/// extracts one frame, reports that more bytes are needed, or reports a wire
/// fault after dropping the offending bytes so the next call can resume.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Try to decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        self.decode_with(src, |_| {})
    }

    /// Like [`decode`](Self::decode), handing bytes skipped while hunting for
    /// a header to `on_discard`.
    pub fn decode_with(
        &mut self,
        src: &mut BytesMut,
        mut on_discard: impl FnMut(&[u8]),
    ) -> Result<Option<Frame>> {
        let skipped = header_offset(src);
        if skipped > 0 {
            trace!(skipped, "discarding bytes before frame header");
            on_discard(&src[..skipped]);
            src.advance(skipped);
        }

        if src.len() < HEADER_SIZE + 1 {
            return Ok(None);
        }

        let (declared, used) = match decode_varuint(&src[HEADER_SIZE..]) {
            Ok(parsed) => parsed,
            Err(VaruintError::Truncated) => return Ok(None),
            Err(err) => {
                // Step past this header so the search resumes inside it.
                src.advance(1);
                return Err(FrameError::MalformedVaruint(err));
            }
        };

        let payload_len = declared as usize;
        if payload_len > self.max_payload {
            src.advance(1);
            return Err(FrameError::ReceiveOverrun {
                size: payload_len,
                max: self.max_payload,
            });
        }

        let body_len = HEADER_SIZE + used + payload_len;
        let total = body_len + CRC_SIZE;
        if src.len() < total {
            return Ok(None);
        }

        let expected = u16::from_le_bytes([src[body_len], src[body_len + 1]]);
        let actual = frame_checksum(&src[..body_len]);
        if expected != actual {
            src.advance(total);
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        let source = src[2];
        let destination_id = src[3];
        let mut raw = src.split_to(total).freeze();
        raw.advance(HEADER_SIZE + used);
        raw.truncate(payload_len);

        Ok(Some(Frame {
            source_id: source & MAX_ID,
            response_requested: source & RESPONSE_REQUESTED != 0,
            destination_id,
            payload: raw,
        }))
    }
}

/// Offset of the first possible frame header in `src`.
///
/// A trailing lone first header byte is kept, since its partner may still be
/// on the way.
fn header_offset(src: &[u8]) -> usize {
    src.windows(2)
        .position(|pair| pair == HEADER_BYTES.as_slice())
        .unwrap_or_else(|| match src.last() {
            Some(&last) if last == HEADER_BYTES[0] => src.len() - 1,
            _ => src.len(),
        })
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes};

    use super::*;
    use crate::codec::{encode_frame, DEFAULT_MAX_PAYLOAD};

    fn wire(source: u8, dest: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(source, true, dest, payload, &mut buf).unwrap();
        buf
    }

    #[test]
    fn decodes_single_frame() {
        let mut buf = wire(0, 1, b"\x18\x02");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.source_id, 0);
        assert!(frame.response_requested);
        assert_eq!(frame.destination_id, 1);
        assert_eq!(frame.payload.as_ref(), b"\x18\x02");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_until_last_byte() {
        let full = wire(2, 3, b"hello");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut buf = BytesMut::new();

        for (index, byte) in full.iter().enumerate() {
            buf.put_u8(*byte);
            let result = decoder.decode(&mut buf).unwrap();
            if index + 1 < full.len() {
                assert!(result.is_none(), "frame completed early at byte {index}");
            } else {
                assert_eq!(result.unwrap().payload.as_ref(), b"hello");
            }
        }
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = wire(1, 2, b"first");
        buf.extend_from_slice(&wire(3, 4, b"second"));
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let f1 = decoder.decode(&mut buf).unwrap().unwrap();
        let f2 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!((f1.source_id, f1.payload.as_ref()), (1, b"first".as_ref()));
        assert_eq!((f2.source_id, f2.payload.as_ref()), (3, b"second".as_ref()));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn skips_leading_noise_and_reports_it() {
        let mut buf = BytesMut::from(&b"noise"[..]);
        buf.extend_from_slice(&wire(1, 2, b"x"));
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let mut discarded = Vec::new();

        let frame = decoder
            .decode_with(&mut buf, |bytes| discarded.extend_from_slice(bytes))
            .unwrap()
            .unwrap();
        assert_eq!(frame.payload.as_ref(), b"x");
        assert_eq!(discarded, b"noise");
    }

    #[test]
    fn keeps_partial_header_byte() {
        let mut buf = BytesMut::from(&[0x00, 0x01, HEADER_BYTES[0]][..]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.as_ref(), &[HEADER_BYTES[0]]);
    }

    #[test]
    fn payload_bit_flip_is_checksum_mismatch_and_stream_recovers() {
        let mut buf = wire(1, 2, b"abc");
        buf[6] ^= 0x10;
        buf.extend_from_slice(&wire(1, 2, b"next"));
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"next");
    }

    #[test]
    fn checksum_bit_flip_detected() {
        for bit in 0..16 {
            let mut buf = wire(4, 5, b"data");
            let len = buf.len();
            buf[len - 2 + bit / 8] ^= 1 << (bit % 8);
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
            assert!(matches!(
                decoder.decode(&mut buf),
                Err(FrameError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn oversized_declared_payload_is_overrun() {
        let mut buf = BytesMut::new();
        buf.put_slice(&HEADER_BYTES);
        buf.put_u8(0x80);
        buf.put_u8(0x01);
        buf.put_slice(&[0x80, 0x04]); // 512
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ReceiveOverrun {
                size: 512,
                max: DEFAULT_MAX_PAYLOAD
            }
        ));
    }

    #[test]
    fn overrun_resynchronises_onto_following_frame() {
        let mut buf = BytesMut::new();
        buf.put_slice(&HEADER_BYTES);
        buf.put_slice(&[0x00, 0x01, 0xff, 0x7f]);
        buf.extend_from_slice(&wire(6, 7, b"ok"));
        let mut decoder = FrameDecoder::new(16);

        assert!(decoder.decode(&mut buf).is_err());
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.source_id, 6);
    }

    #[test]
    fn malformed_length_varuint() {
        let mut buf = BytesMut::new();
        buf.put_slice(&HEADER_BYTES);
        buf.put_slice(&[0x00, 0x01]);
        buf.put_slice(&[0xff; 6]);
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MalformedVaruint(VaruintError::Overlong)));
    }

    #[test]
    fn payload_shares_receive_buffer() {
        let mut buf = wire(1, 1, b"zero-copy");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_PAYLOAD);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"zero-copy"));
    }
}
