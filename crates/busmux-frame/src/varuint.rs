//! Base-128 variable length unsigned integers.
//!
//! Each byte carries 7 bits of the value, least significant group first. A set
//! high bit means another byte follows. A `u32` never needs more than
//! [`MAX_VARUINT_SIZE`] bytes.

use bytes::BufMut;

/// Longest valid encoding of a `u32`.
pub const MAX_VARUINT_SIZE: usize = 5;

const CONTINUATION: u8 = 0x80;
const DATA_MASK: u8 = 0x7f;

/// Errors produced while decoding a varuint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VaruintError {
    /// Input ended while the continuation bit was still set.
    #[error("varuint truncated")]
    Truncated,

    /// More than five bytes, or a fifth byte carrying bits above 2^32.
    #[error("varuint exceeds 32 bits")]
    Overlong,
}

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Append the minimal encoding of `value`.
pub fn put_varuint(dst: &mut impl BufMut, mut value: u32) {
    loop {
        let byte = (value as u8) & DATA_MASK;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | CONTINUATION);
    }
}

/// Decode a varuint from the front of `src`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_varuint(src: &[u8]) -> Result<(u32, usize), VaruintError> {
    let mut value = 0u32;
    for (index, &byte) in src.iter().enumerate() {
        if index == MAX_VARUINT_SIZE - 1 && byte > 0x0f {
            // Fifth byte: only the low four bits still fit in a u32, and it
            // must terminate the sequence.
            return Err(VaruintError::Overlong);
        }
        value |= u32::from(byte & DATA_MASK) << (7 * index);
        if byte & CONTINUATION == 0 {
            return Ok((value, index + 1));
        }
    }
    Err(VaruintError::Truncated)
}

/// Decode a varuint and advance `src` past it.
pub fn get_varuint(src: &mut &[u8]) -> Result<u32, VaruintError> {
    let (value, used) = decode_varuint(src)?;
    *src = &src[used..];
    Ok(value)
}
