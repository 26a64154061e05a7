//! Subframes: the typed records packed back to back inside a frame payload.
//!
//! Every subframe starts with a varuint type tag. Register tags come in
//! groups of four, one per [`ValueKind`], so `tag - base` is the
//! representation index.
//!
//! ```text
//! write single    tag  register  value
//! write multiple  tag  start     count  value*count
//! read single     tag  register
//! read multiple   tag  start     count
//! reply single    tag  register  value
//! reply multiple  tag  start     count  value*count
//! write/read err  tag  register  code
//! tunnel          tag  channel   count  byte*count
//! ```

use bytes::BufMut;

use busmux_frame::{encoded_len, get_varuint, put_varuint};

use crate::error::SubframeError;
use crate::value::{Register, Value, ValueKind};

pub const WRITE_SINGLE_BASE: u32 = 0x10;
pub const WRITE_MULTIPLE_BASE: u32 = 0x14;
pub const READ_SINGLE_BASE: u32 = 0x18;
pub const READ_MULTIPLE_BASE: u32 = 0x1c;
pub const REPLY_SINGLE_BASE: u32 = 0x20;
pub const REPLY_MULTIPLE_BASE: u32 = 0x24;
pub const WRITE_ERROR: u32 = 0x28;
pub const READ_ERROR: u32 = 0x29;
pub const CLIENT_TO_SERVER: u32 = 0x40;
pub const SERVER_TO_CLIENT: u32 = 0x41;

/// A packed run of same-kind values, borrowed from a payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Values<'a> {
    kind: ValueKind,
    raw: &'a [u8],
}

impl<'a> Values<'a> {
    /// Wrap `raw`, which must hold a whole number of `kind` values.
    pub fn new(kind: ValueKind, raw: &'a [u8]) -> Option<Self> {
        (raw.len() % kind.size() == 0).then_some(Self { kind, raw })
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.raw
    }
}

impl Iterator for Values<'_> {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let value = Value::decode(self.kind, self.raw)?;
        self.raw = &self.raw[self.kind.size()..];
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.raw.len() / self.kind.size();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Values<'_> {}

/// One decoded subframe. Variable-length bodies borrow from the payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Subframe<'a> {
    WriteSingle { register: Register, value: Value },
    WriteMultiple { start: Register, values: Values<'a> },
    ReadSingle { register: Register, kind: ValueKind },
    ReadMultiple { start: Register, count: u32, kind: ValueKind },
    ReplySingle { register: Register, value: Value },
    ReplyMultiple { start: Register, values: Values<'a> },
    WriteError { register: Register, code: u32 },
    ReadError { register: Register, code: u32 },
    ClientToServer { channel: u32, data: &'a [u8] },
    ServerToClient { channel: u32, data: &'a [u8] },
}

impl Subframe<'_> {
    pub fn tag(&self) -> u32 {
        match self {
            Subframe::WriteSingle { value, .. } => WRITE_SINGLE_BASE + kind_offset(value.kind()),
            Subframe::WriteMultiple { values, .. } => {
                WRITE_MULTIPLE_BASE + kind_offset(values.kind())
            }
            Subframe::ReadSingle { kind, .. } => READ_SINGLE_BASE + kind_offset(*kind),
            Subframe::ReadMultiple { kind, .. } => READ_MULTIPLE_BASE + kind_offset(*kind),
            Subframe::ReplySingle { value, .. } => REPLY_SINGLE_BASE + kind_offset(value.kind()),
            Subframe::ReplyMultiple { values, .. } => {
                REPLY_MULTIPLE_BASE + kind_offset(values.kind())
            }
            Subframe::WriteError { .. } => WRITE_ERROR,
            Subframe::ReadError { .. } => READ_ERROR,
            Subframe::ClientToServer { .. } => CLIENT_TO_SERVER,
            Subframe::ServerToClient { .. } => SERVER_TO_CLIENT,
        }
    }

    /// Client-to-server register requests.
    pub fn is_register_request(&self) -> bool {
        matches!(
            self,
            Subframe::WriteSingle { .. }
                | Subframe::WriteMultiple { .. }
                | Subframe::ReadSingle { .. }
                | Subframe::ReadMultiple { .. }
        )
    }

    pub fn is_tunnel(&self) -> bool {
        matches!(
            self,
            Subframe::ClientToServer { .. } | Subframe::ServerToClient { .. }
        )
    }

    /// Bytes [`encode`](Self::encode) will append.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Subframe::WriteSingle { register, value } | Subframe::ReplySingle { register, value } => {
                encoded_len(*register) + value.kind().size()
            }
            Subframe::WriteMultiple { start, values } | Subframe::ReplyMultiple { start, values } => {
                encoded_len(*start) + encoded_len(values.len() as u32) + values.as_bytes().len()
            }
            Subframe::ReadSingle { register, .. } => encoded_len(*register),
            Subframe::ReadMultiple { start, count, .. } => encoded_len(*start) + encoded_len(*count),
            Subframe::WriteError { register, code } | Subframe::ReadError { register, code } => {
                encoded_len(*register) + encoded_len(*code)
            }
            Subframe::ClientToServer { channel, data } | Subframe::ServerToClient { channel, data } => {
                encoded_len(*channel) + encoded_len(data.len() as u32) + data.len()
            }
        };
        encoded_len(self.tag()) + body
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        put_varuint(dst, self.tag());
        match self {
            Subframe::WriteSingle { register, value } | Subframe::ReplySingle { register, value } => {
                put_varuint(dst, *register);
                value.encode(dst);
            }
            Subframe::WriteMultiple { start, values } | Subframe::ReplyMultiple { start, values } => {
                put_varuint(dst, *start);
                put_varuint(dst, values.len() as u32);
                dst.put_slice(values.as_bytes());
            }
            Subframe::ReadSingle { register, .. } => put_varuint(dst, *register),
            Subframe::ReadMultiple { start, count, .. } => {
                put_varuint(dst, *start);
                put_varuint(dst, *count);
            }
            Subframe::WriteError { register, code } | Subframe::ReadError { register, code } => {
                put_varuint(dst, *register);
                put_varuint(dst, *code);
            }
            Subframe::ClientToServer { channel, data } | Subframe::ServerToClient { channel, data } => {
                put_varuint(dst, *channel);
                put_varuint(dst, data.len() as u32);
                dst.put_slice(data);
            }
        }
    }
}

fn kind_offset(kind: ValueKind) -> u32 {
    u32::from(kind.index())
}

fn kind_at(tag: u32, base: u32) -> ValueKind {
    match tag - base {
        0 => ValueKind::Int8,
        1 => ValueKind::Int16,
        2 => ValueKind::Int32,
        _ => ValueKind::Float,
    }
}

/// Walks the subframes of a payload without copying.
///
/// Yields at most one error, then stops: nothing after a bad subframe can be
/// located.
#[derive(Debug, Clone)]
pub struct SubframeIter<'a> {
    payload: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> SubframeIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            pos: 0,
            failed: false,
        }
    }

    /// Offset of the next subframe.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for SubframeIter<'a> {
    type Item = Result<Subframe<'a>, SubframeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.payload.len() {
            return None;
        }
        let offset = self.pos;
        let mut cursor = &self.payload[offset..];
        match parse_one(&mut cursor, offset) {
            Ok(subframe) => {
                self.pos = self.payload.len() - cursor.len();
                Some(Ok(subframe))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn parse_one<'a>(cursor: &mut &'a [u8], offset: usize) -> Result<Subframe<'a>, SubframeError> {
    let tag = field(cursor, offset, "bad type tag")?;
    let subframe = match tag {
        0x10..=0x13 => Subframe::WriteSingle {
            register: field(cursor, offset, "bad register")?,
            value: value(cursor, kind_at(tag, WRITE_SINGLE_BASE), offset)?,
        },
        0x14..=0x17 => {
            let start = field(cursor, offset, "bad register")?;
            let count = range(cursor, start, offset)?;
            Subframe::WriteMultiple {
                start,
                values: values(cursor, kind_at(tag, WRITE_MULTIPLE_BASE), count, offset)?,
            }
        }
        0x18..=0x1b => Subframe::ReadSingle {
            register: field(cursor, offset, "bad register")?,
            kind: kind_at(tag, READ_SINGLE_BASE),
        },
        0x1c..=0x1f => {
            let start = field(cursor, offset, "bad register")?;
            let count = range(cursor, start, offset)?;
            Subframe::ReadMultiple {
                start,
                count,
                kind: kind_at(tag, READ_MULTIPLE_BASE),
            }
        }
        0x20..=0x23 => Subframe::ReplySingle {
            register: field(cursor, offset, "bad register")?,
            value: value(cursor, kind_at(tag, REPLY_SINGLE_BASE), offset)?,
        },
        0x24..=0x27 => {
            let start = field(cursor, offset, "bad register")?;
            let count = range(cursor, start, offset)?;
            Subframe::ReplyMultiple {
                start,
                values: values(cursor, kind_at(tag, REPLY_MULTIPLE_BASE), count, offset)?,
            }
        }
        WRITE_ERROR => Subframe::WriteError {
            register: field(cursor, offset, "bad register")?,
            code: field(cursor, offset, "bad error code")?,
        },
        READ_ERROR => Subframe::ReadError {
            register: field(cursor, offset, "bad register")?,
            code: field(cursor, offset, "bad error code")?,
        },
        CLIENT_TO_SERVER | SERVER_TO_CLIENT => {
            let channel = field(cursor, offset, "bad channel")?;
            let count = field(cursor, offset, "bad byte count")? as usize;
            if count > cursor.len() {
                return Err(SubframeError::Malformed {
                    offset,
                    reason: "tunnel data truncated",
                });
            }
            let (data, rest) = cursor.split_at(count);
            *cursor = rest;
            if tag == CLIENT_TO_SERVER {
                Subframe::ClientToServer { channel, data }
            } else {
                Subframe::ServerToClient { channel, data }
            }
        }
        _ => return Err(SubframeError::Unknown { tag, offset }),
    };
    Ok(subframe)
}

fn field(cursor: &mut &[u8], offset: usize, reason: &'static str) -> Result<u32, SubframeError> {
    get_varuint(cursor).map_err(|_| SubframeError::Malformed { offset, reason })
}

/// Read a register count and check the run stays inside the register space.
fn range(cursor: &mut &[u8], start: Register, offset: usize) -> Result<u32, SubframeError> {
    let count = field(cursor, offset, "bad register count")?;
    if count > 0 && start.checked_add(count - 1).is_none() {
        return Err(SubframeError::Malformed {
            offset,
            reason: "register range overflows",
        });
    }
    Ok(count)
}

fn value(cursor: &mut &[u8], kind: ValueKind, offset: usize) -> Result<Value, SubframeError> {
    let value = Value::decode(kind, cursor).ok_or(SubframeError::Malformed {
        offset,
        reason: "value truncated",
    })?;
    *cursor = &cursor[kind.size()..];
    Ok(value)
}

fn values<'a>(
    cursor: &mut &'a [u8],
    kind: ValueKind,
    count: u32,
    offset: usize,
) -> Result<Values<'a>, SubframeError> {
    let truncated = SubframeError::Malformed {
        offset,
        reason: "values truncated",
    };
    let len = (count as usize)
        .checked_mul(kind.size())
        .filter(|len| *len <= cursor.len())
        .ok_or(truncated)?;
    let (raw, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(Values { kind, raw })
}
