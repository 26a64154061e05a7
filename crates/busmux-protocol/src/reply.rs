//! Reply payloads: built by the server, picked apart by the client.

use bytes::{Bytes, BytesMut};

use busmux_frame::{encoded_len, put_varuint};

use crate::error::SubframeError;
use crate::subframe::{Subframe, SubframeIter, Values, SERVER_TO_CLIENT};
use crate::value::{Register, Value, ValueKind};

/// Bounded reply payload builder.
///
/// Both buffers are sized once; subframes that would push the payload past
/// `limit` are dropped and counted in `omitted`. Consecutive read results of
/// one kind are coalesced into a reply-multiple subframe.
#[derive(Debug)]
pub(crate) struct ReplyWriter {
    payload: BytesMut,
    run: BytesMut,
    run_start: Register,
    run_kind: ValueKind,
    run_count: u32,
    limit: usize,
    omitted: usize,
}

impl ReplyWriter {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            payload: BytesMut::with_capacity(limit),
            run: BytesMut::with_capacity(limit),
            run_start: 0,
            run_kind: ValueKind::Int8,
            run_count: 0,
            limit,
            omitted: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.payload.clear();
        self.run.clear();
        self.run_count = 0;
        self.omitted = 0;
    }

    /// Flush any pending run and return the payload.
    pub(crate) fn finish(&mut self) -> &[u8] {
        self.flush_run();
        &self.payload
    }

    /// Payload so far, excluding an unflushed run.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn omitted(&self) -> usize {
        self.omitted
    }

    pub(crate) fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.payload.len())
    }

    /// Append a subframe if it fits.
    pub(crate) fn push(&mut self, subframe: &Subframe<'_>) -> bool {
        self.flush_run();
        append(&mut self.payload, self.limit, &mut self.omitted, subframe)
    }

    /// Record a successful register read.
    pub(crate) fn push_value(&mut self, register: Register, value: Value) {
        let size = value.kind().size();
        let extends = self.run_count > 0
            && value.kind() == self.run_kind
            && self.run_start.checked_add(self.run_count) == Some(register);
        let fits = || {
            let header = 1 + encoded_len(self.run_start) + encoded_len(self.run_count + 1);
            header + self.run.len() + size <= self.remaining()
        };
        if !(extends && fits()) {
            self.flush_run();
            self.run_start = register;
            self.run_kind = value.kind();
        }
        value.encode(&mut self.run);
        self.run_count += 1;
    }

    /// Record a failed register read.
    pub(crate) fn push_read_error(&mut self, register: Register, code: u32) {
        self.push(&Subframe::ReadError { register, code });
    }

    /// Reserve room for a server-to-client subframe on `channel` and return
    /// how many data bytes can follow its header.
    pub(crate) fn tunnel_capacity(&mut self, channel: u32) -> usize {
        self.flush_run();
        let room = self.remaining();
        let header = 1 + encoded_len(channel) + encoded_len(room.min(u32::MAX as usize) as u32);
        room.saturating_sub(header)
    }

    /// Write a server-to-client header for `len` bytes; the caller appends
    /// exactly `len` bytes through [`tunnel_data`](Self::tunnel_data).
    pub(crate) fn begin_tunnel(&mut self, channel: u32, len: usize) -> bool {
        let header = 1 + encoded_len(channel) + encoded_len(len as u32);
        if header + len > self.remaining() {
            self.omitted += 1;
            return false;
        }
        put_varuint(&mut self.payload, SERVER_TO_CLIENT);
        put_varuint(&mut self.payload, channel);
        put_varuint(&mut self.payload, len as u32);
        true
    }

    pub(crate) fn tunnel_data(&mut self) -> &mut BytesMut {
        &mut self.payload
    }

    fn flush_run(&mut self) {
        if self.run_count == 0 {
            return;
        }
        let subframe = if self.run_count == 1 {
            match Value::decode(self.run_kind, &self.run) {
                Some(value) => Subframe::ReplySingle {
                    register: self.run_start,
                    value,
                },
                None => return,
            }
        } else {
            match Values::new(self.run_kind, &self.run) {
                Some(values) => Subframe::ReplyMultiple {
                    start: self.run_start,
                    values,
                },
                None => return,
            }
        };
        append(&mut self.payload, self.limit, &mut self.omitted, &subframe);
        self.run.clear();
        self.run_count = 0;
    }
}

fn append(payload: &mut BytesMut, limit: usize, omitted: &mut usize, subframe: &Subframe<'_>) -> bool {
    if payload.len() + subframe.encoded_len() > limit {
        *omitted += 1;
        return false;
    }
    subframe.encode(payload);
    true
}

/// One piece of information carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyItem {
    Value { register: Register, value: Value },
    ReadError { register: Register, code: u32 },
    WriteError { register: Register, code: u32 },
    Tunnel { channel: u32, data: Bytes },
}

/// A parsed reply payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    items: Vec<ReplyItem>,
}

impl Reply {
    /// Parse a reply payload. Request subframes are not valid here.
    pub fn parse(payload: &Bytes) -> Result<Self, SubframeError> {
        let mut items = Vec::new();
        for subframe in SubframeIter::new(payload) {
            match subframe? {
                Subframe::ReplySingle { register, value } => {
                    items.push(ReplyItem::Value { register, value });
                }
                Subframe::ReplyMultiple { start, values } => {
                    for (register, value) in (start..).zip(values) {
                        items.push(ReplyItem::Value { register, value });
                    }
                }
                Subframe::ReadError { register, code } => {
                    items.push(ReplyItem::ReadError { register, code });
                }
                Subframe::WriteError { register, code } => {
                    items.push(ReplyItem::WriteError { register, code });
                }
                Subframe::ServerToClient { channel, data } => {
                    items.push(ReplyItem::Tunnel {
                        channel,
                        data: payload.slice_ref(data),
                    });
                }
                _ => {
                    return Err(SubframeError::Malformed {
                        offset: 0,
                        reason: "request subframe in reply",
                    })
                }
            }
        }
        Ok(Self { items })
    }

    pub fn items(&self) -> &[ReplyItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Outcome of reading `register`: the value, or the server's error code.
    /// `None` if the reply says nothing about it.
    pub fn read_result(&self, register: Register) -> Option<Result<Value, u32>> {
        self.items.iter().find_map(|item| match *item {
            ReplyItem::Value { register: r, value } if r == register => Some(Ok(value)),
            ReplyItem::ReadError { register: r, code } if r == register => Some(Err(code)),
            _ => None,
        })
    }

    pub fn write_errors(&self) -> impl Iterator<Item = (Register, u32)> + '_ {
        self.items.iter().filter_map(|item| match *item {
            ReplyItem::WriteError { register, code } => Some((register, code)),
            _ => None,
        })
    }

    /// Data returned on `channel`, if the reply has a tunnel subframe for it.
    pub fn tunnel_data(&self, channel: u32) -> Option<&Bytes> {
        self.items.iter().find_map(|item| match item {
            ReplyItem::Tunnel { channel: c, data } if *c == channel => Some(data),
            _ => None,
        })
    }
}
