//! Tunneled byte streams.
//!
//! A node has a fixed number of channel slots, each with an inbound and an
//! outbound ring buffer sized at construction. A channel id binds to a slot
//! the first time either side references it. Server-side data only leaves
//! the node in reply to a client poll.

use std::io;

use bytes::BytesMut;
use tracing::{debug, warn};

/// Fixed-capacity byte ring.
#[derive(Debug)]
pub(crate) struct RingBuffer {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
}

impl RingBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity].into_boxed_slice(),
            head: 0,
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append as much of `data` as fits; returns the number of bytes taken.
    pub(crate) fn push(&mut self, data: &[u8]) -> usize {
        let cap = self.capacity();
        let n = data.len().min(cap - self.len);
        let mut tail = (self.head + self.len) % cap.max(1);
        for &byte in &data[..n] {
            self.storage[tail] = byte;
            tail = (tail + 1) % cap;
        }
        self.len += n;
        n
    }

    /// Move up to `buf.len()` bytes out; returns the number moved.
    pub(crate) fn pop(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        let (first, second) = self.as_slices(n);
        buf[..first.len()].copy_from_slice(first);
        buf[first.len()..n].copy_from_slice(second);
        self.consume(n);
        n
    }

    /// Move up to `max` bytes onto the end of `dst`.
    pub(crate) fn pop_into(&mut self, dst: &mut BytesMut, max: usize) -> usize {
        let n = max.min(self.len);
        let (first, second) = self.as_slices(n);
        dst.extend_from_slice(first);
        dst.extend_from_slice(second);
        self.consume(n);
        n
    }

    /// The first `n` buffered bytes as at most two contiguous pieces.
    fn as_slices(&self, n: usize) -> (&[u8], &[u8]) {
        let first_len = n.min(self.capacity() - self.head);
        let first = &self.storage[self.head..self.head + first_len];
        let second = &self.storage[..n - first_len];
        (first, second)
    }

    fn consume(&mut self, n: usize) {
        self.len -= n;
        self.head = if self.len == 0 {
            0
        } else {
            (self.head + n) % self.capacity()
        };
    }
}

/// Opaque reference to a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(usize);

#[derive(Debug)]
struct Channel {
    id: Option<u32>,
    inbound: RingBuffer,
    outbound: RingBuffer,
}

/// The channel table of one node.
#[derive(Debug)]
pub struct TunnelMux {
    slots: Vec<Channel>,
}

impl TunnelMux {
    pub fn new(max_streams: usize, buffer_size: usize) -> Self {
        let slots = (0..max_streams)
            .map(|_| Channel {
                id: None,
                inbound: RingBuffer::with_capacity(buffer_size),
                outbound: RingBuffer::with_capacity(buffer_size),
            })
            .collect();
        Self { slots }
    }

    /// Handle for `channel`, binding a free slot if needed.
    pub fn open(&mut self, channel: u32) -> Option<TunnelHandle> {
        if let Some(handle) = self.lookup(channel) {
            return Some(handle);
        }
        let index = self.slots.iter().position(|slot| slot.id.is_none())?;
        self.slots[index].id = Some(channel);
        debug!(channel, slot = index, "tunnel channel bound");
        Some(TunnelHandle(index))
    }

    /// Handle for `channel` if it is already bound.
    pub fn lookup(&self, channel: u32) -> Option<TunnelHandle> {
        self.slots
            .iter()
            .position(|slot| slot.id == Some(channel))
            .map(TunnelHandle)
    }

    /// Channel id bound to `handle`.
    pub fn channel_id(&self, handle: TunnelHandle) -> Option<u32> {
        self.slots.get(handle.0).and_then(|slot| slot.id)
    }

    /// Bound channel ids, in slot order.
    pub fn channels(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().filter_map(|slot| slot.id)
    }

    pub fn stream(&mut self, handle: TunnelHandle) -> TunnelStream<'_> {
        TunnelStream {
            channel: self.slots.get_mut(handle.0),
        }
    }

    /// Queue client data on `channel`. Bytes that do not fit are dropped.
    pub(crate) fn deliver(&mut self, channel: u32, data: &[u8]) -> Option<TunnelHandle> {
        let Some(handle) = self.open(channel) else {
            if !data.is_empty() {
                warn!(channel, dropped = data.len(), "no free tunnel slot, data dropped");
            }
            return None;
        };
        let slot = &mut self.slots[handle.0];
        let accepted = slot.inbound.push(data);
        if accepted < data.len() {
            warn!(
                channel,
                dropped = data.len() - accepted,
                "tunnel inbound buffer full, data dropped"
            );
        }
        Some(handle)
    }

    /// Move up to `max` pending outbound bytes of `handle` onto `dst`.
    pub(crate) fn drain_outbound(
        &mut self,
        handle: TunnelHandle,
        dst: &mut BytesMut,
        max: usize,
    ) -> usize {
        self.slots
            .get_mut(handle.0)
            .map_or(0, |slot| slot.outbound.pop_into(dst, max))
    }

    pub(crate) fn outbound_len(&self, handle: TunnelHandle) -> usize {
        self.slots.get(handle.0).map_or(0, |slot| slot.outbound.len())
    }
}

/// Non-blocking byte stream over one tunnel channel.
///
/// Reads drain client data; writes queue data for the next poll. Either
/// returns `WouldBlock` when there is nothing to move.
#[derive(Debug)]
pub struct TunnelStream<'a> {
    channel: Option<&'a mut Channel>,
}

impl TunnelStream<'_> {
    /// Bytes waiting to be read.
    pub fn available(&self) -> usize {
        self.channel.as_ref().map_or(0, |c| c.inbound.len())
    }

    /// Bytes queued for the client that have not been polled yet.
    pub fn pending(&self) -> usize {
        self.channel.as_ref().map_or(0, |c| c.outbound.len())
    }

    fn channel(&mut self) -> io::Result<&mut Channel> {
        self.channel
            .as_deref_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "invalid tunnel handle"))
    }
}

impl io::Read for TunnelStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let channel = self.channel()?;
        if channel.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(channel.inbound.pop(buf))
    }
}

impl io::Write for TunnelStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let channel = self.channel()?;
        match channel.outbound.push(buf) {
            0 => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
