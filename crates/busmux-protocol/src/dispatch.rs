//! Routes the subframes of a request payload to the register and tunnel
//! services.
//!
//! A payload is walked twice. The first pass validates it and finds the
//! prefix that can be executed; the second executes that prefix. A frame is
//! therefore either rejected before any side effect or applied in order.
//! Reads whose results cannot fit in one reply are rejected in the first
//! pass, which also bounds the work a single frame can cause.

use tracing::{debug, warn};

use crate::error::SubframeError;
use crate::register::{self, RegisterServer};
use crate::reply::ReplyWriter;
use crate::subframe::{Subframe, SubframeIter};
use crate::tunnel::TunnelMux;

/// Fewest reply bytes one read result can take: its value inside a
/// reply-multiple run, or a read-error subframe of at least three bytes.
fn min_reply_cost(size: usize) -> u64 {
    size.min(3) as u64
}

/// What the validation pass learned about a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Plan {
    /// Length of the prefix to execute.
    pub executable: usize,
    /// First subframe type this node does not recognise.
    pub unknown_tag: Option<u32>,
    pub registers: usize,
    pub reads: usize,
    pub tunnels: usize,
    /// Lower bound on the reply bytes the planned reads need.
    pub reply_floor: u64,
}

impl Plan {
    /// Whether the payload asks for data back regardless of the
    /// response-requested flag.
    pub fn needs_reply(&self) -> bool {
        self.reads > 0 || self.tunnels > 0
    }
}

/// Validate `payload` for a node whose replies hold at most `reply_limit`
/// payload bytes.
pub(crate) fn plan(payload: &[u8], reply_limit: usize) -> Result<Plan, SubframeError> {
    let mut plan = Plan {
        executable: payload.len(),
        ..Plan::default()
    };
    let mut iter = SubframeIter::new(payload);
    loop {
        let offset = iter.offset();
        let Some(item) = iter.next() else {
            break;
        };
        match item {
            Ok(subframe) if subframe.is_register_request() => {
                plan.registers += 1;
                let cost = match subframe {
                    Subframe::ReadSingle { kind, .. } => Some(min_reply_cost(kind.size())),
                    Subframe::ReadMultiple { count, kind, .. } => {
                        Some(u64::from(count).saturating_mul(min_reply_cost(kind.size())))
                    }
                    _ => None,
                };
                if let Some(cost) = cost {
                    plan.reads += 1;
                    // Every reply needs at least one subframe header.
                    plan.reply_floor = plan.reply_floor.max(2).saturating_add(cost);
                    if plan.reply_floor > reply_limit as u64 {
                        return Err(SubframeError::Malformed {
                            offset,
                            reason: "read results cannot fit in one reply",
                        });
                    }
                }
            }
            Ok(Subframe::ClientToServer { .. }) => plan.tunnels += 1,
            Ok(_) => {
                return Err(SubframeError::Malformed {
                    offset,
                    reason: "reply subframe in request",
                })
            }
            Err(SubframeError::Unknown { tag, offset }) => {
                plan.executable = offset;
                plan.unknown_tag = Some(tag);
            }
            Err(err) => return Err(err),
        }
    }

    let others = plan.registers + usize::from(plan.unknown_tag.is_some());
    if plan.tunnels > 1 || (plan.tunnels == 1 && others > 0) {
        return Err(SubframeError::Malformed {
            offset: 0,
            reason: "tunnel subframe must be alone in its frame",
        });
    }
    Ok(plan)
}

/// Execute the validated prefix of `payload`.
pub(crate) fn execute<R: RegisterServer + ?Sized>(
    payload: &[u8],
    plan: &Plan,
    registers: &mut R,
    tunnels: &mut TunnelMux,
    reply: &mut ReplyWriter,
) {
    for item in SubframeIter::new(&payload[..plan.executable]) {
        let Ok(subframe) = item else {
            break;
        };
        match subframe {
            Subframe::ClientToServer { channel, data } => poll(tunnels, channel, data, reply),
            other => register::serve(registers, &other, reply),
        }
    }
}

/// Hand client data to its channel and answer with whatever the channel has
/// queued, possibly nothing.
fn poll(tunnels: &mut TunnelMux, channel: u32, data: &[u8], reply: &mut ReplyWriter) {
    let handle = tunnels.deliver(channel, data);
    let capacity = reply.tunnel_capacity(channel);
    let len = handle.map_or(0, |h| tunnels.outbound_len(h).min(capacity));
    if !reply.begin_tunnel(channel, len) {
        warn!(channel, "reply buffer too small for tunnel subframe");
        return;
    }
    if let Some(handle) = handle {
        let moved = tunnels.drain_outbound(handle, reply.tunnel_data(), len);
        debug!(channel, received = data.len(), sent = moved, "tunnel poll");
    }
}
