use serde::Serialize;

/// Per-server error counters.
///
/// Counters saturate instead of wrapping. `missing_subframe` is only ever
/// incremented by response validation on the requesting side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Frames addressed to another node.
    pub wrong_id: u32,
    /// Frames dropped because the trailing checksum did not match.
    pub checksum_mismatch: u32,
    /// Frames whose declared payload exceeded the receive buffer.
    pub receive_overrun: u32,
    /// Payloads that contained a subframe type this node does not handle.
    pub unknown_subframe: u32,
    pub missing_subframe: u32,
    /// Payloads dropped because a subframe could not be parsed.
    pub malformed_subframe: u32,
    /// Replies sent with some subframes left out for lack of room.
    pub reply_overflow: u32,
}

impl Stats {
    pub(crate) fn bump(counter: &mut u32) {
        *counter = counter.saturating_add(1);
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        [
            self.wrong_id,
            self.checksum_mismatch,
            self.receive_overrun,
            self.unknown_subframe,
            self.missing_subframe,
            self.malformed_subframe,
            self.reply_overflow,
        ]
        .iter()
        .map(|n| u64::from(*n))
        .sum()
    }
}
