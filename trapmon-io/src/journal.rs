//! The record/replay side of an I/O access. [`crate::ring::PortRing`] calls
//! into an [`IoJournal`] implementation rather than depending on
//! `trapmon-replay` directly, so the two crates can be wired together by
//! `trapmon-core` without a dependency cycle.

/// Width of a single port access. `Dword` is the widest x86 supports
/// without a string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoWidth {
    Byte,
    Word,
    Dword,
}

impl IoWidth {
    pub fn bytes(self) -> usize {
        match self {
            IoWidth::Byte => 1,
            IoWidth::Word => 2,
            IoWidth::Dword => 4,
        }
    }
}

/// The log side of a logged I/O access. Implementations are expected to
/// treat any mismatch as fatal (matching the reference monitor's
/// `replay_log_scanf`, which `ABORT()`s on a short match) rather than
/// returning a recoverable error — a replay log that disagrees with the
/// guest it's paired with is not a condition this crate can safely
/// continue past.
pub trait IoJournal {
    fn record_in(&mut self, n_exec: u64, port: u16, width: IoWidth, value: u32);
    fn record_out(&mut self, n_exec: u64, port: u16, width: IoWidth, value: u32);
    /// Fetch the value recorded for this `IN`, verifying that the log's
    /// position (tag, `n_exec`, port, width) matches what's expected.
    fn replay_in(&mut self, n_exec: u64, port: u16, width: IoWidth) -> u32;
    /// Verify the log's position for this `OUT` matches what's expected;
    /// the write itself is re-executed against the device, not replayed
    /// from a stored value (§4.9: "`OUT`/`OUTS` — no payload; re-executed").
    fn replay_out(&mut self, n_exec: u64, port: u16, width: IoWidth);
}
