//! The on-disk record/replay log format: tagged, fixed-entry-size, text
//! records keyed by `n_exec`. Grounded in `sys/rr_log.c`'s
//! `record_log_printf`/`replay_log_scanf` framing, simplified to a single
//! space-delimited header line per entry (the reference format's
//! colon/space punctuation carries no information a Rust reader needs that
//! whitespace-splitting doesn't already give it).

use crate::error::{ReplayError, Result};
use std::io::{BufRead, Write};

/// Every non-machine-state entry is padded to this many bytes so the log
/// stays seekable by record index without an auxiliary index file.
pub const RR_LOG_ENTRY_SIZE: usize = 128;
/// Fixed portion of a machine-state entry, before the variable-length RAM
/// image that follows it.
pub const RR_LOG_MACHINE_STATE_SIZE: usize = 2560;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrTag {
    Ms,
    Intr,
    In,
    Ins,
    Out,
    Outs,
    Panc,
    Exit,
}

impl RrTag {
    pub fn as_str(self) -> &'static str {
        match self {
            RrTag::Ms => "MS",
            RrTag::Intr => "INTR",
            RrTag::In => "IN",
            RrTag::Ins => "INS",
            RrTag::Out => "OUT",
            RrTag::Outs => "OUTS",
            RrTag::Panc => "PANC",
            RrTag::Exit => "EXIT",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "MS" => RrTag::Ms,
            "INTR" => RrTag::Intr,
            "IN" => RrTag::In,
            "INS" => RrTag::Ins,
            "OUT" => RrTag::Out,
            "OUTS" => RrTag::Outs,
            "PANC" => RrTag::Panc,
            "EXIT" => RrTag::Exit,
            other => {
                return Err(ReplayError::Malformed(format!("unknown log tag {other:?}")));
            }
        })
    }
}

/// The parsed header of one log entry: which kind of event it is, the
/// `n_exec` at which it occurred, the entry's total byte length, and the
/// guest `eip` at the time — the three fields every entry carries
/// regardless of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub tag: RrTag,
    pub n_exec: u64,
    pub len: u32,
    pub eip: u32,
}

/// Write one fixed-size entry: `TAG NEXEC LEN EIP PAYLOAD`, space-padded to
/// `RR_LOG_ENTRY_SIZE` bytes (including the trailing newline).
pub fn write_entry(w: &mut impl Write, tag: RrTag, n_exec: u64, eip: u32, payload: &str) -> Result<()> {
    let mut line = format!(
        "{} {:016x} {:08x} {:08x} {}",
        tag.as_str(),
        n_exec,
        RR_LOG_ENTRY_SIZE as u32,
        eip,
        payload
    );
    if line.len() + 1 < RR_LOG_ENTRY_SIZE {
        line.push_str(&" ".repeat(RR_LOG_ENTRY_SIZE - line.len() - 1));
    }
    writeln!(w, "{line}")?;
    Ok(())
}

/// Write a machine-state entry's header line; the caller appends the
/// labeled-field body and raw RAM bytes itself (see `crate::state`).
pub fn write_ms_header(w: &mut impl Write, n_exec: u64, eip: u32, total_len: u32) -> Result<()> {
    writeln!(w, "{} {:016x} {:08x} {:08x}", RrTag::Ms.as_str(), n_exec, total_len, eip)?;
    Ok(())
}

/// Read one entry's header line and return it along with the remainder of
/// the line (the payload, for non-`MS` entries).
pub fn read_entry(r: &mut impl BufRead) -> Result<(LogHeader, String)> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(ReplayError::Malformed("unexpected end of replay log".into()));
    }
    let line = line.trim_end();
    let mut parts = line.splitn(5, ' ');
    let tag = RrTag::from_str(parts.next().unwrap_or(""))?;
    let n_exec = u64::from_str_radix(parts.next().unwrap_or(""), 16)
        .map_err(|e| ReplayError::Malformed(format!("bad n_exec field: {e}")))?;
    let len = u32::from_str_radix(parts.next().unwrap_or(""), 16)
        .map_err(|e| ReplayError::Malformed(format!("bad len field: {e}")))?;
    let eip = u32::from_str_radix(parts.next().unwrap_or(""), 16)
        .map_err(|e| ReplayError::Malformed(format!("bad eip field: {e}")))?;
    let payload = parts.next().unwrap_or("").trim_end().to_string();
    Ok((LogHeader { tag, n_exec, len, eip }, payload))
}
