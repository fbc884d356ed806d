//! Reading a previously recorded log back, in lock-step with the guest.

use crate::error::ReplayError;
use crate::format::{read_entry, LogHeader, RrTag};
use crate::state::{compare_ram, MachineState};
use crate::Result;
use std::io::{BufRead, Read};
use trapmon_io::IoWidth;

fn width_from_code(s: &str) -> Result<IoWidth> {
    Ok(match s {
        "b" => IoWidth::Byte,
        "w" => IoWidth::Word,
        "l" => IoWidth::Dword,
        other => return Err(ReplayError::Malformed(format!("unknown width code {other:?}"))),
    })
}

pub struct ReplayLog<R: BufRead> {
    inner: R,
    pending: Option<(LogHeader, String)>,
}

impl<R: BufRead> ReplayLog<R> {
    pub fn new(inner: R) -> Self {
        ReplayLog { inner, pending: None }
    }

    fn ensure_pending(&mut self) -> Result<()> {
        if self.pending.is_none() {
            self.pending = Some(read_entry(&mut self.inner)?);
        }
        Ok(())
    }

    /// The tag/`n_exec`/`eip` of the next entry, without consuming it.
    /// [`crate::engine`]'s timeline-matching loop polls this to decide
    /// whether the next recorded event is due yet.
    pub fn peek_header(&mut self) -> Result<LogHeader> {
        self.ensure_pending()?;
        Ok(self.pending.as_ref().unwrap().0)
    }

    fn take(&mut self, want: RrTag) -> Result<String> {
        self.ensure_pending()?;
        let (header, payload) = self.pending.take().unwrap();
        if header.tag != want {
            return Err(ReplayError::UnexpectedTag {
                expected: want.as_str(),
                found: header.tag.as_str().to_string(),
            });
        }
        Ok(payload)
    }

    /// Consume an `MS` entry: parse its labeled body, read `ram_len` bytes
    /// of recorded RAM, and byte-compare it against `current_ram`.
    pub fn expect_machine_state(&mut self, current_ram: &[u8]) -> Result<MachineState> {
        self.ensure_pending()?;
        let header = self.pending.as_ref().unwrap().0;
        if header.tag != RrTag::Ms {
            return Err(ReplayError::UnexpectedTag {
                expected: RrTag::Ms.as_str(),
                found: header.tag.as_str().to_string(),
            });
        }
        self.pending = None;
        let state = MachineState::read_body(&mut self.inner)?;
        let mut label = String::new();
        self.inner.read_line(&mut label)?;
        if label.trim() != "mem:" {
            return Err(ReplayError::Malformed(format!("expected \"mem:\", found {label:?}")));
        }
        let mut ram = vec![0u8; current_ram.len()];
        self.inner.read_exact(&mut ram)?;
        let mut nl = [0u8; 1];
        let _ = self.inner.read_exact(&mut nl);
        compare_ram(&ram, current_ram)?;
        Ok(state)
    }

    pub fn expect_intr(&mut self) -> Result<u8> {
        let payload = self.take(RrTag::Intr)?;
        u8::from_str_radix(payload.trim(), 16).map_err(|e| ReplayError::Malformed(e.to_string()))
    }

    pub fn expect_in(&mut self) -> Result<(u16, IoWidth, u32)> {
        let payload = self.take(RrTag::In)?;
        let mut parts = payload.split_whitespace();
        let port = u16::from_str_radix(parts.next().unwrap_or(""), 16)
            .map_err(|e| ReplayError::Malformed(e.to_string()))?;
        let width = width_from_code(parts.next().unwrap_or(""))?;
        let value =
            u32::from_str_radix(parts.next().unwrap_or(""), 16).map_err(|e| ReplayError::Malformed(e.to_string()))?;
        Ok((port, width, value))
    }

    pub fn expect_out(&mut self) -> Result<(u16, IoWidth)> {
        let payload = self.take(RrTag::Out)?;
        let mut parts = payload.split_whitespace();
        let port = u16::from_str_radix(parts.next().unwrap_or(""), 16)
            .map_err(|e| ReplayError::Malformed(e.to_string()))?;
        let width = width_from_code(parts.next().unwrap_or(""))?;
        Ok((port, width))
    }

    pub fn expect_panic(&mut self) -> Result<()> {
        self.take(RrTag::Panc).map(|_| ())
    }

    pub fn expect_exit(&mut self) -> Result<()> {
        self.take(RrTag::Exit).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordLog;
    use crate::state::SegSnapshot;
    use std::io::Cursor;

    fn sample_state() -> MachineState {
        MachineState {
            regs: [0; 8],
            eip: 0x0040_1000,
            eflags: 0x202,
            ldt: Default::default(),
            tr: Default::default(),
            gdt: Default::default(),
            idt: Default::default(),
            cr: [0; 5],
            interrupts_enabled: true,
            iopl: 0,
            ac: false,
            a20_mask: 0xffff_ffff,
            segs: [SegSnapshot::default(); 6],
            fxstate: Box::new([0u8; 512]),
        }
    }

    #[test]
    fn machine_state_entry_round_trips_and_compares_ram() {
        let mut buf = Vec::new();
        let ram = vec![1u8, 2, 3, 4];
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_machine_state(10, 0x0040_1000, &sample_state(), &ram).unwrap();
        }
        let mut replay = ReplayLog::new(Cursor::new(buf));
        let header = replay.peek_header().unwrap();
        assert_eq!(header.tag, RrTag::Ms);
        assert_eq!(header.n_exec, 10);
        let state = replay.expect_machine_state(&ram).unwrap();
        assert_eq!(state.eip, 0x0040_1000);
    }

    #[test]
    fn ram_mismatch_during_replay_is_reported() {
        let mut buf = Vec::new();
        let ram = vec![1u8, 2, 3, 4];
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_machine_state(1, 0, &sample_state(), &ram).unwrap();
        }
        let mut replay = ReplayLog::new(Cursor::new(buf));
        let corrupted = vec![1u8, 2, 9, 4];
        let err = replay.expect_machine_state(&corrupted).unwrap_err();
        assert!(matches!(err, ReplayError::RamMismatch { offset: 2, .. }));
    }

    #[test]
    fn in_out_entries_round_trip() {
        let mut buf = Vec::new();
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_in(5, 0x92, IoWidth::Byte, 0x02).unwrap();
            rec.write_out(6, 0x92, IoWidth::Byte).unwrap();
        }
        let mut replay = ReplayLog::new(Cursor::new(buf));
        let (port, width, value) = replay.expect_in().unwrap();
        assert_eq!((port, value), (0x92, 0x02));
        assert_eq!(width, IoWidth::Byte);
        let (port, width) = replay.expect_out().unwrap();
        assert_eq!(port, 0x92);
        assert_eq!(width, IoWidth::Byte);
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut buf = Vec::new();
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_intr(1, 0, 7).unwrap();
        }
        let mut replay = ReplayLog::new(Cursor::new(buf));
        let err = replay.expect_in().unwrap_err();
        assert!(matches!(err, ReplayError::UnexpectedTag { .. }));
    }
}
