//! Timeline matching: deciding, at every translation-block entry, whether a
//! recorded event is due and consuming it if so. Mirrors the `while
//! (replay_last_entry_n_exec <= vcpu.n_exec)` loop in `sys/rr_log.c`.
//!
//! `IN`/`OUT` entries are deliberately *not* surfaced here: they're consumed
//! directly by `trapmon-io::PortRing` at the moment of the actual port
//! access (via the `IoJournal` impls in [`crate::journal`]), since unlike
//! `MS`/`INTR` they don't have a natural "pump" moment independent of the
//! access itself.

use crate::record::RecordLog;
use crate::replay::ReplayLog;
use crate::state::MachineState;
use crate::Result;
use std::io::{BufRead, Write};

#[derive(Debug)]
pub enum ReplayEvent {
    MachineState(MachineState),
    Intr(u8),
    Panic,
    Exit,
}

pub struct ReplayEngine<R: BufRead> {
    log: ReplayLog<R>,
}

impl<R: BufRead> ReplayEngine<R> {
    pub fn new(log: ReplayLog<R>) -> Self {
        ReplayEngine { log }
    }

    /// Access the underlying log directly, e.g. to hand it to
    /// `trapmon-io::PortRing` as an `&mut dyn IoJournal`.
    pub fn log_mut(&mut self) -> &mut ReplayLog<R> {
        &mut self.log
    }

    /// Consume every entry due at or before `vcpu_n_exec`, stopping at the
    /// first one the caller needs to act on (or at an `IN`/`OUT` entry,
    /// which the I/O ring owns). Call in a loop until it returns `None`.
    pub fn pump(&mut self, vcpu_n_exec: u64, current_ram: &[u8]) -> Result<Option<ReplayEvent>> {
        use crate::format::RrTag;

        let header = self.log.peek_header()?;
        if header.n_exec > vcpu_n_exec {
            return Ok(None);
        }
        match header.tag {
            RrTag::Ms => Ok(Some(ReplayEvent::MachineState(self.log.expect_machine_state(current_ram)?))),
            RrTag::Intr => Ok(Some(ReplayEvent::Intr(self.log.expect_intr()?))),
            RrTag::Panc => {
                self.log.expect_panic()?;
                Ok(Some(ReplayEvent::Panic))
            }
            RrTag::Exit => {
                self.log.expect_exit()?;
                Ok(Some(ReplayEvent::Exit))
            }
            RrTag::In | RrTag::Out | RrTag::Ins | RrTag::Outs => Ok(None),
        }
    }
}

/// The record-side counterpart: owns the log and the periodic-checkpoint
/// policy (`REC_PRINT_FREQ` in the reference monitor — `0` disables
/// periodic snapshots, matching that constant's default).
pub struct RecordEngine<W: Write> {
    log: RecordLog<W>,
    checkpoint_period: u64,
}

impl<W: Write> RecordEngine<W> {
    pub fn new(log: RecordLog<W>, checkpoint_period: u64) -> Self {
        RecordEngine { log, checkpoint_period }
    }

    pub fn log_mut(&mut self) -> &mut RecordLog<W> {
        &mut self.log
    }

    /// Whether a periodic machine-state checkpoint is due at `n_exec`.
    pub fn checkpoint_due(&self, n_exec: u64) -> bool {
        self.checkpoint_period != 0 && n_exec % self.checkpoint_period == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SegSnapshot;
    use std::io::Cursor;

    fn sample_state() -> MachineState {
        MachineState {
            regs: [0; 8],
            eip: 0,
            eflags: 0,
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
    fn pump_waits_until_n_exec_catches_up() {
        let mut buf = Vec::new();
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_intr(100, 0, 7).unwrap();
        }
        let mut engine = ReplayEngine::new(ReplayLog::new(Cursor::new(buf)));
        assert!(engine.pump(50, &[]).unwrap().is_none());
        let event = engine.pump(100, &[]).unwrap().unwrap();
        assert!(matches!(event, ReplayEvent::Intr(7)));
    }

    #[test]
    fn pump_leaves_io_entries_for_the_ring_to_consume() {
        let mut buf = Vec::new();
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_out(10, 0x92, trapmon_io::IoWidth::Byte).unwrap();
        }
        let mut engine = ReplayEngine::new(ReplayLog::new(Cursor::new(buf)));
        assert!(engine.pump(10, &[]).unwrap().is_none());
        // the OUT entry is still pending; the ring consumes it via IoJournal.
        let (port, _) = engine.log_mut().expect_out().unwrap();
        assert_eq!(port, 0x92);
    }

    #[test]
    fn checkpoint_due_respects_the_configured_period() {
        let engine = RecordEngine::new(RecordLog::new(Vec::new()), 1000);
        assert!(engine.checkpoint_due(0));
        assert!(engine.checkpoint_due(1000));
        assert!(!engine.checkpoint_due(999));
    }

    #[test]
    fn machine_state_event_carries_the_parsed_snapshot() {
        let mut buf = Vec::new();
        {
            let mut rec = RecordLog::new(&mut buf);
            rec.write_machine_state(5, 0, &sample_state(), &[]).unwrap();
        }
        let mut engine = ReplayEngine::new(ReplayLog::new(Cursor::new(buf)));
        let event = engine.pump(5, &[]).unwrap().unwrap();
        assert!(matches!(event, ReplayEvent::MachineState(_)));
    }
}
