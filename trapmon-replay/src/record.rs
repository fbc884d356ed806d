//! Appending to a record/replay log while actually driving the guest.

use crate::format::{write_entry, write_ms_header, RrTag};
use crate::state::MachineState;
use crate::Result;
use std::io::Write;
use trapmon_io::IoWidth;

fn width_code(w: IoWidth) -> char {
    match w {
        IoWidth::Byte => 'b',
        IoWidth::Word => 'w',
        IoWidth::Dword => 'l',
    }
}

pub struct RecordLog<W: Write> {
    inner: W,
}

impl<W: Write> RecordLog<W> {
    pub fn new(inner: W) -> Self {
        RecordLog { inner }
    }

    /// Emit a full snapshot: registers/descriptors/CRs followed by the raw
    /// guest RAM image, so a later replay can byte-compare it.
    pub fn write_machine_state(&mut self, n_exec: u64, eip: u32, state: &MachineState, ram: &[u8]) -> Result<()> {
        let total_len = crate::format::RR_LOG_MACHINE_STATE_SIZE as u32 + ram.len() as u32;
        write_ms_header(&mut self.inner, n_exec, eip, total_len)?;
        state.write_body(&mut self.inner)?;
        writeln!(self.inner, "mem:")?;
        self.inner.write_all(ram)?;
        writeln!(self.inner)?;
        Ok(())
    }

    pub fn write_intr(&mut self, n_exec: u64, eip: u32, intno: u8) -> Result<()> {
        write_entry(&mut self.inner, RrTag::Intr, n_exec, eip, &format!("{intno:x}"))
    }

    /// Port read: the value is stored, since replay must reproduce it
    /// without touching the (possibly nondeterministic) device.
    pub fn write_in(&mut self, n_exec: u64, port: u16, width: IoWidth, value: u32) -> Result<()> {
        write_entry(
            &mut self.inner,
            RrTag::In,
            n_exec,
            0,
            &format!("{:04x} {} {:x}", port, width_code(width), value),
        )
    }

    /// Port write: no value is stored (§4.9 — re-executed deterministically
    /// from guest state); only the access's position in the timeline is.
    pub fn write_out(&mut self, n_exec: u64, port: u16, width: IoWidth) -> Result<()> {
        write_entry(
            &mut self.inner,
            RrTag::Out,
            n_exec,
            0,
            &format!("{:04x} {}", port, width_code(width)),
        )
    }

    pub fn write_panic(&mut self, n_exec: u64) -> Result<()> {
        write_entry(&mut self.inner, RrTag::Panc, n_exec, 0, "")
    }

    pub fn write_exit(&mut self, n_exec: u64) -> Result<()> {
        write_entry(&mut self.inner, RrTag::Exit, n_exec, 0, "")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
