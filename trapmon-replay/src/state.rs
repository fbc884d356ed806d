//! A full VCPU snapshot, as recorded in an `MS` log entry. Field-for-field
//! mirror of the `rw_state` macro in `sys/rr_log.c`, which walks the same
//! set of registers/descriptors/CRs in the same order whether it's being
//! printed (record) or scanned (replay).

use crate::error::{ReplayError, Result};
use std::io::{BufRead, Write};

pub const NUM_REGS: usize = 8;
pub const NUM_CRS: usize = 5;
pub const NUM_SEGS: usize = 6;
pub const FXSTATE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableDescriptor {
    pub base: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegSnapshot {
    pub orig_selector: u16,
    pub base: u32,
    pub limit: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub regs: [u32; NUM_REGS],
    pub eip: u32,
    pub eflags: u32,
    pub ldt: SystemSegment,
    pub tr: SystemSegment,
    pub gdt: TableDescriptor,
    pub idt: TableDescriptor,
    pub cr: [u32; NUM_CRS],
    pub interrupts_enabled: bool,
    pub iopl: u16,
    pub ac: bool,
    pub a20_mask: u32,
    pub segs: [SegSnapshot; NUM_SEGS],
    pub fxstate: Box<[u8; FXSTATE_SIZE]>,
}

impl MachineState {
    /// Write the labeled-field body (everything an `MS` entry carries other
    /// than the raw RAM image, which the caller appends separately since it
    /// can be gigabytes and shouldn't pass through this struct).
    pub fn write_body(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "regs:")?;
        for (i, r) in self.regs.iter().enumerate() {
            writeln!(w, "\t{i}: {r:08x}")?;
        }
        writeln!(w, "eip: {:08x}", self.eip)?;
        writeln!(w, "eflags: {:08x}", self.eflags)?;
        writeln!(
            w,
            "ldt: {:04x},{:08x},{:08x},{:08x}",
            self.ldt.selector, self.ldt.base, self.ldt.limit, self.ldt.flags
        )?;
        writeln!(
            w,
            "tr: {:04x},{:08x},{:08x},{:08x}",
            self.tr.selector, self.tr.base, self.tr.limit, self.tr.flags
        )?;
        writeln!(w, "gdt: {:08x},{:08x}", self.gdt.base, self.gdt.limit)?;
        writeln!(w, "idt: {:08x},{:08x}", self.idt.base, self.idt.limit)?;
        writeln!(w, "cr:")?;
        for (i, c) in self.cr.iter().enumerate() {
            writeln!(w, "\t{i}: {c:08x}")?;
        }
        writeln!(w, "IF: {:x}", self.interrupts_enabled as u8)?;
        writeln!(w, "IOPL: {:x}", self.iopl)?;
        writeln!(w, "AC: {:x}", self.ac as u8)?;
        writeln!(w, "a20_mask: {:08x}", self.a20_mask)?;
        writeln!(w, "segs:")?;
        for (i, s) in self.segs.iter().enumerate() {
            writeln!(
                w,
                "\t{i}: {:04x},{:08x},{:08x},{:08x}",
                s.orig_selector, s.base, s.limit, s.flags
            )?;
        }
        write!(w, "fxstate:")?;
        for b in self.fxstate.iter() {
            write!(w, " {b:02x}")?;
        }
        writeln!(w)?;
        Ok(())
    }

    /// Parse a body previously written by [`Self::write_body`]. Strict:
    /// any line out of the expected order is a malformed-log error, matching
    /// the reference monitor's fatal-on-mismatch replay policy.
    pub fn read_body(r: &mut impl BufRead) -> Result<Self> {
        let mut regs = [0u32; NUM_REGS];
        expect_label(r, "regs:")?;
        for slot in regs.iter_mut() {
            *slot = read_indexed_hex(r)?;
        }
        let eip = read_labeled_hex(r, "eip:")?;
        let eflags = read_labeled_hex(r, "eflags:")?;
        let ldt = read_system_segment(r, "ldt:")?;
        let tr = read_system_segment(r, "tr:")?;
        let gdt = read_table_descriptor(r, "gdt:")?;
        let idt = read_table_descriptor(r, "idt:")?;
        let mut cr = [0u32; NUM_CRS];
        expect_label(r, "cr:")?;
        for slot in cr.iter_mut() {
            *slot = read_indexed_hex(r)?;
        }
        let interrupts_enabled = read_labeled_hex(r, "IF:")? != 0;
        let iopl = read_labeled_hex(r, "IOPL:")? as u16;
        let ac = read_labeled_hex(r, "AC:")? != 0;
        let a20_mask = read_labeled_hex(r, "a20_mask:")?;
        let mut segs = [SegSnapshot::default(); NUM_SEGS];
        expect_label(r, "segs:")?;
        for slot in segs.iter_mut() {
            let line = read_line(r)?;
            let (_idx, rest) = split_label(&line)?;
            let fields: Vec<&str> = rest.trim().split(',').collect();
            if fields.len() != 4 {
                return Err(ReplayError::Malformed(format!("malformed seg snapshot: {line:?}")));
            }
            *slot = SegSnapshot {
                orig_selector: parse_hex(fields[0])? as u16,
                base: parse_hex(fields[1])?,
                limit: parse_hex(fields[2])?,
                flags: parse_hex(fields[3])?,
            };
        }
        let fx_line = read_line(r)?;
        let mut fxstate = Box::new([0u8; FXSTATE_SIZE]);
        let rest = fx_line
            .strip_prefix("fxstate:")
            .ok_or_else(|| ReplayError::Malformed(format!("expected fxstate line, found {fx_line:?}")))?;
        let mut bytes = rest.split_whitespace();
        for slot in fxstate.iter_mut() {
            let tok = bytes
                .next()
                .ok_or_else(|| ReplayError::Malformed("fxstate body too short".into()))?;
            *slot = u8::from_str_radix(tok, 16).map_err(|e| ReplayError::Malformed(e.to_string()))?;
        }

        Ok(MachineState {
            regs,
            eip,
            eflags,
            ldt,
            tr,
            gdt,
            idt,
            cr,
            interrupts_enabled,
            iopl,
            ac,
            a20_mask,
            segs,
            fxstate,
        })
    }
}

fn read_line(r: &mut impl BufRead) -> Result<String> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(ReplayError::Malformed("unexpected end of machine-state body".into()));
    }
    Ok(line.trim_end().to_string())
}

fn expect_label(r: &mut impl BufRead, label: &'static str) -> Result<()> {
    let line = read_line(r)?;
    if line.trim() != label {
        return Err(ReplayError::Malformed(format!("expected {label:?}, found {line:?}")));
    }
    Ok(())
}

fn split_label(line: &str) -> Result<(String, String)> {
    line.split_once(':')
        .map(|(a, b)| (a.trim().to_string(), b.to_string()))
        .ok_or_else(|| ReplayError::Malformed(format!("expected a labeled line, found {line:?}")))
}

fn parse_hex(s: &str) -> Result<u32> {
    u32::from_str_radix(s.trim(), 16).map_err(|e| ReplayError::Malformed(e.to_string()))
}

fn read_indexed_hex(r: &mut impl BufRead) -> Result<u32> {
    let line = read_line(r)?;
    let (_idx, rest) = split_label(&line)?;
    parse_hex(&rest)
}

fn read_labeled_hex(r: &mut impl BufRead, label: &'static str) -> Result<u32> {
    let line = read_line(r)?;
    let rest = line
        .strip_prefix(label)
        .ok_or_else(|| ReplayError::Malformed(format!("expected {label:?}, found {line:?}")))?;
    parse_hex(rest)
}

fn read_system_segment(r: &mut impl BufRead, label: &'static str) -> Result<SystemSegment> {
    let line = read_line(r)?;
    let rest = line
        .strip_prefix(label)
        .ok_or_else(|| ReplayError::Malformed(format!("expected {label:?}, found {line:?}")))?;
    let fields: Vec<&str> = rest.trim().split(',').collect();
    if fields.len() != 4 {
        return Err(ReplayError::Malformed(format!("malformed system segment: {line:?}")));
    }
    Ok(SystemSegment {
        selector: parse_hex(fields[0])? as u16,
        base: parse_hex(fields[1])?,
        limit: parse_hex(fields[2])?,
        flags: parse_hex(fields[3])?,
    })
}

fn read_table_descriptor(r: &mut impl BufRead, label: &'static str) -> Result<TableDescriptor> {
    let line = read_line(r)?;
    let rest = line
        .strip_prefix(label)
        .ok_or_else(|| ReplayError::Malformed(format!("expected {label:?}, found {line:?}")))?;
    let fields: Vec<&str> = rest.trim().split(',').collect();
    if fields.len() != 2 {
        return Err(ReplayError::Malformed(format!("malformed table descriptor: {line:?}")));
    }
    Ok(TableDescriptor {
        base: parse_hex(fields[0])?,
        limit: parse_hex(fields[1])?,
    })
}

/// Byte-compare a recorded RAM image against the guest's current RAM,
/// returning the first mismatching offset. Mirrors `replay_log_mem_cmp`'s
/// all-or-nothing comparison.
pub fn compare_ram(expected: &[u8], actual: &[u8]) -> Result<()> {
    if expected.len() != actual.len() {
        return Err(ReplayError::RamLengthMismatch {
            logged: expected.len(),
            actual: actual.len(),
        });
    }
    for (offset, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return Err(ReplayError::RamMismatch {
                offset,
                expected: *e,
                actual: *a,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MachineState {
        MachineState {
            regs: [1, 2, 3, 4, 5, 6, 7, 8],
            eip: 0x0040_1000,
            eflags: 0x202,
            ldt: SystemSegment::default(),
            tr: SystemSegment {
                selector: 0x28,
                base: 0x0010_0000,
                limit: 0x67,
                flags: 0x8b,
            },
            gdt: TableDescriptor {
                base: 0x0010_2000,
                limit: 0xffff,
            },
            idt: TableDescriptor {
                base: 0x0010_3000,
                limit: 0x7ff,
            },
            cr: [0x8000_0011, 0, 0x0040_0000, 0, 0],
            interrupts_enabled: true,
            iopl: 0,
            ac: false,
            a20_mask: 0xffff_ffff,
            segs: [SegSnapshot::default(); NUM_SEGS],
            fxstate: Box::new([0xab; FXSTATE_SIZE]),
        }
    }

    #[test]
    fn machine_state_round_trips_through_text() {
        let state = sample();
        let mut buf = Vec::new();
        state.write_body(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let parsed = MachineState::read_body(&mut cursor).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn ram_mismatch_reports_first_offset() {
        let expected = vec![1, 2, 3, 4];
        let actual = vec![1, 2, 9, 4];
        let err = compare_ram(&expected, &actual).unwrap_err();
        assert!(matches!(
            err,
            ReplayError::RamMismatch { offset: 2, expected: 3, actual: 9 }
        ));
    }

    #[test]
    fn ram_length_mismatch_is_reported_distinctly() {
        let err = compare_ram(&[1, 2, 3], &[1, 2]).unwrap_err();
        assert!(matches!(err, ReplayError::RamLengthMismatch { .. }));
    }
}
