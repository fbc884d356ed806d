//! Port I/O interposition: every guest `in`/`out` passes through here so it
//! can be recorded or replayed. Mirrors `sys/io.c`'s `rr_in*`/`rr_out*`
//! entry points in the reference monitor.

use crate::bitmap::PortBitmap;
use crate::error::{IoError, Result};
use crate::journal::{IoJournal, IoWidth};
use log::warn;
use std::any::Any;
use std::collections::HashMap;

pub type ReadHandler = fn(&mut dyn Any, u16, &mut [u8]);
pub type WriteHandler = fn(&mut dyn Any, u16, &[u8]);

struct Registration {
    cookie: Box<dyn Any>,
    read: Option<ReadHandler>,
    write: Option<WriteHandler>,
}

/// Whether the ring is recording guest-observable nondeterminism or
/// replaying a previously recorded log. A ring not attached to either
/// (`Off`) still dispatches to devices but never touches a journal — used
/// by tests and by a plain `run` session with no log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrMode {
    Record,
    Replay,
    Off,
}

/// Device registry plus per-port logging policy for the guest's entire
/// 16-bit I/O address space.
pub struct PortRing {
    mode: RrMode,
    log_in: PortBitmap,
    log_out: PortBitmap,
    devices: HashMap<u16, Registration>,
}

impl PortRing {
    pub fn new(mode: RrMode) -> Self {
        PortRing {
            mode,
            log_in: PortBitmap::new(),
            log_out: PortBitmap::new(),
            devices: HashMap::new(),
        }
    }

    /// Register a device's callbacks for `port`. `log_reads`/`log_writes`
    /// set this port's bit in the respective bitmap so its accesses are
    /// recorded or replayed rather than just dispatched to the device.
    pub fn register(
        &mut self,
        port: u16,
        read: Option<ReadHandler>,
        write: Option<WriteHandler>,
        cookie: Box<dyn Any>,
        log_reads: bool,
        log_writes: bool,
    ) {
        if log_reads {
            self.log_in.set(port);
        }
        if log_writes {
            self.log_out.set(port);
        }
        self.devices.insert(port, Registration { cookie, read, write });
    }

    fn device_read(&mut self, port: u16, width: IoWidth) -> u32 {
        let handled = match self.devices.get_mut(&port) {
            Some(reg) => match reg.read {
                Some(f) => {
                    let mut buf = [0u8; 4];
                    f(reg.cookie.as_mut(), port, &mut buf[..width.bytes()]);
                    Some(buf)
                }
                None => {
                    warn!("port {port:#06x}: no read handler registered, returning all-ones");
                    None
                }
            },
            None => {
                warn!("port {port:#06x}: unregistered port read, returning all-ones");
                None
            }
        };
        match handled {
            Some(buf) => match width {
                IoWidth::Byte => buf[0] as u32,
                IoWidth::Word => u16::from_le_bytes([buf[0], buf[1]]) as u32,
                IoWidth::Dword => u32::from_le_bytes(buf),
            },
            // Unassigned ports read as all-ones on real PC hardware.
            None => match width {
                IoWidth::Byte => 0xff,
                IoWidth::Word => 0xffff,
                IoWidth::Dword => 0xffff_ffff,
            },
        }
    }

    fn device_write(&mut self, port: u16, width: IoWidth, value: u32) {
        let bytes = value.to_le_bytes();
        match self.devices.get_mut(&port) {
            Some(reg) => match reg.write {
                Some(f) => f(reg.cookie.as_mut(), port, &bytes[..width.bytes()]),
                None => warn!("port {port:#06x}: no write handler registered, dropping write"),
            },
            None => warn!("port {port:#06x}: unregistered port write, dropping it"),
        }
    }

    fn rr_in(&mut self, n_exec: u64, port: u16, width: IoWidth, journal: &mut dyn IoJournal) -> u32 {
        if self.mode == RrMode::Replay && self.log_in.test(port) {
            return journal.replay_in(n_exec, port, width);
        }
        let value = self.device_read(port, width);
        if self.mode == RrMode::Record && self.log_in.test(port) {
            journal.record_in(n_exec, port, width, value);
        }
        value
    }

    fn rr_out(&mut self, n_exec: u64, port: u16, width: IoWidth, value: u32, journal: &mut dyn IoJournal) {
        self.device_write(port, width, value);
        if self.log_out.test(port) {
            match self.mode {
                RrMode::Record => journal.record_out(n_exec, port, width, value),
                RrMode::Replay => journal.replay_out(n_exec, port, width),
                RrMode::Off => {}
            }
        }
    }

    pub fn rr_inb(&mut self, n_exec: u64, port: u16, journal: &mut dyn IoJournal) -> u8 {
        self.rr_in(n_exec, port, IoWidth::Byte, journal) as u8
    }

    pub fn rr_inw(&mut self, n_exec: u64, port: u16, journal: &mut dyn IoJournal) -> u16 {
        self.rr_in(n_exec, port, IoWidth::Word, journal) as u16
    }

    pub fn rr_inl(&mut self, n_exec: u64, port: u16, journal: &mut dyn IoJournal) -> u32 {
        self.rr_in(n_exec, port, IoWidth::Dword, journal)
    }

    pub fn rr_outb(&mut self, n_exec: u64, port: u16, value: u8, journal: &mut dyn IoJournal) {
        self.rr_out(n_exec, port, IoWidth::Byte, value as u32, journal)
    }

    pub fn rr_outw(&mut self, n_exec: u64, port: u16, value: u16, journal: &mut dyn IoJournal) {
        self.rr_out(n_exec, port, IoWidth::Word, value as u32, journal)
    }

    pub fn rr_outl(&mut self, n_exec: u64, port: u16, value: u32, journal: &mut dyn IoJournal) {
        self.rr_out(n_exec, port, IoWidth::Dword, value, journal)
    }

    /// Repeated input into `buf`, `width` bytes at a time (the `insb`/`insw`/
    /// `insd` family).
    pub fn rr_ins(&mut self, n_exec: u64, port: u16, width: IoWidth, buf: &mut [u8], journal: &mut dyn IoJournal) -> Result<()> {
        if buf.len() % width.bytes() != 0 {
            return Err(IoError::MisalignedStringIo {
                requested: buf.len(),
                width: width.bytes(),
            });
        }
        for chunk in buf.chunks_mut(width.bytes()) {
            let value = self.rr_in(n_exec, port, width, journal);
            chunk.copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
        }
        Ok(())
    }

    /// Repeated output from `buf`, `width` bytes at a time (`outsb`/`outsw`/
    /// `outsd`).
    pub fn rr_outs(&mut self, n_exec: u64, port: u16, width: IoWidth, buf: &[u8], journal: &mut dyn IoJournal) -> Result<()> {
        if buf.len() % width.bytes() != 0 {
            return Err(IoError::MisalignedStringIo {
                requested: buf.len(),
                width: width.bytes(),
            });
        }
        for chunk in buf.chunks(width.bytes()) {
            let mut padded = [0u8; 4];
            padded[..chunk.len()].copy_from_slice(chunk);
            let value = u32::from_le_bytes(padded);
            self.rr_out(n_exec, port, width, value, journal);
        }
        Ok(())
    }
}
