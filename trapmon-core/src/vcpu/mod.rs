//! Per-guest-CPU register and descriptor state.
//!
//! Shadow page directories and the shared GDT are resources the page pool
//! and [`crate::world::World`] own; what lives here is everything specific
//! to the one virtual CPU this monitor drives: general registers, the
//! control/debug register file, the system-segment descriptors a `sidt`/
//! `sldt`/`str` would read back, the A20 gate, and the record/replay
//! timeline key `n_exec`.

use trapmon_replay::{SystemSegment, TableDescriptor};

pub const NUM_REGS: usize = 8;
pub const NUM_CRS: usize = 5;
pub const NUM_DEBUG_REGS: usize = 8;

/// `addr & a20_mask` reproduces the real A20 gate's effect (aliasing bit 20)
/// without branching on every memory access, the same trick the reference
/// monitor's `a20_translate` uses.
pub const A20_ENABLED_MASK: u32 = 0xffff_ffff;
pub const A20_DISABLED_MASK: u32 = 0xffef_ffff;

/// Which of the two per-CPL shadow page directories `CR3` currently walks
/// through, mirrored here for bookkeeping (the directories themselves live
/// in `World`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveShadow {
    Supervisor,
    User,
    None,
}

/// Interrupt-delivery bookkeeping the dispatcher consults before injecting a
/// pending IRQ: whether one is pending, and whether the guest is inside an
/// `sti`/`mov ss` shadow that must suppress delivery for one instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptState {
    pub pending_irq: Option<u8>,
    pub inhibit: bool,
}

/// One guest virtual CPU.
pub struct Vcpu {
    pub regs: [u32; NUM_REGS],
    pub eflags: u32,
    pub eip: u32,
    pub ldt: SystemSegment,
    pub tr: SystemSegment,
    pub gdt: TableDescriptor,
    pub idt: TableDescriptor,
    pub cr: [u32; NUM_CRS],
    pub debug_regs: [u32; NUM_DEBUG_REGS],
    pub a20_mask: u32,
    pub active_shadow: ActiveShadow,
    pub interrupts: InterruptState,
    /// Monotonically increasing count of retired guest instructions, the
    /// record/replay timeline's sole ordering key.
    pub n_exec: u64,
    /// Scratch slots for a translation-cache callout context. The peephole
    /// translator that would index into this has no counterpart in this
    /// crate; kept as an opaque array so nothing downstream has to special-
    /// case "no TC" when threading VCPU state through.
    pub callout_scratch: [u32; 4],
}

impl Vcpu {
    pub fn new() -> Self {
        Vcpu {
            regs: [0; NUM_REGS],
            eflags: 0x0000_0002,
            eip: 0,
            ldt: SystemSegment::default(),
            tr: SystemSegment::default(),
            gdt: TableDescriptor::default(),
            idt: TableDescriptor::default(),
            cr: [0; NUM_CRS],
            debug_regs: [0; NUM_DEBUG_REGS],
            a20_mask: A20_DISABLED_MASK,
            active_shadow: ActiveShadow::None,
            interrupts: InterruptState::default(),
            n_exec: 0,
            callout_scratch: [0; 4],
        }
    }

    pub fn set_a20(&mut self, enabled: bool) {
        self.a20_mask = if enabled { A20_ENABLED_MASK } else { A20_DISABLED_MASK };
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_mask == A20_ENABLED_MASK
    }

    /// Apply the A20 gate to a guest-physical address, as real hardware does
    /// between the address bus and the memory controller.
    pub fn mask_a20(&self, addr: u32) -> u32 {
        addr & self.a20_mask
    }

    pub fn bump_n_exec(&mut self) {
        self.n_exec += 1;
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr[0] & 0x8000_0000 != 0
    }
}

impl Default for Vcpu {
    fn default() -> Self {
        Self::new()
    }
}
