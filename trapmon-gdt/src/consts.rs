//! GDT layout constants.
//!
//! Slots `[0, SEL_BASE)` mirror the guest's own GDT, one descriptor lazily
//! filled in per guest selector in use. Slots at and above `SEL_BASE` are
//! reserved for the monitor: its own code/data, the TSS, a scratch selector,
//! and one "shadow" slot per segment register for guest descriptors that
//! collide with the monitor's range or that must be used while paging is off.

/// Number of segment registers tracked: ES, CS, SS, DS, FS, GS (QEMU ordering,
/// carried over from the monitor this design descends from).
pub const NUM_SEGS: usize = 6;
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;

pub const SEL_NULL: u16 = 0x00;
pub const SEL_KCSEG: u16 = 0x08;
pub const SEL_KDSEG: u16 = 0x10;
pub const SEL_UCSEG: u16 = 0x18 | 3;
pub const SEL_UDSEG: u16 = 0x20 | 3;
pub const SEL_TSS: u16 = 0x28;
pub const SEL_TMPSEG: u16 = 0x30 | 3;

/// First slot reserved for shadow descriptors, one per segment register.
pub const SEL_SHADOW: u16 = 0x38;

/// First guest-visible slot index. Slots below this belong to the guest;
/// at and above, to the monitor.
pub const SEL_BASE: u16 = SEL_SHADOW + (NUM_SEGS as u16) * 8;

/// Total number of 8-byte descriptor slots. A 16-bit GDT limit can address
/// at most 8192 slots; we allocate the architectural maximum so the guest
/// never needs to be told its GDT is too small.
pub const GDT_SIZE: usize = 8192;

/// Descriptor type for a code segment (execute/read).
pub const TYPE_CODE: u8 = 0xA;
/// Descriptor type for a data segment (read/write).
pub const TYPE_DATA: u8 = 0x2;
/// Descriptor type for a 32-bit available TSS.
pub const TYPE_TSS: u8 = 0x9;
