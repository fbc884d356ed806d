//! A 32-bit, non-PAE page-directory/page-table entry.
//!
//! Kept as a single `u32` sum-of-bitfields, matching the hardware layout
//! exactly, rather than as a struct of separate fields: the monitor reads and
//! writes these words directly as guest-physical and host-physical memory,
//! so there is no intermediate representation to keep in sync.

use bitflags::bitflags;
use trapmon_mem::PAGE_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const P  = 1 << 0; // present
        const W  = 1 << 1; // writable
        const U  = 1 << 2; // user-accessible
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const A  = 1 << 5; // accessed
        const D  = 1 << 6; // dirty (PTE only)
        const PS = 1 << 7; // page size (PDE only): 4 MiB page
        const G  = 1 << 8; // global
    }
}

pub const PTE_ADDR_MASK: u32 = 0xffff_f000;
pub const PDE_LARGE_ADDR_MASK: u32 = 0xffc0_0000;

/// A single page-directory or page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u32);

impl Pte {
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(addr: u32, flags: PteFlags) -> Self {
        debug_assert_eq!(addr & !PTE_ADDR_MASK, 0, "entry address must be page-aligned");
        Pte((addr & PTE_ADDR_MASK) | flags.bits())
    }

    pub fn new_large(addr: u32, flags: PteFlags) -> Self {
        debug_assert_eq!(
            addr & !PDE_LARGE_ADDR_MASK,
            0,
            "large-page entry address must be 4 MiB-aligned"
        );
        Pte((addr & PDE_LARGE_ADDR_MASK) | flags.bits() | PteFlags::PS.bits())
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PAGE_SIZE as u32 - 1))
    }

    pub fn addr(self) -> u32 {
        if self.flags().contains(PteFlags::PS) {
            self.0 & PDE_LARGE_ADDR_MASK
        } else {
            self.0 & PTE_ADDR_MASK
        }
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    pub fn with_flags(self, flags: PteFlags) -> Self {
        Pte((self.0 & !(PAGE_SIZE as u32 - 1)) | flags.bits())
    }
}
