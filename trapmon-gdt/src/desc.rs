//! Raw x86 segment descriptor packing/unpacking.
//!
//! A descriptor is two packed 32-bit halves, `(low, high)`. [`SegFlags`]
//! names the bits of the high half that `gdt_make_shadow_segdesc` and
//! `read_segment` care about; we keep the raw pack/unpack functions
//! bit-for-bit faithful to the reference layout rather than modeling every
//! field as its own struct member, since that is the representation the
//! descriptor cache itself exchanges with guest memory.

use bitflags::bitflags;

bitflags! {
    /// The high dword of a segment descriptor, as cached alongside base/limit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegFlags: u32 {
        const ACCESSED       = 1 << 8;
        const TYPE_RW_OR_CS  = 1 << 9;  // data: writable, code: readable
        const TYPE_EXPAND_OR_CONFORM = 1 << 10;
        const CODE           = 1 << 11; // 1 = code, 0 = data
        const NON_SYSTEM     = 1 << 12; // S bit: 1 = code/data, 0 = system
        const DPL_0          = 0;
        const PRESENT        = 1 << 15;
        const AVAILABLE      = 1 << 20;
        const BIG            = 1 << 22; // D/B bit: 32-bit segment
        const GRANULARITY    = 1 << 23; // limit is in 4 KiB units
    }
}

impl SegFlags {
    pub fn dpl(self) -> u8 {
        ((self.bits() >> 13) & 0x3) as u8
    }

    pub fn with_dpl(self, dpl: u8) -> Self {
        Self::from_bits_truncate((self.bits() & !(0x3 << 13)) | ((dpl as u32 & 0x3) << 13))
    }

    pub fn ty(self) -> u8 {
        ((self.bits() >> 8) & 0xf) as u8
    }
}

/// A raw (low, high) descriptor pair as it sits in the GDT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDescriptor {
    pub low: u32,
    pub high: u32,
}

/// Pack a code or data descriptor.
pub fn make_seg_desc(base: u32, limit: u32, ty: u8, dpl: u8, granularity: bool) -> RawDescriptor {
    let low = (limit & 0xffff) | ((base & 0xffff) << 16);
    let mut high = ((base >> 16) & 0xff)
        | ((ty as u32) << 8)
        | (1 << 12) // S = 1: code/data
        | ((dpl as u32 & 0x3) << 13)
        | (1 << 15) // present
        | (((limit >> 16) & 0xf) << 16)
        | (1 << 22) // 32-bit segment
        | (((base >> 24) & 0xff) << 24);
    if granularity {
        high |= 1 << 23;
    }
    RawDescriptor { low, high }
}

/// Pack a 32-bit available-TSS system descriptor.
pub fn make_tss_desc(addr: u32) -> RawDescriptor {
    const TSS_LIMIT: u32 = 0x67;
    let low = (TSS_LIMIT & 0xffff) | ((addr & 0xffff) << 16);
    let high = ((addr >> 16) & 0xff)
        | (super::consts::TYPE_TSS as u32) << 8
        | (1 << 15) // present
        | (((addr >> 24) & 0xff) << 24);
    RawDescriptor { low, high }
}

pub fn get_seg_base(d: RawDescriptor) -> u32 {
    ((d.low >> 16) & 0xffff) | ((d.high & 0xff) << 16) | (((d.high >> 24) & 0xff) << 24)
}

pub fn get_seg_limit(d: RawDescriptor) -> u32 {
    let limit = (d.low & 0xffff) | (((d.high >> 16) & 0xf) << 16);
    if SegFlags::from_bits_truncate(d.high).contains(SegFlags::GRANULARITY) {
        (limit << 12) | 0xfff
    } else {
        limit
    }
}

pub fn get_seg_flags(d: RawDescriptor) -> SegFlags {
    SegFlags::from_bits_truncate(d.high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_base_and_limit() {
        let d = make_seg_desc(0x1234_5000, 0xfffff, 0xA, 0, true);
        assert_eq!(get_seg_base(d), 0x1234_5000);
        assert_eq!(get_seg_limit(d), 0xffff_f000 | 0xfff);
        assert_eq!(get_seg_flags(d).dpl(), 0);
    }

    #[test]
    fn non_granular_limit_is_byte_exact() {
        let d = make_seg_desc(0, 0x67, super::super::consts::TYPE_TSS, 0, false);
        assert_eq!(get_seg_limit(d), 0x67);
    }
}
