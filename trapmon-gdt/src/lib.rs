//! The shared Global Descriptor Table and the per-segment descriptor cache
//! that lets the monitor and an unmodified 32-bit guest coexist in one GDT.

pub mod consts;
pub mod desc;
pub mod error;

use consts::*;
use desc::{get_seg_base, get_seg_flags, get_seg_limit, make_seg_desc, make_tss_desc, RawDescriptor, SegFlags};
use error::{GdtError, Result};
use log::{trace, warn};
use trapmon_mem::GuestPhysAddr;

/// Read/write access to the guest's idea of physical memory, as needed to
/// look up guest-resident descriptors. Implemented by the paging subsystem;
/// injected here so this crate never depends on it directly.
pub trait GuestMemory {
    fn read_u32(&self, addr: GuestPhysAddr) -> u32;
    fn write_u32(&mut self, addr: GuestPhysAddr, value: u32);
}

/// Notified whenever CS is reloaded, so the active shadow page directory can
/// follow the guest's current privilege level.
pub trait CplObserver {
    fn on_cpl_changed(&mut self, cpl: u8);
}

/// The cached view of one segment register: what the guest asked for, and
/// what the host actually has loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegCache {
    /// The selector actually loaded into the host segment register. Equal to
    /// `orig_selector` unless a shadow descriptor had to be synthesized.
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub flags: SegFlags,
}

impl SegCache {
    const fn null() -> Self {
        SegCache {
            selector: 0,
            base: 0,
            limit: 0,
            flags: SegFlags::empty(),
        }
    }
}

/// The shared GDT plus the six-entry descriptor cache.
pub struct Gdt {
    table: Vec<RawDescriptor>,
    segs: [SegCache; NUM_SEGS],
    /// The raw selector the guest last wrote into each register, independent
    /// of whatever shadow selector is actually loaded.
    orig_segs: [u16; NUM_SEGS],
    /// The guest's own GDTR, as last loaded via `lgdt`.
    guest_gdt_base: u32,
    guest_gdt_limit: u16,
    paging_enabled: bool,
}

impl Gdt {
    /// Build the GDT with the monitor's fixed slots populated and every
    /// guest-visible slot zeroed.
    pub fn new(monitor_tss_laddr: u32) -> Self {
        let mut table = vec![RawDescriptor { low: 0, high: 0 }; GDT_SIZE];

        table[(SEL_KCSEG / 8) as usize] = make_seg_desc(0, 0xfffff, TYPE_CODE, 0, true);
        table[(SEL_KDSEG / 8) as usize] = make_seg_desc(0, 0xfffff, TYPE_DATA, 0, true);
        table[(SEL_UCSEG / 8) as usize] = make_seg_desc(0, 0xfffff, TYPE_CODE, 3, true);
        table[(SEL_UDSEG / 8) as usize] = make_seg_desc(0, 0xfffff, TYPE_DATA, 3, true);
        table[(SEL_TSS / 8) as usize] = make_tss_desc(monitor_tss_laddr);
        table[(SEL_TMPSEG / 8) as usize] = make_seg_desc(0, 0xfffff, TYPE_DATA, 3, true);

        Gdt {
            table,
            segs: [SegCache::null(); NUM_SEGS],
            orig_segs: [0; NUM_SEGS],
            guest_gdt_base: 0,
            guest_gdt_limit: 0,
            paging_enabled: false,
        }
    }

    pub fn seg(&self, segno: usize) -> SegCache {
        self.segs[segno]
    }

    pub fn orig_selector(&self, segno: usize) -> u16 {
        self.orig_segs[segno]
    }

    pub fn set_paging_enabled(&mut self, enabled: bool) {
        self.paging_enabled = enabled;
    }

    /// Raw table contents, for passing to `Arch::lgdt`.
    pub fn table(&self) -> &[RawDescriptor] {
        &self.table
    }

    /// Guest `LGDT base, limit`. Zeroes every guest-visible slot so
    /// descriptors are refilled lazily on next use, and rejects a guest GDT
    /// that would not fit below the monitor's reserved slots.
    pub fn load_gdt(&mut self, base: u32, limit: u16) -> Result<()> {
        if (limit as u32) + 1 > SEL_BASE as u32 {
            return Err(GdtError::GuestGdtTooLarge { limit });
        }
        self.guest_gdt_base = base;
        self.guest_gdt_limit = limit;
        for slot in 0..(SEL_BASE / 8) as usize {
            self.table[slot] = RawDescriptor { low: 0, high: 0 };
        }
        trace!("gdt: loaded guest GDT base={base:#010x} limit={limit:#06x}");
        Ok(())
    }

    /// Read a descriptor either from the shared table directly (`shadow =
    /// true`) or from guest memory through `mem` (`shadow = false`),
    /// optionally setting the descriptor's accessed bit in guest memory.
    pub fn read_segment(
        &mut self,
        mem: &mut dyn GuestMemory,
        selector: u16,
        shadow: bool,
        set_accessed: bool,
    ) -> Result<RawDescriptor> {
        if selector & 0x4 != 0 {
            return Err(GdtError::LdtNotSupported);
        }
        let index = (selector >> 3) as usize;

        if shadow {
            return Ok(self.table[index]);
        }

        if (index as u32) * 8 + 7 > self.guest_gdt_limit as u32 {
            return Err(GdtError::OutOfRange {
                selector,
                limit: self.guest_gdt_limit,
            });
        }

        let addr = self.guest_gdt_base + index as u32 * 8;
        let low = mem.read_u32(GuestPhysAddr::new(addr));
        let high = mem.read_u32(GuestPhysAddr::new(addr + 4));
        let desc = RawDescriptor { low, high };

        if set_accessed && !get_seg_flags(desc).contains(SegFlags::ACCESSED) {
            let accessed_high = high | SegFlags::ACCESSED.bits();
            mem.write_u32(GuestPhysAddr::new(addr + 4), accessed_high);
        }

        Ok(desc)
    }

    /// Build (or rebuild) the shadow descriptor for `segno` in the monitor's
    /// own GDT slot from the cached `SegCache`. The shadow is always a data
    /// descriptor at DPL 3, regardless of what kind of segment the guest
    /// originally loaded: the host CPU only ever needs it to bound an
    /// ordinary memory access, never to execute guest code directly.
    pub fn make_shadow_segdesc(&mut self, segno: usize) {
        let sc = self.segs[segno];
        let granularity = sc.flags.contains(SegFlags::GRANULARITY);
        let limit = if granularity { sc.limit >> 12 } else { sc.limit };
        let desc = make_seg_desc(sc.base, limit, TYPE_DATA, 3, granularity);
        let slot = (SEL_SHADOW as usize / 8) + segno;
        self.table[slot] = desc;
    }

    /// Cache a freshly loaded segment register and, if necessary, synthesize
    /// a shadow selector for it. Mirrors `load_seg_cache` from the reference
    /// monitor: a shadow is needed whenever paging is off (every selector is
    /// effectively untranslated) or the guest's own selector collides with
    /// the monitor's reserved range.
    pub fn load_seg_cache(
        &mut self,
        segno: usize,
        selector: u16,
        base: u32,
        limit: u32,
        flags: SegFlags,
        cpl_observer: &mut dyn CplObserver,
    ) {
        self.orig_segs[segno] = selector;
        let mut sc = SegCache {
            selector: selector | 3,
            base,
            limit,
            flags,
        };

        if !self.paging_enabled || selector >= SEL_BASE {
            sc.selector = (SEL_SHADOW + segno as u16 * 8) | 3;
        }
        self.segs[segno] = sc;
        self.make_shadow_segdesc(segno);

        if segno == SEG_CS {
            cpl_observer.on_cpl_changed((sc.selector & 3) as u8);
        }
    }

    /// Re-synchronize a segment cache with the guest's own (possibly
    /// modified) descriptor, as triggered by a `#GP` on descriptor access.
    /// A no-op when the host is currently running on a shadow selector: in
    /// that case the cache already reflects the last `load_seg_cache` call
    /// and nothing the guest does to its own GDT entry is visible until the
    /// segment register is reloaded.
    pub fn segcache_sync(&mut self, mem: &mut dyn GuestMemory, segno: usize) -> Result<()> {
        if self.segs[segno].selector >= SEL_BASE {
            return Ok(());
        }
        let orig = self.orig_segs[segno];
        let desc = self.read_segment(mem, orig, false, false)?;
        let accessed = self.segs[segno].flags.contains(SegFlags::ACCESSED);
        let mut flags = get_seg_flags(desc);
        if accessed {
            flags |= SegFlags::ACCESSED;
        }
        self.segs[segno].base = get_seg_base(desc);
        self.segs[segno].limit = get_seg_limit(desc);
        self.segs[segno].flags = flags;
        self.make_shadow_segdesc(segno);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMem(HashMap<u32, u32>);
    impl GuestMemory for FakeMem {
        fn read_u32(&self, addr: GuestPhysAddr) -> u32 {
            *self.0.get(&addr.as_u32()).unwrap_or(&0)
        }
        fn write_u32(&mut self, addr: GuestPhysAddr, value: u32) {
            self.0.insert(addr.as_u32(), value);
        }
    }

    struct NullCpl;
    impl CplObserver for NullCpl {
        fn on_cpl_changed(&mut self, _cpl: u8) {}
    }

    #[test]
    fn shadow_descriptor_is_always_data_dpl3() {
        let mut gdt = Gdt::new(0xffc0_1000);
        gdt.set_paging_enabled(true);
        let mut cpl = NullCpl;
        gdt.load_seg_cache(
            SEG_CS,
            0x08,
            0,
            0xffff_ffff,
            SegFlags::CODE | SegFlags::PRESENT | SegFlags::GRANULARITY,
            &mut cpl,
        );
        // selector 0x08 < SEL_BASE, paging enabled -> no shadow substitution
        assert_eq!(gdt.seg(SEG_CS).selector, 0x08 | 3);
        let shadow = gdt.table()[(SEL_SHADOW as usize / 8) + SEG_CS];
        assert_eq!(get_seg_flags(shadow).ty(), TYPE_DATA as u32);
        assert_eq!(get_seg_flags(shadow).dpl(), 3);
    }

    #[test]
    fn paging_off_forces_shadow_selector() {
        let mut gdt = Gdt::new(0xffc0_1000);
        gdt.set_paging_enabled(false);
        let mut cpl = NullCpl;
        gdt.load_seg_cache(SEG_DS, 0x10, 0, 0xffffffff, SegFlags::PRESENT, &mut cpl);
        assert_eq!(
            gdt.seg(SEG_DS).selector,
            (SEL_SHADOW + SEG_DS as u16 * 8) | 3
        );
    }

    #[test]
    fn segcache_sync_is_identity_without_guest_modification() {
        let mut gdt = Gdt::new(0xffc0_1000);
        gdt.set_paging_enabled(true);
        gdt.load_gdt(0x1000, 0x3ff).unwrap();
        let desc = make_seg_desc(0x2000_0000, 0xfffff, TYPE_DATA, 0, true);
        let mut mem = FakeMem(HashMap::new());
        mem.write_u32(GuestPhysAddr::new(0x1008), desc.low);
        mem.write_u32(GuestPhysAddr::new(0x100c), desc.high);

        let mut cpl = NullCpl;
        gdt.load_seg_cache(
            SEG_DS,
            0x08,
            get_seg_base(desc),
            get_seg_limit(desc),
            get_seg_flags(desc),
            &mut cpl,
        );
        let before = gdt.seg(SEG_DS);
        gdt.segcache_sync(&mut mem, SEG_DS).unwrap();
        let after = gdt.seg(SEG_DS);
        assert_eq!(before.base, after.base);
        assert_eq!(before.limit, after.limit);
    }

    #[test]
    fn oversized_guest_gdt_is_rejected() {
        let mut gdt = Gdt::new(0xffc0_1000);
        assert!(matches!(
            gdt.load_gdt(0, SEL_BASE),
            Err(GdtError::GuestGdtTooLarge { .. })
        ));
    }
}
