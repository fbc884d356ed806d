//! The physical-identity map: a single page directory giving the monitor a
//! linear view of all host RAM, with its own reserved window backed by
//! lazily-faulted-in 4 KiB pages instead of a permanent large-page mapping.

use crate::consts::{in_monitor_window, MON_BASE, MON_END};
use crate::error::{PagingError, Result};
use crate::pte::{Pte, PteFlags};
use log::debug;
use trapmon_mem::{pd_index, pt_index, AllocFlags, PagePool, PhysicalAddr, SubPool, PAGE_SIZE};

/// Loads one page of the monitor's own image, as the boot loader would have
/// read it from disk. Injected so this crate never needs to know about disk
/// I/O.
pub trait MonitorImageSource {
    fn load_page(&self, offset_in_window: u32, buf: &mut [u8]);
}

pub struct PhysMap {
    pd: Vec<Pte>,
    /// Page table backing the monitor window, indexed the same way as `pd`
    /// entries would be, but flattened: one `Vec<Pte>` per 4 MiB slot the
    /// window spans.
    mon_pts: Vec<Vec<Pte>>,
    mon_first_slot: usize,
    ram_pages: usize,
}

impl PhysMap {
    /// Build the identity map over `ram_pages` 4 KiB pages of RAM.
    pub fn new(ram_pages: usize) -> Self {
        let mut pd = vec![Pte::empty(); 1024];
        let ram_bytes = ram_pages * PAGE_SIZE;
        let mon_slots = (MON_END - MON_BASE) as usize / trapmon_mem::LARGE_PAGE_SIZE;
        let mon_first_slot = (MON_BASE >> 22) as usize;
        let mut mon_pts = Vec::with_capacity(mon_slots);

        for slot in 0..1024usize {
            let slot_base = (slot as u32) << 22;
            if in_monitor_window(slot_base) {
                mon_pts.push(vec![Pte::empty(); 1024]);
                // PDE for the monitor window is installed once its backing
                // page table's physical address is known; see `bind_mon_pt`.
                continue;
            }
            if (slot_base as usize) < ram_bytes {
                pd[slot] = Pte::new_large(slot_base, PteFlags::P | PteFlags::W);
            }
        }

        PhysMap {
            pd,
            mon_pts,
            mon_first_slot,
            ram_pages,
        }
    }

    /// Bind the page-directory entry for monitor-window slot `slot` to the
    /// host-physical address the pool gave that page table.
    pub fn bind_mon_pt(&mut self, slot_in_window: usize, pt_phys: PhysicalAddr) {
        let slot = self.mon_first_slot + slot_in_window;
        self.pd[slot] = Pte::new(pt_phys.as_u32(), PteFlags::P | PteFlags::W);
    }

    pub fn ram_pages(&self) -> usize {
        self.ram_pages
    }

    pub fn pd(&self) -> &[Pte] {
        &self.pd
    }

    /// Resolve `fault_addr`, lazily filling in the monitor-window page table
    /// from `source` if the page has never been touched. Returns the
    /// host-physical address now backing `fault_addr`.
    pub fn install_page(
        &mut self,
        fault_addr: u32,
        pool: &mut PagePool,
        source: &dyn MonitorImageSource,
    ) -> Result<PhysicalAddr> {
        if !in_monitor_window(fault_addr) {
            // Outside the window the large-page identity mapping already
            // covers the address; there is nothing to install.
            let slot = pd_index(fault_addr);
            if !self.pd[slot].is_present() {
                return Err(PagingError::PdeNotPresent(slot));
            }
            return Ok(PhysicalAddr::new(fault_addr & !(PAGE_SIZE as u32 - 1)));
        }

        let slot_in_window = pd_index(fault_addr) - self.mon_first_slot;
        let pti = pt_index(fault_addr);
        let entry = self.mon_pts[slot_in_window][pti];
        if entry.is_present() {
            return Ok(PhysicalAddr::new(entry.addr()));
        }

        let page = pool.alloc(SubPool::Swap, 1, AllocFlags::ZERO)?;
        let mut buf = [0u8; PAGE_SIZE];
        let offset_in_window = fault_addr - MON_BASE;
        source.load_page(offset_in_window & !(PAGE_SIZE as u32 - 1), &mut buf);
        pool.write_page(page, &buf)?;
        debug!("physmap: installed monitor page at {fault_addr:#010x} -> {page}");

        self.mon_pts[slot_in_window][pti] = Pte::new(page.as_u32(), PteFlags::P | PteFlags::W);
        Ok(page)
    }

    pub fn mon_pt(&self, slot_in_window: usize) -> &[Pte] {
        &self.mon_pts[slot_in_window]
    }
}
