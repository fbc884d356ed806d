//! Per-guest-CPL shadow page directory.
//!
//! A [`ShadowPageDirectory`] mirrors the layout of the guest's current
//! `CR3` page directory but translates guest-physical addresses to
//! host-physical ones and keeps the monitor's own reserved window entirely
//! out of the guest's reach. Entries are synthesized lazily, one fault at a
//! time, by [`ShadowPageDirectory::install_pde`] /
//! [`ShadowPageDirectory::install_pte`]; nothing here decides *when* to
//! install — that triage lives in the fault dispatcher, which is the only
//! caller that also has the guest's own walk result to install from.

use crate::consts::in_monitor_window;
use crate::physmap::MonitorImageSource;
use crate::pte::{Pte, PteFlags};
use crate::walk::WalkError;
use std::collections::HashMap;
use trapmon_mem::{pd_index, pt_index, AllocFlags, GuestPhysAddr, PagePool, PhysicalAddr, SubPool, PAGE_SIZE};

use crate::mtrace::TraceTable;

/// Derive a shadow PTE/PDE's flags from the guest's: the hardware always
/// runs the guest at CPL 3, so `U` is forced; writability is copied as-is;
/// the global bit never survives into a shadow (every shadow is torn down
/// and rebuilt across a `CR3` switch, so "global" has no meaning here).
fn shadow_flags(guest: PteFlags) -> PteFlags {
    (guest & !(PteFlags::PS | PteFlags::G)) | PteFlags::U
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowWalkOutcome {
    pub phys: PhysicalAddr,
    pub pte_addr: PhysicalAddr,
    /// Flags of the leaf entry that resolved the walk, so a caller can tell
    /// a genuine permission mismatch (write fault on a read-only shadow
    /// leaf) apart from a translation that's simply missing.
    pub pte_flags: PteFlags,
}

/// One guest CPL's worth of shadow translations: a top-level directory plus
/// the page tables it points at, each obtained from the [`trapmon_mem`]
/// page pool's `Swap` sub-pool (mirroring the reference monitor, where both
/// shadow page tables and monitor-window shadow pages are `swap_get_page`
/// allocations).
pub struct ShadowPageDirectory {
    pd: [Pte; 1024],
    tables: HashMap<u32, Vec<Pte>>,
}

impl ShadowPageDirectory {
    pub fn new() -> Self {
        ShadowPageDirectory {
            pd: [Pte::empty(); 1024],
            tables: HashMap::new(),
        }
    }

    pub fn pde(&self, pdi: usize) -> Pte {
        self.pd[pdi]
    }

    /// Walk the shadow tables for `vaddr`. Unlike [`crate::walk::guest_walk`]
    /// this never checks protection (the guest walk that preceded it already
    /// did) and never touches Accessed/Dirty — those bits belong to the
    /// guest's own tables, not the shadow's.
    pub fn shadow_walk(&self, vaddr: u32) -> core::result::Result<ShadowWalkOutcome, WalkError> {
        let pdi = pd_index(vaddr);
        let pde = self.pd[pdi];
        if !pde.is_present() {
            return Err(WalkError::PdeNotPresent(pdi));
        }
        if pde.flags().contains(PteFlags::PS) {
            let phys = pde.addr() + (vaddr & (trapmon_mem::LARGE_PAGE_SIZE as u32 - 1)) as usize;
            // Large shadow PDEs are never installed by this crate (§4.4
            // always expands a guest large page into fine shadow PTEs), but
            // the walk still knows how to resolve one defensively.
            return Ok(ShadowWalkOutcome {
                phys: PhysicalAddr::new(phys),
                pte_addr: PhysicalAddr::new(pde.addr()),
                pte_flags: pde.flags(),
            });
        }

        let pti = pt_index(vaddr);
        let pt_phys = pde.addr();
        let table = self.tables.get(&pt_phys).expect("pde present without table");
        let pte = table[pti];
        if !pte.is_present() {
            return Err(WalkError::PteNotPresent(pti));
        }
        let phys = pte.addr() + (vaddr & (PAGE_SIZE as u32 - 1)) as usize;
        Ok(ShadowWalkOutcome {
            phys: PhysicalAddr::new(phys),
            pte_addr: PhysicalAddr::new(pt_phys + (pti as u32) * 4),
            pte_flags: pte.flags(),
        })
    }

    /// Synthesize the shadow PDE for `pdi` from the guest's own PDE flags.
    /// `guest_pde_flags` should have `PS` already cleared by the caller when
    /// expanding a guest large page (§4.4 step 4's "pretend it is a fine
    /// PTE" rule applies one level up, to the PTE, not here).
    pub fn install_pde(
        &mut self,
        pdi: usize,
        guest_pde_flags: PteFlags,
        pool: &mut PagePool,
    ) -> trapmon_mem::Result<()> {
        let pt_phys = pool.alloc(SubPool::Swap, 1, AllocFlags::ZERO)?;
        self.tables.insert(pt_phys.as_u32(), vec![Pte::empty(); 1024]);
        self.pd[pdi] = Pte::new(pt_phys.as_u32(), shadow_flags(guest_pde_flags));
        Ok(())
    }

    /// Synthesize the shadow PTE at `(pdi, pti)` for a guest translation
    /// resolving to `guest_phys` with `guest_pte_flags`. If `guest_phys`
    /// falls in the monitor's reserved window, a swap page mirroring the
    /// on-disk monitor image backs the shadow PTE instead of the guest's
    /// physical page (§4.4, §4.3). If a tracer is armed for `guest_phys`,
    /// the shadow PTE is installed read-only and bound into `trace` so a
    /// later write fault resolves to it directly.
    pub fn install_pte(
        &mut self,
        pdi: usize,
        pti: usize,
        guest_phys: GuestPhysAddr,
        guest_pte_flags: PteFlags,
        pool: &mut PagePool,
        trace: &mut TraceTable,
        image: &dyn MonitorImageSource,
    ) -> trapmon_mem::Result<()> {
        let pt_phys = self.pd[pdi].addr();
        let mut flags = shadow_flags(guest_pte_flags);

        let pte = if in_monitor_window(guest_phys.as_u32()) {
            let swap_page = pool.alloc(SubPool::Swap, 1, AllocFlags::ZERO)?;
            let mut buf = [0u8; PAGE_SIZE];
            let offset = (guest_phys.as_u32() - crate::consts::MON_BASE) & !(PAGE_SIZE as u32 - 1);
            image.load_page(offset, &mut buf);
            pool.write_page(swap_page, &buf)?;
            Pte::new(swap_page.as_u32(), flags)
        } else {
            if trace.is_traced(guest_phys) {
                flags.remove(PteFlags::W);
            }
            let pte = Pte::new(guest_phys.as_u32(), flags);
            let shadow_pte_addr = PhysicalAddr::new(pt_phys + (pti as u32) * 4);
            trace.bind_shadow_pte(guest_phys, shadow_pte_addr);
            pte
        };

        let table = self
            .tables
            .get_mut(&pt_phys)
            .expect("install_pte called before install_pde");
        table[pti] = pte;
        Ok(())
    }

    /// Directly overwrite an already-installed shadow PTE, e.g. when a
    /// traced write has been resolved and the shadow must reflect the
    /// guest's new mapping without another fault.
    pub fn overwrite_pte(&mut self, pdi: usize, pti: usize, pte: Pte) {
        let pt_phys = self.pd[pdi].addr();
        if let Some(table) = self.tables.get_mut(&pt_phys) {
            table[pti] = pte;
        }
    }

    /// Re-synchronize every already-installed top-level entry against the
    /// guest's current page directory (`guest_pd`), as triggered by a `CR3`
    /// reload or TLB flush. An entry whose guest PDE is no longer present,
    /// or whose guest PDE now points at different guest-physical storage,
    /// is discarded (its fine-grained shadow is rebuilt lazily on next
    /// fault); one that still matches simply has its flags refreshed.
    /// Entries with no shadow yet are left alone — lazy synthesis covers
    /// them the first time the guest faults on them.
    ///
    /// The discarded entry's backing page table is always a page
    /// `install_pde` allocated from the `Swap` sub-pool (§4.1), so it is
    /// returned there rather than merely dropped from `self.tables` — every
    /// ordinary guest `CR3` switch would otherwise leak one `Swap` page per
    /// stale top-level entry until `SWAP_LIMIT` was exhausted.
    pub fn resync(&mut self, guest_pd: &[Pte; 1024], pool: &mut PagePool) {
        let stale: Vec<usize> = (0..1024)
            .filter(|&i| {
                let shadow = self.pd[i];
                if !shadow.is_present() {
                    return false;
                }
                let guest = guest_pd[i];
                !guest.is_present() || guest.flags().contains(PteFlags::PS)
            })
            .collect();
        for i in stale {
            let pt_phys = self.pd[i].addr();
            self.tables.remove(&pt_phys);
            if let Err(err) = pool.free(SubPool::Swap, PhysicalAddr::new(pt_phys), 1) {
                log::warn!("shadow: freeing stale page table at {pt_phys:#010x}: {err}");
            }
            self.pd[i] = Pte::empty();
        }
        for i in 0..1024 {
            if self.pd[i].is_present() && guest_pd[i].is_present() {
                self.pd[i] = self.pd[i].with_flags(shadow_flags(guest_pd[i].flags()));
            }
        }
    }
}

impl Default for ShadowPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}
