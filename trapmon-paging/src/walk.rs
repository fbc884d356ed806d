//! Guest page-table walker.
//!
//! Walks a guest's own page directory/page table through guest-physical
//! memory (as seen through `phys_map`), mirroring `pt_walk` from the
//! reference monitor. The shadow walker in [`crate::shadow`] re-implements
//! the same index math over the monitor's own, directly addressable shadow
//! tables rather than sharing this function, since the two walk entirely
//! different backing stores (guest memory through a trait object vs. the
//! monitor's in-process arena).

use crate::pte::{Pte, PteFlags};
use bitflags::bitflags;
use thiserror::Error;
use trapmon_mem::guest::GuestMemory;
use trapmon_mem::{pd_index, pt_index, GuestPhysAddr};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WalkFlags: u32 {
        /// Set the Accessed bit on every entry visited.
        const SET_A = 1 << 0;
        /// Set the Dirty bit on the leaf entry (fails if the entry isn't writable).
        const SET_D = 1 << 1;
        /// Require `PTE_U` at every level (the walk is on behalf of a CPL-3 access).
        const USER = 1 << 2;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WalkError {
    #[error("page directory entry at index {0} is not present")]
    PdeNotPresent(usize),
    #[error("page table entry at index {0} is not present")]
    PteNotPresent(usize),
    #[error("protection violation at pd index {pd_index}, pt index {pt_index:?}")]
    ProtectionViolation {
        pd_index: usize,
        pt_index: Option<usize>,
    },
}

pub type Result<T> = core::result::Result<T, WalkError>;

/// The outcome of a successful walk: the resolved guest-physical address,
/// and the location of the entries that produced it (so a caller can
/// install a shadow translation derived from the same entries, or trace the
/// guest PTE for writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestWalkOutcome {
    pub phys: GuestPhysAddr,
    pub pde_addr: GuestPhysAddr,
    pub pde: Pte,
    /// `None` when the PDE was a 4 MiB large page: there is no PTE.
    pub pte_addr: Option<GuestPhysAddr>,
    pub pte: Option<Pte>,
}

fn check_protection(flags: PteFlags, walk: WalkFlags) -> bool {
    if walk.contains(WalkFlags::SET_D) && !flags.contains(PteFlags::W) {
        return false;
    }
    if walk.contains(WalkFlags::USER) && !flags.contains(PteFlags::U) {
        return false;
    }
    true
}

/// Walk the guest's page directory at `pd_base` (a guest-physical address,
/// i.e. `CR3`) for `vaddr`, optionally setting Accessed/Dirty bits in guest
/// memory as the walk proceeds, exactly as the hardware MMU would.
pub fn guest_walk(
    mem: &mut dyn GuestMemory,
    pd_base: GuestPhysAddr,
    vaddr: u32,
    flags: WalkFlags,
) -> Result<GuestWalkOutcome> {
    let pdi = pd_index(vaddr);
    let pde_addr = GuestPhysAddr::new(pd_base.as_u32() + (pdi as u32) * 4);
    let mut pde = Pte(mem.read_u32(pde_addr));

    if !pde.is_present() {
        return Err(WalkError::PdeNotPresent(pdi));
    }
    if !check_protection(pde.flags(), flags) {
        return Err(WalkError::ProtectionViolation {
            pd_index: pdi,
            pt_index: None,
        });
    }
    if flags.contains(WalkFlags::SET_A) && !pde.flags().contains(PteFlags::A) {
        pde = pde.with_flags(pde.flags() | PteFlags::A);
        mem.write_u32(pde_addr, pde.0);
    }

    if pde.flags().contains(PteFlags::PS) {
        let phys = pde.addr() + (vaddr & (trapmon_mem::LARGE_PAGE_SIZE as u32 - 1)) as usize;
        return Ok(GuestWalkOutcome {
            phys: GuestPhysAddr::new(phys),
            pde_addr,
            pde,
            pte_addr: None,
            pte: None,
        });
    }

    let pti = pt_index(vaddr);
    let pt_base = pde.addr();
    let pte_addr = GuestPhysAddr::new(pt_base + (pti as u32) * 4);
    let mut pte = Pte(mem.read_u32(pte_addr));

    if !pte.is_present() {
        return Err(WalkError::PteNotPresent(pti));
    }
    if !check_protection(pte.flags(), flags) {
        return Err(WalkError::ProtectionViolation {
            pd_index: pdi,
            pt_index: Some(pti),
        });
    }
    let mut new_flags = pte.flags();
    if flags.contains(WalkFlags::SET_A) {
        new_flags |= PteFlags::A;
    }
    if flags.contains(WalkFlags::SET_D) {
        new_flags |= PteFlags::D;
    }
    if new_flags != pte.flags() {
        pte = pte.with_flags(new_flags);
        mem.write_u32(pte_addr, pte.0);
    }

    let phys = pte.addr() + (vaddr & (trapmon_mem::PAGE_SIZE as u32 - 1)) as usize;
    Ok(GuestWalkOutcome {
        phys: GuestPhysAddr::new(phys),
        pde_addr,
        pde,
        pte_addr: Some(pte_addr),
        pte: Some(pte),
    })
}
