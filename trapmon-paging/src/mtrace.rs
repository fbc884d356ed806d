//! Memory tracing: write-protect selected guest-physical pages in their
//! shadow PTE so that a guest write to them is interposed rather than
//! silently shadowed through.
//!
//! The trace table is keyed by the *shadow* PTE's synthesized host-physical
//! address rather than by guest-physical address, per the design note in
//! §9 of the spec this crate implements: that address is stable across a
//! `ShadowPageDirectory::resync`, so a tracer set up once on a guest's own
//! page-table pages survives a `CR3` reload without being explicitly
//! re-armed. [`TraceTable::is_traced`] is consulted by guest-physical
//! address at shadow-install time (see [`crate::shadow`]) so a page picks up
//! tracing the first time its shadow PTE is synthesized after the tracer was
//! registered, even if that happens after a full shadow-PD rebuild.

use std::collections::HashMap;
use trapmon_mem::{GuestPhysAddr, PhysicalAddr};

/// One armed tracer: which guest-physical page it watches, and the guest
/// address of the PTE that maps it (so the handler can write the guest's
/// page tables back after deriving the new shadow translation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    pub guest_phys: GuestPhysAddr,
    pub pte_guest_addr: GuestPhysAddr,
}

/// Arena of armed tracers, indexed two ways: by the guest-physical page being
/// watched (consulted when a fresh shadow PTE is synthesized) and by the
/// shadow PTE's host-physical address (consulted when a write faults on an
/// existing read-only shadow PTE). Both maps point at the same arena slot,
/// matching the "shadow-PTE ↔ trace-entry back-reference, represented as an
/// arena keyed by shadow-PTE host-physical address" design note.
#[derive(Default)]
pub struct TraceTable {
    entries: Vec<TraceEntry>,
    by_guest_phys: HashMap<u32, usize>,
    by_shadow_pte_addr: HashMap<u32, usize>,
}

impl TraceTable {
    pub fn new() -> Self {
        TraceTable::default()
    }

    /// Arm tracing for `guest_phys`; `pte_guest_addr` is the guest-physical
    /// address of the PTE that currently maps it (used to write the guest's
    /// page table back on a traced write). Idempotent.
    pub fn arm(&mut self, guest_phys: GuestPhysAddr, pte_guest_addr: GuestPhysAddr) {
        if self.by_guest_phys.contains_key(&guest_phys.as_u32()) {
            return;
        }
        let idx = self.entries.len();
        self.entries.push(TraceEntry {
            guest_phys,
            pte_guest_addr,
        });
        self.by_guest_phys.insert(guest_phys.as_u32(), idx);
    }

    pub fn is_traced(&self, guest_phys: GuestPhysAddr) -> bool {
        self.by_guest_phys.contains_key(&guest_phys.as_u32())
    }

    /// Bind the shadow PTE at `shadow_pte_addr` (backing `guest_phys`,
    /// already armed via [`Self::arm`]) to its trace entry, so a future
    /// write fault on that exact shadow PTE can be resolved in O(1).
    pub fn bind_shadow_pte(&mut self, guest_phys: GuestPhysAddr, shadow_pte_addr: PhysicalAddr) {
        if let Some(&idx) = self.by_guest_phys.get(&guest_phys.as_u32()) {
            self.by_shadow_pte_addr.insert(shadow_pte_addr.as_u32(), idx);
        }
    }

    pub fn lookup_by_shadow_pte(&self, shadow_pte_addr: PhysicalAddr) -> Option<TraceEntry> {
        self.by_shadow_pte_addr
            .get(&shadow_pte_addr.as_u32())
            .map(|&idx| self.entries[idx])
    }

    pub fn disarm(&mut self, guest_phys: GuestPhysAddr) {
        if let Some(idx) = self.by_guest_phys.remove(&guest_phys.as_u32()) {
            self.by_shadow_pte_addr.retain(|_, v| *v != idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armed_page_is_traced_until_disarmed() {
        let mut t = TraceTable::new();
        let gp = GuestPhysAddr::new(0x2000);
        assert!(!t.is_traced(gp));
        t.arm(gp, GuestPhysAddr::new(0x1000));
        assert!(t.is_traced(gp));
        t.disarm(gp);
        assert!(!t.is_traced(gp));
    }

    #[test]
    fn shadow_pte_binding_survives_independent_of_arm_order() {
        let mut t = TraceTable::new();
        let gp = GuestPhysAddr::new(0x3000);
        t.arm(gp, GuestPhysAddr::new(0x1004));
        t.bind_shadow_pte(gp, PhysicalAddr::new(0x0090_1000));
        let entry = t.lookup_by_shadow_pte(PhysicalAddr::new(0x0090_1000)).unwrap();
        assert_eq!(entry.guest_phys, gp);
        assert_eq!(entry.pte_guest_addr, GuestPhysAddr::new(0x1004));
    }

    #[test]
    fn rearming_the_same_page_is_idempotent() {
        let mut t = TraceTable::new();
        let gp = GuestPhysAddr::new(0x4000);
        t.arm(gp, GuestPhysAddr::new(0x1008));
        t.arm(gp, GuestPhysAddr::new(0x1008));
        assert_eq!(t.entries.len(), 1);
    }
}
