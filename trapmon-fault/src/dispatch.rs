//! Classifying a trapped `#PF`/`#GP` and deciding what the monitor does
//! about it. Mirrors `page_fault`/`gpf_handler`/`passthrough` in the
//! reference monitor's `sys/exception.c`, split so the shadow-maintenance
//! side (installing PDEs/PTEs) stays in [`trapmon_paging`] and this crate
//! owns only the classification and the resulting guest-visible outcome.

use crate::error::{DispatchError, Result};
use crate::passthrough::{dispatch_passthrough, GuestCpuView, PassthroughFrame};
use bitflags::bitflags;
use trapmon_gdt::consts::SEL_KCSEG;
use trapmon_mem::{pd_index, pt_index, GuestMemory, GuestPhysAddr, PagePool};
use trapmon_paging::pte::PTE_ADDR_MASK;
use trapmon_paging::{
    guest_walk, MonitorImageSource, PteFlags, ShadowPageDirectory, TraceTable, WalkError, WalkFlags,
};

bitflags! {
    /// The x86 `#PF` error code, as delivered in the interrupt frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PfErrorCode: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

/// Which page directory `CR3` named at the moment of the fault. Supplied by
/// the caller (the `World`'s [`crate::mode::ModeSwitcher`]) since this
/// module has no memory of mode transitions of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultingPt {
    PhysMap,
    Shadow { user: bool },
}

/// An unimplemented forced-callout vector. The peephole translator this
/// would hand off to (patched guest instructions that trap out to request a
/// specific monitor service) has no counterpart here; every callout is
/// reported rather than silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalloutId(pub u32);

/// What the dispatcher decided to do about a trapped exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fault was attributed to the monitor's own code segment. The
    /// reference monitor panics here; this crate reports it instead and
    /// leaves panicking to the caller, which has logging set up.
    MonitorBug,
    /// `CR3` named `phys_map` itself; the missing page was installed.
    PhysMapFault,
    /// Neither the guest's own tables nor the shadow explain the fault: a
    /// real fault the guest asked for. `resume` is where it continues once
    /// delivered to the guest's own handler.
    TrueFault { cr2: u32, resume: PassthroughFrame },
    /// A write landed on a page being traced; resolved without the guest
    /// ever observing a fault.
    MtracedFault,
    /// The shadow was missing a translation the guest's own tables already
    /// grant; it has now been synthesized.
    ShadowFault,
    /// A `#GP` the monitor's peephole rule table was able to emulate
    /// in-place; the guest never sees it.
    GpfEmulated,
    /// A `#GP` the monitor could not emulate; delivered to the guest.
    GpfPassthrough { resume: PassthroughFrame },
    /// A forced-callout vector fired with no handler registered for it.
    UnimplementedCallout(CalloutId),
}

/// Running tally of page-fault outcomes, printed at shutdown the way
/// `exception_print_stats` does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub phys_map_faults: u64,
    pub true_faults: u64,
    pub mtraced_faults: u64,
    pub shadow_faults: u64,
}

impl FaultCounters {
    pub fn total(&self) -> u64 {
        self.phys_map_faults + self.true_faults + self.mtraced_faults + self.shadow_faults
    }

    fn record(&mut self, outcome: &FaultOutcome) {
        match outcome {
            FaultOutcome::PhysMapFault => self.phys_map_faults += 1,
            FaultOutcome::TrueFault { .. } => self.true_faults += 1,
            FaultOutcome::MtracedFault => self.mtraced_faults += 1,
            FaultOutcome::ShadowFault => self.shadow_faults += 1,
            _ => {}
        }
    }
}

/// Everything the dispatcher needs to know about the faulting context that
/// the `Vcpu`/`World` own and this crate doesn't.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInputs {
    pub fault_addr: u32,
    pub error_code: PfErrorCode,
    pub faulting_pt: FaultingPt,
    /// The guest's own `CR3` (`vcpu.cr[3]`), used to walk its tables —
    /// distinct from whichever host page directory was actually loaded.
    pub guest_pd: GuestPhysAddr,
    pub idt_base: u32,
    pub idt_limit: u16,
    pub cpu: GuestCpuView,
}

fn synthesize_pte_target(guest_walk: &trapmon_paging::GuestWalkOutcome, fault_addr: u32) -> (GuestPhysAddr, PteFlags) {
    match guest_walk.pte {
        Some(pte) => (GuestPhysAddr::new(pte.addr()), pte.flags()),
        None => {
            // The guest PDE was a 4 MiB page; treat it as if it were a fine
            // PTE covering the 4 KiB window the fault landed in (§4.4).
            let page_base = fault_addr & PTE_ADDR_MASK;
            let flags = guest_walk.pde.flags() & !(PteFlags::PS | PteFlags::G);
            (GuestPhysAddr::new(page_base), flags)
        }
    }
}

/// Classify and resolve a trapped `#PF`. Installs shadow translations and
/// phys_map pages as a side effect when that's the right outcome; never
/// mutates the guest's own tables except for the Accessed/Dirty bits the
/// hardware itself would have set.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_page_fault(
    inputs: PageFaultInputs,
    fault_cs: u16,
    mem: &mut dyn GuestMemory,
    shadow: &mut ShadowPageDirectory,
    trace: &mut TraceTable,
    pool: &mut PagePool,
    image: &dyn MonitorImageSource,
    counters: &mut FaultCounters,
) -> Result<FaultOutcome> {
    if fault_cs == SEL_KCSEG {
        return Ok(FaultOutcome::MonitorBug);
    }

    if let FaultingPt::PhysMap = inputs.faulting_pt {
        counters.phys_map_faults += 1;
        return Ok(FaultOutcome::PhysMapFault);
    }

    let guest_user = matches!(inputs.faulting_pt, FaultingPt::Shadow { user: true });
    let write_fault = inputs.error_code.contains(PfErrorCode::PRESENT | PfErrorCode::WRITE);

    let mut walk_flags = WalkFlags::SET_A;
    if write_fault {
        walk_flags |= WalkFlags::SET_D;
    }
    if guest_user {
        walk_flags |= WalkFlags::USER;
    }

    let gw = match guest_walk(mem, inputs.guest_pd, inputs.fault_addr, walk_flags) {
        Err(_) => {
            let resume = dispatch_passthrough(
                mem,
                inputs.idt_base,
                inputs.idt_limit,
                14,
                Some(inputs.error_code.bits()),
                inputs.cpu,
            )?;
            let outcome = FaultOutcome::TrueFault {
                cr2: inputs.fault_addr,
                resume,
            };
            counters.record(&outcome);
            return Ok(outcome);
        }
        Ok(gw) => gw,
    };

    let pdi = pd_index(inputs.fault_addr);
    match shadow.shadow_walk(inputs.fault_addr) {
        Err(WalkError::PdeNotPresent(_)) => {
            shadow.install_pde(pdi, gw.pde.flags(), pool)?;
            let outcome = FaultOutcome::ShadowFault;
            counters.record(&outcome);
            Ok(outcome)
        }
        Err(WalkError::PteNotPresent(_)) => {
            let pti = pt_index(inputs.fault_addr);
            let (guest_phys, guest_pte_flags) = synthesize_pte_target(&gw, inputs.fault_addr);
            shadow.install_pte(pdi, pti, guest_phys, guest_pte_flags, pool, trace, image)?;
            let outcome = FaultOutcome::ShadowFault;
            counters.record(&outcome);
            Ok(outcome)
        }
        Err(WalkError::ProtectionViolation { .. }) => Err(DispatchError::Inconsistent {
            addr: inputs.fault_addr,
        }),
        Ok(sw) => {
            if write_fault && !sw.pte_flags.contains(PteFlags::W) {
                // Resolving the write itself (decoding the faulting
                // instruction and applying it to the guest's page table)
                // needs instruction emulation this crate doesn't have; the
                // caller applies the new entry via
                // `ShadowPageDirectory::overwrite_pte` once it has decoded
                // the write, same as `mtraces_handle_page_fault` does.
                if trace.lookup_by_shadow_pte(sw.pte_addr).is_some() {
                    let outcome = FaultOutcome::MtracedFault;
                    counters.record(&outcome);
                    Ok(outcome)
                } else {
                    Err(DispatchError::Inconsistent {
                        addr: inputs.fault_addr,
                    })
                }
            } else {
                // Guest walk and shadow walk both succeeded and agree on
                // permissions: the hardware shouldn't have faulted at all.
                Err(DispatchError::Inconsistent {
                    addr: inputs.fault_addr,
                })
            }
        }
    }
}

/// One peephole constraint the monitor knows how to satisfy without
/// bouncing the `#GP` to the guest. The translator that would populate this
/// table (recognizing patched instruction sequences by `eip`) has no
/// counterpart in this crate; the table starts empty, so every `#GP` at
/// kernel CPL falls through to passthrough until rules are registered.
pub trait GpfRule {
    fn try_emulate(&self, eip: u32) -> bool;
}

#[derive(Default)]
pub struct GpfRuleTable {
    rules: Vec<Box<dyn GpfRule>>,
}

impl GpfRuleTable {
    pub fn new() -> Self {
        GpfRuleTable::default()
    }

    pub fn register(&mut self, rule: Box<dyn GpfRule>) {
        self.rules.push(rule);
    }

    fn try_emulate(&self, eip: u32) -> bool {
        self.rules.iter().any(|r| r.try_emulate(eip))
    }
}

/// Classify and resolve a trapped `#GP`. `kernel_cpl` mirrors the
/// `read_cpl() != 3` assertion at the top of `gpf_handler`: a `#GP` at
/// user CPL always passes straight through.
pub fn dispatch_gpf(
    kernel_cpl: bool,
    rules: &GpfRuleTable,
    mem: &mut dyn GuestMemory,
    idt_base: u32,
    idt_limit: u16,
    cpu: GuestCpuView,
) -> Result<FaultOutcome> {
    if kernel_cpl && rules.try_emulate(cpu.eip) {
        return Ok(FaultOutcome::GpfEmulated);
    }
    let resume = dispatch_passthrough(mem, idt_base, idt_limit, 13, Some(0), cpu)?;
    Ok(FaultOutcome::GpfPassthrough { resume })
}

/// A forced-callout vector the monitor has no handler for. `sys/exception.c`
/// wires a real callout dispatcher behind this vector (peephole-patched
/// instructions that need a monitor service mid-block); this crate reports
/// the request instead of servicing it.
pub fn dispatch_forced_callout(callout: CalloutId) -> FaultOutcome {
    FaultOutcome::UnimplementedCallout(callout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use trapmon_mem::PagePool;
    use trapmon_mem::PhysicalAddr;
    use trapmon_paging::pte::Pte;

    struct FakeMem(HashMap<u32, u32>);
    impl GuestMemory for FakeMem {
        fn read_u32(&self, addr: GuestPhysAddr) -> u32 {
            *self.0.get(&addr.as_u32()).unwrap_or(&0)
        }
        fn write_u32(&mut self, addr: GuestPhysAddr, value: u32) {
            self.0.insert(addr.as_u32(), value);
        }
    }

    struct ZeroImage;
    impl MonitorImageSource for ZeroImage {
        fn load_page(&self, _offset: u32, buf: &mut [u8]) {
            buf.fill(0);
        }
    }

    fn install_idt_gate(mem: &mut FakeMem, idt_base: u32, vector: u8, selector: u16, offset: u32) {
        let entry_off = idt_base + (vector as u32) * 8;
        let low = (offset & 0xffff) | ((selector as u32) << 16);
        let high = (offset & 0xffff_0000) | (1 << 15) | (0xE << 8);
        mem.write_u32(GuestPhysAddr::new(entry_off), low);
        mem.write_u32(GuestPhysAddr::new(entry_off + 4), high);
    }

    fn cpu() -> GuestCpuView {
        GuestCpuView {
            cs: 0x1b,
            eip: 0x0040_1234,
            eflags: 0x202,
            esp: 0x0050_0000,
        }
    }

    #[test]
    fn monitor_code_segment_is_a_monitor_bug() {
        let mut mem = FakeMem(HashMap::new());
        let mut shadow = ShadowPageDirectory::new();
        let mut trace = TraceTable::new();
        let mut pool = PagePool::new(PhysicalAddr::new(0x0100_0000), 64).unwrap();
        let mut counters = FaultCounters::default();
        let inputs = PageFaultInputs {
            fault_addr: 0x0040_1234,
            error_code: PfErrorCode::empty(),
            faulting_pt: FaultingPt::Shadow { user: false },
            guest_pd: GuestPhysAddr::new(0x1000),
            idt_base: 0x2000,
            idt_limit: 0x07ff,
            cpu: cpu(),
        };
        let outcome = dispatch_page_fault(
            inputs,
            SEL_KCSEG,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert_eq!(outcome, FaultOutcome::MonitorBug);
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn phys_map_fault_is_counted_without_a_guest_walk() {
        let mut mem = FakeMem(HashMap::new());
        let mut shadow = ShadowPageDirectory::new();
        let mut trace = TraceTable::new();
        let mut pool = PagePool::new(PhysicalAddr::new(0x0100_0000), 64).unwrap();
        let mut counters = FaultCounters::default();
        let inputs = PageFaultInputs {
            fault_addr: 0x0000_1234,
            error_code: PfErrorCode::empty(),
            faulting_pt: FaultingPt::PhysMap,
            guest_pd: GuestPhysAddr::new(0x1000),
            idt_base: 0x2000,
            idt_limit: 0x07ff,
            cpu: cpu(),
        };
        let outcome = dispatch_page_fault(
            inputs,
            0x1b,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert_eq!(outcome, FaultOutcome::PhysMapFault);
        assert_eq!(counters.phys_map_faults, 1);
    }

    #[test]
    fn missing_guest_translation_is_a_true_fault_with_a_passthrough_frame() {
        let mut mem = FakeMem(HashMap::new());
        install_idt_gate(&mut mem, 0x2000, 14, 0x08, 0x0010_0000);
        let mut shadow = ShadowPageDirectory::new();
        let mut trace = TraceTable::new();
        let mut pool = PagePool::new(PhysicalAddr::new(0x0100_0000), 64).unwrap();
        let mut counters = FaultCounters::default();
        let inputs = PageFaultInputs {
            fault_addr: 0x0040_1234,
            error_code: PfErrorCode::USER,
            faulting_pt: FaultingPt::Shadow { user: true },
            guest_pd: GuestPhysAddr::new(0x1000), // empty: no PDE installed
            idt_base: 0x2000,
            idt_limit: 0x07ff,
            cpu: cpu(),
        };
        let outcome = dispatch_page_fault(
            inputs,
            0x1b,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert!(matches!(outcome, FaultOutcome::TrueFault { cr2: 0x0040_1234, .. }));
        assert_eq!(counters.true_faults, 1);
    }

    #[test]
    fn known_guest_translation_synthesizes_shadow_pde_then_pte() {
        let mut mem = FakeMem(HashMap::new());
        let pd_base = 0x1000u32;
        let pt_base = 0x2000u32;
        let vaddr = 0x0040_1000u32;
        mem.write_u32(
            GuestPhysAddr::new(pd_base + (pd_index(vaddr) as u32) * 4),
            Pte::new(pt_base, PteFlags::P | PteFlags::W | PteFlags::U).0,
        );
        mem.write_u32(
            GuestPhysAddr::new(pt_base + (pt_index(vaddr) as u32) * 4),
            Pte::new(0x0060_0000, PteFlags::P | PteFlags::W | PteFlags::U).0,
        );
        let mut shadow = ShadowPageDirectory::new();
        let mut trace = TraceTable::new();
        let mut pool = PagePool::new(PhysicalAddr::new(0x0100_0000), 64).unwrap();
        let mut counters = FaultCounters::default();
        let idt_base = 0x3000;

        let inputs = PageFaultInputs {
            fault_addr: vaddr,
            error_code: PfErrorCode::USER,
            faulting_pt: FaultingPt::Shadow { user: true },
            guest_pd: GuestPhysAddr::new(pd_base),
            idt_base,
            idt_limit: 0x07ff,
            cpu: cpu(),
        };
        let outcome1 = dispatch_page_fault(
            inputs,
            0x1b,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert_eq!(outcome1, FaultOutcome::ShadowFault);
        assert!(shadow.pde(pd_index(vaddr)).is_present());

        let outcome2 = dispatch_page_fault(
            inputs,
            0x1b,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert_eq!(outcome2, FaultOutcome::ShadowFault);
        assert_eq!(counters.shadow_faults, 2);

        let resolved = shadow.shadow_walk(vaddr).unwrap();
        assert_eq!(resolved.phys.as_u32(), 0x0060_0000);
    }

    #[test]
    fn traced_write_is_reported_as_mtraced_not_inconsistent() {
        let mut mem = FakeMem(HashMap::new());
        let pd_base = 0x1000u32;
        let pt_base = 0x2000u32;
        let vaddr = 0x0050_0000u32;
        mem.write_u32(
            GuestPhysAddr::new(pd_base + (pd_index(vaddr) as u32) * 4),
            Pte::new(pt_base, PteFlags::P | PteFlags::W | PteFlags::U).0,
        );
        mem.write_u32(
            GuestPhysAddr::new(pt_base + (pt_index(vaddr) as u32) * 4),
            Pte::new(vaddr, PteFlags::P | PteFlags::W | PteFlags::U).0,
        );
        let mut shadow = ShadowPageDirectory::new();
        let mut trace = TraceTable::new();
        trace.arm(GuestPhysAddr::new(vaddr), GuestPhysAddr::new(pt_base + (pt_index(vaddr) as u32) * 4));
        let mut pool = PagePool::new(PhysicalAddr::new(0x0100_0000), 64).unwrap();
        let mut counters = FaultCounters::default();
        let pdi = pd_index(vaddr);
        let pti = pt_index(vaddr);
        shadow.install_pde(pdi, PteFlags::P | PteFlags::W | PteFlags::U, &mut pool).unwrap();
        shadow
            .install_pte(
                pdi,
                pti,
                GuestPhysAddr::new(vaddr),
                PteFlags::P | PteFlags::W | PteFlags::U,
                &mut pool,
                &mut trace,
                &ZeroImage,
            )
            .unwrap();

        let inputs = PageFaultInputs {
            fault_addr: vaddr,
            error_code: PfErrorCode::PRESENT | PfErrorCode::WRITE | PfErrorCode::USER,
            faulting_pt: FaultingPt::Shadow { user: true },
            guest_pd: GuestPhysAddr::new(pd_base),
            idt_base: 0x3000,
            idt_limit: 0x07ff,
            cpu: cpu(),
        };
        let outcome = dispatch_page_fault(
            inputs,
            0x1b,
            &mut mem,
            &mut shadow,
            &mut trace,
            &mut pool,
            &ZeroImage,
            &mut counters,
        )
        .unwrap();
        assert_eq!(outcome, FaultOutcome::MtracedFault);
        assert_eq!(counters.mtraced_faults, 1);
    }

    #[test]
    fn gpf_at_user_cpl_always_passes_through() {
        let mut mem = FakeMem(HashMap::new());
        install_idt_gate(&mut mem, 0x2000, 13, 0x08, 0x0010_0500);
        let rules = GpfRuleTable::new();
        let outcome = dispatch_gpf(false, &rules, &mut mem, 0x2000, 0x07ff, cpu()).unwrap();
        assert!(matches!(outcome, FaultOutcome::GpfPassthrough { .. }));
    }

    #[test]
    fn gpf_at_kernel_cpl_with_no_matching_rule_passes_through() {
        let mut mem = FakeMem(HashMap::new());
        install_idt_gate(&mut mem, 0x2000, 13, 0x08, 0x0010_0500);
        let rules = GpfRuleTable::new();
        let outcome = dispatch_gpf(true, &rules, &mut mem, 0x2000, 0x07ff, cpu()).unwrap();
        assert!(matches!(outcome, FaultOutcome::GpfPassthrough { .. }));
    }

    #[test]
    fn forced_callout_is_reported_unimplemented() {
        let outcome = dispatch_forced_callout(CalloutId(7));
        assert_eq!(outcome, FaultOutcome::UnimplementedCallout(CalloutId(7)));
    }
}
