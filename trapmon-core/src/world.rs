//! The monitor's top-level state: one guest address space's worth of page
//! pool, identity map, shadow page directories, GDT, fault dispatcher and
//! I/O ring, wired together and driven one trapped event at a time.
//!
//! Construction order follows the reference monitor's own `monitor_init`:
//! page pool, then the physical-identity map (which allocates out of the
//! pool for its own monitor-window page tables), then the GDT/mode pair,
//! then the two per-CPL shadow directories, then memory tracing, then the
//! fault-dispatch tables, then the I/O ring, and finally record/replay.
//! Nothing later in that list is ever touched while constructing something
//! earlier.

use std::io::{BufRead, Write};

use trapmon_arch::Arch;
use trapmon_fault::dispatch::{
    dispatch_forced_callout, dispatch_gpf, dispatch_page_fault, CalloutId, FaultCounters, FaultOutcome, FaultingPt,
    GpfRuleTable, PageFaultInputs, PfErrorCode,
};
use trapmon_fault::mode::{Cpl, ModeSwitcher, PtAddrs, PtTarget};
use trapmon_fault::passthrough::{GuestCpuView, PassthroughFrame};
use trapmon_gdt::consts::SEG_CS;
use trapmon_gdt::desc::{get_seg_base, get_seg_flags, get_seg_limit};
use trapmon_gdt::{CplObserver, Gdt};
use trapmon_io::{IoJournal, IoWidth, PortRing, RrMode};
use trapmon_mem::{GuestPhysAddr, PagePool};
use trapmon_paging::{MonitorImageSource, PhysMap, ShadowPageDirectory, TraceTable};
use trapmon_replay::{RecordEngine, ReplayEngine};

use crate::error::{MonitorOutcome, Result};
use crate::memory::HostRam;
use crate::vcpu::{ActiveShadow, Vcpu};

/// Records the new CPL [`Gdt::load_seg_cache`] latches on a CS reload,
/// without requiring the caller to lend it a mutable borrow of itself (the
/// natural implementor, [`World`], already has the `Gdt` borrowed mutably
/// for the call).
#[derive(Default)]
struct CplLatch {
    new_cpl: Option<u8>,
}

impl CplObserver for CplLatch {
    fn on_cpl_changed(&mut self, cpl: u8) {
        self.new_cpl = Some(cpl);
    }
}

/// Which log, if any, this session is paired with.
pub enum RecordReplay {
    Record(RecordEngine<Box<dyn Write>>),
    Replay(ReplayEngine<Box<dyn BufRead>>),
    Off,
}

impl RecordReplay {
    fn rr_mode(&self) -> RrMode {
        match self {
            RecordReplay::Record(_) => RrMode::Record,
            RecordReplay::Replay(_) => RrMode::Replay,
            RecordReplay::Off => RrMode::Off,
        }
    }
}

/// An [`IoJournal`] that must never actually be called. [`PortRing`] only
/// invokes its journal argument when its own mode is `Record` or `Replay`;
/// this is the witness passed in when [`RecordReplay::Off`] guarantees it
/// can't be.
struct NullJournal;

impl IoJournal for NullJournal {
    fn record_in(&mut self, _n_exec: u64, _port: u16, _width: IoWidth, _value: u32) {
        unreachable!("PortRing in Off mode never records")
    }
    fn record_out(&mut self, _n_exec: u64, _port: u16, _width: IoWidth, _value: u32) {
        unreachable!("PortRing in Off mode never records")
    }
    fn replay_in(&mut self, _n_exec: u64, _port: u16, _width: IoWidth) -> u32 {
        unreachable!("PortRing in Off mode never replays")
    }
    fn replay_out(&mut self, _n_exec: u64, _port: u16, _width: IoWidth) {
        unreachable!("PortRing in Off mode never replays")
    }
}

/// One guest session: every subsystem wired together plus the VCPU they
/// serve. Generic over [`Arch`] so tests can run it against
/// [`trapmon_arch::fake::FakeArch`] without touching real hardware.
pub struct World<A: Arch> {
    pub pool: PagePool,
    pub phys_map: PhysMap,
    pub gdt: Gdt,
    pub mode: ModeSwitcher,
    pub pt_addrs: PtAddrs,
    pub shadow_sup: ShadowPageDirectory,
    pub shadow_user: ShadowPageDirectory,
    pub trace: TraceTable,
    pub fault_counters: FaultCounters,
    pub gpf_rules: GpfRuleTable,
    pub io: PortRing,
    pub ram: HostRam,
    pub vcpu: Vcpu,
    pub arch: A,
    pub rr: RecordReplay,
    image: Box<dyn MonitorImageSource>,
}

impl<A: Arch> World<A> {
    /// `pt_addrs` names the host-physical addresses of `phys_map` and the
    /// two shadow directories' page directories; this crate has no real
    /// physical allocator bridging its `Vec<Pte>`/`[Pte; 1024]` structures
    /// to host-physical memory, so a boot/loader layer outside this crate's
    /// scope is expected to place them and report back where.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PagePool,
        ram_pages: usize,
        monitor_tss_laddr: u32,
        pt_addrs: PtAddrs,
        image: Box<dyn MonitorImageSource>,
        arch: A,
        rr: RecordReplay,
    ) -> Self {
        let phys_map = PhysMap::new(ram_pages);
        let gdt = Gdt::new(monitor_tss_laddr);
        let mode = ModeSwitcher::new();
        let shadow_sup = ShadowPageDirectory::new();
        let shadow_user = ShadowPageDirectory::new();
        let trace = TraceTable::new();
        let fault_counters = FaultCounters::default();
        let gpf_rules = GpfRuleTable::new();
        let io = PortRing::new(rr.rr_mode());
        let ram = HostRam::new(ram_pages);
        let vcpu = Vcpu::new();

        log::info!("world: {ram_pages} page(s) of RAM, mode={:?}", rr.rr_mode());

        World {
            pool,
            phys_map,
            gdt,
            mode,
            pt_addrs,
            shadow_sup,
            shadow_user,
            trace,
            fault_counters,
            gpf_rules,
            io,
            ram,
            vcpu,
            arch,
            rr,
            image,
        }
    }

    fn active_shadow_mut(&mut self, user: bool) -> &mut ShadowPageDirectory {
        if user {
            &mut self.shadow_user
        } else {
            &mut self.shadow_sup
        }
    }

    fn guest_cpu_view(&self) -> GuestCpuView {
        GuestCpuView {
            cs: self.gdt.orig_selector(SEG_CS),
            eip: self.vcpu.eip,
            eflags: self.vcpu.eflags,
            esp: self.vcpu.regs[4], // ESP, matching the x86 general-register ordering (EAX..EDI)
        }
    }

    /// Apply a constructed resume frame to the VCPU: load the new `EIP`,
    /// `ESP`, and resolve the new `CS` selector's descriptor out of the
    /// guest's own GDT so the segment cache reflects it, exactly as a real
    /// `iret`-into-handler would.
    fn apply_passthrough_frame(&mut self, frame: PassthroughFrame) -> Result<()> {
        self.vcpu.eip = frame.new_eip;
        self.vcpu.regs[4] = frame.new_esp;
        let desc = self.gdt.read_segment(&mut self.ram, frame.new_cs, false, true)?;
        let mut latch = CplLatch::default();
        self.gdt.load_seg_cache(
            SEG_CS,
            frame.new_cs,
            get_seg_base(desc),
            get_seg_limit(desc),
            get_seg_flags(desc),
            &mut latch,
        );
        self.follow_cpl_latch(latch);
        Ok(())
    }

    fn follow_cpl_latch(&mut self, latch: CplLatch) {
        if let Some(cpl) = latch.new_cpl {
            let user = cpl == 3;
            self.vcpu.active_shadow = if user { ActiveShadow::User } else { ActiveShadow::Supervisor };
            self.mode.switch_to_shadow(&self.arch, user, &self.pt_addrs);
        }
    }

    /// Load a segment register the guest just reloaded: cache it in the
    /// GDT's descriptor cache and, if it was `CS`, follow the CPL change
    /// into the matching shadow page directory.
    pub fn load_segment(&mut self, segno: usize, selector: u16, base: u32, limit: u32, flags: trapmon_gdt::desc::SegFlags) {
        let mut latch = CplLatch::default();
        self.gdt.load_seg_cache(segno, selector, base, limit, flags, &mut latch);
        self.follow_cpl_latch(latch);
    }

    fn faulting_pt(&self) -> FaultingPt {
        match self.mode.pt_target() {
            Some(PtTarget::Phys) | None => FaultingPt::PhysMap,
            Some(PtTarget::Shadow(user)) => FaultingPt::Shadow { user },
        }
    }

    /// Handle a trapped `#PF`. `fault_cs` is the host code selector active
    /// at the moment of the trap, used to recognize a fault inside the
    /// monitor's own code (always a bug, never guest-recoverable).
    pub fn handle_page_fault(&mut self, fault_addr: u32, error_code: PfErrorCode, fault_cs: u16) -> Result<MonitorOutcome> {
        let faulting_pt = self.faulting_pt();
        let user = matches!(faulting_pt, FaultingPt::Shadow { user: true });
        let inputs = PageFaultInputs {
            fault_addr,
            error_code,
            faulting_pt,
            guest_pd: GuestPhysAddr::new(self.vcpu.cr[3]),
            idt_base: self.vcpu.idt.base,
            idt_limit: self.vcpu.idt.limit as u16,
            cpu: self.guest_cpu_view(),
        };

        let outcome = {
            // A phys_map fault resolves before any shadow directory is
            // consulted; `user` defaults to false in that branch, so this
            // just passes the supervisor directory without it being used.
            let shadow = self.active_shadow_mut(user);
            dispatch_page_fault(
                inputs,
                fault_cs,
                &mut self.ram,
                shadow,
                &mut self.trace,
                &mut self.pool,
                self.image.as_ref(),
                &mut self.fault_counters,
            )?
        };

        match outcome {
            FaultOutcome::MonitorBug => {
                log::error!("world: #PF at {fault_addr:#010x} attributed to the monitor's own code segment");
                Ok(MonitorOutcome::Abort("page fault attributed to the monitor's own code segment"))
            }
            FaultOutcome::PhysMapFault => {
                self.phys_map.install_page(fault_addr, &mut self.pool, self.image.as_ref())?;
                Ok(MonitorOutcome::Recovered)
            }
            FaultOutcome::ShadowFault | FaultOutcome::MtracedFault => Ok(MonitorOutcome::Recovered),
            FaultOutcome::TrueFault { resume, .. } => {
                self.apply_passthrough_frame(resume)?;
                Ok(MonitorOutcome::GuestFault)
            }
            other => Ok(MonitorOutcome::Abort(outcome_mismatch_reason(&other))),
        }
    }

    /// Handle a trapped `#GP`.
    pub fn handle_gpf(&mut self) -> Result<MonitorOutcome> {
        let kernel_cpl = self.mode.cpl() == Cpl::Kernel;
        let cpu = self.guest_cpu_view();
        let outcome = dispatch_gpf(
            kernel_cpl,
            &self.gpf_rules,
            &mut self.ram,
            self.vcpu.idt.base,
            self.vcpu.idt.limit as u16,
            cpu,
        )?;
        match outcome {
            FaultOutcome::GpfEmulated => Ok(MonitorOutcome::Recovered),
            FaultOutcome::GpfPassthrough { resume } => {
                self.apply_passthrough_frame(resume)?;
                Ok(MonitorOutcome::GuestFault)
            }
            other => Ok(MonitorOutcome::Abort(outcome_mismatch_reason(&other))),
        }
    }

    /// Handle a forced-callout trap. The peephole translator that would
    /// normally service one has no counterpart here, so every callout is
    /// fatal.
    pub fn handle_forced_callout(&mut self, vector: u32) -> MonitorOutcome {
        match dispatch_forced_callout(CalloutId(vector)) {
            FaultOutcome::UnimplementedCallout(_) => MonitorOutcome::Abort("unimplemented forced callout"),
            other => MonitorOutcome::Abort(outcome_mismatch_reason(&other)),
        }
    }

    /// Consume every record/replay event due at or before the VCPU's
    /// current `n_exec`. Returns the events in timeline order so the
    /// caller (typically `trapmon-cli`'s `run` loop) can apply each one
    /// (deliver an `INTR`, compare a machine-state snapshot, or stop on
    /// `PANC`/`EXIT`) before asking for the next.
    /// Snapshot every field a record-log `MS` entry carries. Used for the
    /// session-opening checkpoint and for comparing against a replayed one.
    pub fn snapshot(&self) -> trapmon_replay::MachineState {
        let mut segs = [trapmon_replay::SegSnapshot::default(); trapmon_gdt::consts::NUM_SEGS];
        for (segno, slot) in segs.iter_mut().enumerate() {
            let sc = self.gdt.seg(segno);
            *slot = trapmon_replay::SegSnapshot {
                orig_selector: self.gdt.orig_selector(segno),
                base: sc.base,
                limit: sc.limit,
                flags: sc.flags.bits(),
            };
        }
        trapmon_replay::MachineState {
            regs: self.vcpu.regs,
            eip: self.vcpu.eip,
            eflags: self.vcpu.eflags,
            ldt: self.vcpu.ldt,
            tr: self.vcpu.tr,
            gdt: self.vcpu.gdt,
            idt: self.vcpu.idt,
            cr: self.vcpu.cr,
            interrupts_enabled: self.vcpu.eflags & 0x200 != 0,
            iopl: ((self.vcpu.eflags >> 12) & 0x3) as u16,
            ac: self.vcpu.eflags & 0x4_0000 != 0,
            a20_mask: self.vcpu.a20_mask,
            segs,
            fxstate: Box::new([0u8; trapmon_replay::state::FXSTATE_SIZE]),
        }
    }

    pub fn pump_replay(&mut self) -> Result<Option<trapmon_replay::ReplayEvent>> {
        match &mut self.rr {
            RecordReplay::Replay(engine) => Ok(engine.pump(self.vcpu.n_exec, self.ram.as_slice())?),
            _ => Ok(None),
        }
    }

    pub fn port_in(&mut self, port: u16, width: IoWidth) -> u32 {
        let n_exec = self.vcpu.n_exec;
        let mut null = NullJournal;
        let journal = journal_from(&mut self.rr, &mut null);
        match width {
            IoWidth::Byte => self.io.rr_inb(n_exec, port, journal) as u32,
            IoWidth::Word => self.io.rr_inw(n_exec, port, journal) as u32,
            IoWidth::Dword => self.io.rr_inl(n_exec, port, journal),
        }
    }

    pub fn port_out(&mut self, port: u16, width: IoWidth, value: u32) {
        let n_exec = self.vcpu.n_exec;
        let mut null = NullJournal;
        let journal = journal_from(&mut self.rr, &mut null);
        match width {
            IoWidth::Byte => self.io.rr_outb(n_exec, port, value as u8, journal),
            IoWidth::Word => self.io.rr_outw(n_exec, port, value as u16, journal),
            IoWidth::Dword => self.io.rr_outl(n_exec, port, value, journal),
        }
        self.maybe_enable_a20(port, value);
    }

    /// Ports `0x60` (keyboard controller command byte) and `0x92` (system
    /// control port) both drive the A20 gate in the reference monitor, which
    /// registers the same `ioport_enable_a20` callback on both pending a real
    /// keyboard-controller emulation (`mem/paging.c`). Neither port is routed
    /// through `PortRing`'s device table: this is monitor-internal state, not
    /// a device, so it is applied directly here rather than through a
    /// registered handler with a `Box<dyn Any>` cookie.
    fn maybe_enable_a20(&mut self, port: u16, value: u32) {
        if matches!(port, 0x60 | 0x92) && value & 0b10 != 0 && !self.vcpu.a20_enabled() {
            log::debug!("world: a20 gate enabled via port {port:#06x}");
            self.vcpu.set_a20(true);
        }
    }

    /// Read a guest-physical dword through the A20 gate, as a real-mode
    /// guest's own memory accesses would see it: bit 20 is aliased away
    /// whenever the gate is disabled, independent of paging or phys_map.
    pub fn read_phys_u32(&self, addr: u32) -> u32 {
        use trapmon_mem::GuestMemory;
        GuestMemory::read_u32(&self.ram, GuestPhysAddr::new(self.vcpu.mask_a20(addr)))
    }

    /// Write a guest-physical dword through the A20 gate. See
    /// [`Self::read_phys_u32`].
    pub fn write_phys_u32(&mut self, addr: u32, value: u32) {
        use trapmon_mem::GuestMemory;
        GuestMemory::write_u32(&mut self.ram, GuestPhysAddr::new(self.vcpu.mask_a20(addr)), value);
    }
}

/// Borrow whichever journal `rr` names, falling back to `null` when no log
/// is attached. A free function taking `&mut self.rr` directly (rather than
/// a method on `World`) so the borrow stays disjoint from `self.io` at the
/// call site.
fn journal_from<'a>(rr: &'a mut RecordReplay, null: &'a mut NullJournal) -> &'a mut dyn IoJournal {
    match rr {
        RecordReplay::Record(engine) => engine.log_mut(),
        RecordReplay::Replay(engine) => engine.log_mut(),
        RecordReplay::Off => null,
    }
}

fn outcome_mismatch_reason(outcome: &FaultOutcome) -> &'static str {
    match outcome {
        FaultOutcome::MonitorBug => "page fault attributed to the monitor's own code segment",
        FaultOutcome::PhysMapFault => "phys_map fault reached a #GP handler",
        FaultOutcome::TrueFault { .. } => "true fault reached a #GP handler",
        FaultOutcome::MtracedFault => "mtraced fault reached a #GP handler",
        FaultOutcome::ShadowFault => "shadow fault reached a #GP handler",
        FaultOutcome::GpfEmulated => "GP emulation reached a #PF handler",
        FaultOutcome::GpfPassthrough { .. } => "GP passthrough reached a #PF handler",
        FaultOutcome::UnimplementedCallout(_) => "unimplemented callout reached a #PF/#GP handler",
    }
}
