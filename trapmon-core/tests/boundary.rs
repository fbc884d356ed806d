//! Literal boundary scenarios against a live `World`, one per reproducible
//! case the specification calls out: A20 aliasing and its port-driven
//! enable, a shadow page-table fault-and-resolve round trip, a traced-PTE
//! write resolving without a guest-visible fault, and the record/replay
//! timeline delivering an `INTR`/`IN` entry at an exact `n_exec`.

use std::io::{BufRead, Cursor};

use trapmon_arch::fake::FakeArch;
use trapmon_core::{RecordReplay, World};
use trapmon_fault::dispatch::PfErrorCode;
use trapmon_fault::mode::PtAddrs;
use trapmon_io::IoWidth;
use trapmon_mem::{AllocFlags, GuestMemory, GuestPhysAddr, PagePool, PhysicalAddr, SubPool};
use trapmon_paging::{pte::Pte, MonitorImageSource, PteFlags};
use trapmon_replay::{RecordLog, ReplayEngine, ReplayEvent, ReplayLog};

struct ZeroImage;
impl MonitorImageSource for ZeroImage {
    fn load_page(&self, _offset: u32, buf: &mut [u8]) {
        buf.fill(0);
    }
}

fn test_world(rr: RecordReplay) -> World<FakeArch> {
    let mut pool = PagePool::new(PhysicalAddr::new(0x0200_0000), 4096).unwrap();
    let phys_map_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
    let shadow_sup_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
    let shadow_user_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
    let pt_addrs = PtAddrs {
        phys_map: phys_map_pt.as_u32(),
        shadow_sup: Some(shadow_sup_pt.as_u32()),
        shadow_user: Some(shadow_user_pt.as_u32()),
    };
    World::new(
        pool,
        4096, // 16 MiB of guest RAM
        0xffc0_1000,
        pt_addrs,
        Box::new(ZeroImage),
        FakeArch::new(),
        rr,
    )
}

/// Scenario 1: with the A20 gate disabled, physical `0x100000` aliases to
/// `0x000000`; enabling the gate (scenario 3's effect) makes them distinct.
#[test]
fn a20_disabled_aliases_the_first_megabyte_boundary() {
    let mut world = test_world(RecordReplay::Off);
    GuestMemory::write_u32(&mut world.ram, GuestPhysAddr::new(0x0000_0000), 0xAAAA_AAAA);
    GuestMemory::write_u32(&mut world.ram, GuestPhysAddr::new(0x0010_0000), 0xBBBB_BBBB);

    assert!(!world.vcpu.a20_enabled());
    assert_eq!(world.read_phys_u32(0x0010_0000), 0xAAAA_AAAA);

    world.vcpu.set_a20(true);
    assert_eq!(world.read_phys_u32(0x0010_0000), 0xBBBB_BBBB);
}

/// Scenario 3: `out 0x92, 0x02` flips the A20 mask from disabled to enabled.
#[test]
fn port_0x92_write_enables_a20() {
    let mut world = test_world(RecordReplay::Off);
    assert!(!world.vcpu.a20_enabled());
    world.port_out(0x92, IoWidth::Byte, 0x02);
    assert!(world.vcpu.a20_enabled());
    assert_eq!(world.vcpu.a20_mask, 0xffff_ffff);
}

/// A write with bit 1 clear must not touch the gate (only bit 1 carries the
/// A20 request per `ioport_enable_a20`'s `data & 2` check).
#[test]
fn port_0x92_write_without_bit1_leaves_a20_alone() {
    let mut world = test_world(RecordReplay::Off);
    world.port_out(0x92, IoWidth::Byte, 0x01);
    assert!(!world.vcpu.a20_enabled());
}

/// Scenario 2: a guest fault at `v = 0x00401000` whose guest PDE/PTE are both
/// present, writable, user-accessible resolves via one shadow-fault step;
/// the installed shadow translates to the same host-physical page a direct
/// `phys_map` read would see.
#[test]
fn shadow_fault_installs_a_translation_matching_the_guest_pte() {
    let mut world = test_world(RecordReplay::Off);
    let pd_base = 0x0000_1000u32;
    let pt_base = 0x0000_2000u32;
    let vaddr = 0x0040_1000u32;
    // Must fall outside [MON_BASE, MON_END) (0x0040_0000..0x00C0_0000):
    // inside that window the shadow PTE is redirected to a swap page
    // mirroring the monitor image instead of `guest_phys` itself.
    let guest_phys = 0x0010_0000u32;

    GuestMemory::write_u32(
        &mut world.ram,
        GuestPhysAddr::new(pd_base + (trapmon_mem::pd_index(vaddr) as u32) * 4),
        Pte::new(pt_base, PteFlags::P | PteFlags::W | PteFlags::U).0,
    );
    GuestMemory::write_u32(
        &mut world.ram,
        GuestPhysAddr::new(pt_base + (trapmon_mem::pt_index(vaddr) as u32) * 4),
        Pte::new(guest_phys, PteFlags::P | PteFlags::W | PteFlags::U).0,
    );
    world.vcpu.cr[3] = pd_base;
    world.mode.switch_to_shadow(&world.arch, true, &world.pt_addrs);

    let outcome = world
        .handle_page_fault(vaddr, PfErrorCode::USER, 0x1b)
        .unwrap();
    assert_eq!(outcome, trapmon_core::MonitorOutcome::Recovered);

    let outcome2 = world
        .handle_page_fault(vaddr, PfErrorCode::USER, 0x1b)
        .unwrap();
    assert_eq!(outcome2, trapmon_core::MonitorOutcome::Recovered);

    let resolved = world.shadow_user.shadow_walk(vaddr).unwrap();
    assert_eq!(resolved.phys.as_u32(), guest_phys);
}

/// Scenario 6: a write to a traced guest PTE resolves in a single fault and
/// the guest never observes it. The page being traced here is the guest's
/// own page-table page mapping it, matching how the monitor watches its own
/// shadowed page tables for guest self-modification.
#[test]
fn traced_pte_write_resolves_without_a_guest_visible_fault() {
    let mut world = test_world(RecordReplay::Off);
    let pd_base = 0x0000_1000u32;
    let pt_base = 0x0000_2000u32;
    let vaddr = pt_base; // the PT page is mapped into its own address space

    GuestMemory::write_u32(
        &mut world.ram,
        GuestPhysAddr::new(pd_base + (trapmon_mem::pd_index(vaddr) as u32) * 4),
        Pte::new(pt_base, PteFlags::P | PteFlags::W | PteFlags::U).0,
    );
    GuestMemory::write_u32(
        &mut world.ram,
        GuestPhysAddr::new(pt_base + (trapmon_mem::pt_index(vaddr) as u32) * 4),
        Pte::new(pt_base, PteFlags::P | PteFlags::W | PteFlags::U).0,
    );
    world.vcpu.cr[3] = pd_base;
    world.mode.switch_to_shadow(&world.arch, true, &world.pt_addrs);

    // Arm tracing before the shadow ever sees this page, as the monitor
    // would when it starts watching a freshly-promoted page-table page.
    let pte_addr = pt_base + (trapmon_mem::pt_index(vaddr) as u32) * 4;
    world.trace.arm(GuestPhysAddr::new(pt_base), GuestPhysAddr::new(pte_addr));

    // First fault installs the shadow PDE.
    let outcome = world
        .handle_page_fault(vaddr, PfErrorCode::USER, 0x1b)
        .unwrap();
    assert_eq!(outcome, trapmon_core::MonitorOutcome::Recovered);

    // Second fault installs the shadow PTE; since the target is traced it
    // comes in read-only and bound into the trace table.
    let outcome2 = world
        .handle_page_fault(vaddr, PfErrorCode::USER, 0x1b)
        .unwrap();
    assert_eq!(outcome2, trapmon_core::MonitorOutcome::Recovered);

    // A write now faults on the read-only shadow PTE; the dispatcher
    // recognizes it as the bound trace entry rather than a real violation.
    let write_outcome = world
        .handle_page_fault(vaddr, PfErrorCode::PRESENT | PfErrorCode::WRITE | PfErrorCode::USER, 0x1b)
        .unwrap();
    assert_eq!(write_outcome, trapmon_core::MonitorOutcome::Recovered);
}

/// Scenario 4: an `INTR` record at `n_exec == 0x1000` is delivered exactly
/// when the VCPU's own counter reaches that value, not before.
#[test]
fn intr_replay_fires_at_its_recorded_n_exec() {
    let mut buf = Vec::new();
    {
        let mut rec = RecordLog::new(&mut buf);
        rec.write_intr(0x1000, 0x0040_1234, 0x21).unwrap();
    }
    let reader: Box<dyn BufRead> = Box::new(Cursor::new(buf));
    let mut world = test_world(RecordReplay::Replay(ReplayEngine::new(ReplayLog::new(reader))));

    world.vcpu.n_exec = 0x0fff;
    assert!(world.pump_replay().unwrap().is_none());

    world.vcpu.n_exec = 0x1000;
    let event = world.pump_replay().unwrap().unwrap();
    assert!(matches!(event, ReplayEvent::Intr(0x21)));
}

/// Scenario 5 (the `IN` half): a previously recorded PCI config-space word
/// is returned verbatim during replay without the device being consulted.
#[test]
fn pci_config_read_is_served_from_the_replay_log() {
    let mut buf = Vec::new();
    {
        let mut rec = RecordLog::new(&mut buf);
        rec.write_in(5, 0xcfc, IoWidth::Dword, 0x8086_1234).unwrap();
    }
    let reader: Box<dyn BufRead> = Box::new(Cursor::new(buf));
    let mut world = test_world(RecordReplay::Replay(ReplayEngine::new(ReplayLog::new(reader))));
    world.io.register(0xcfc, None, None, Box::new(()), true, false);

    world.vcpu.n_exec = 5;
    let value = world.port_in(0xcfc, IoWidth::Dword);
    assert_eq!(value, 0x8086_1234);
}
