//! Shared boot-up path for every subcommand: read a disk image, parse its
//! boot sector, and assemble a [`trapmon_core::World`] from it.

use clap::Args;
use std::fs;
use thiserror::Error;
use trapmon_arch::fake::FakeArch;
use trapmon_core::{BootParams, DiskImageSource, MemDisk, RecordReplay, World};
use trapmon_fault::mode::PtAddrs;
use trapmon_mem::{AllocFlags, PagePool, PhysicalAddr, SubPool};

/// Arguments every subcommand needs to bring a monitor session up.
#[derive(Args)]
pub struct BootArgs {
    /// Flat disk image holding the boot sector and the monitor's own image.
    #[arg(short, long)]
    pub disk: String,

    /// Host-physical base of the page pool's arena.
    #[arg(long, default_value_t = 0x0100_0000)]
    pub pool_base: u32,

    /// Number of pages in the page pool's arena.
    #[arg(long, default_value_t = 16384)]
    pub pool_pages: usize,

    /// Linear address of the monitor's own TSS, as installed into the GDT.
    #[arg(long, default_value_t = 0xffc0_1000)]
    pub monitor_tss_laddr: u32,
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("reading disk image {path:?}: {source}")]
    Disk { path: String, source: std::io::Error },
    #[error("disk image {path:?} is smaller than one sector")]
    Truncated { path: String },
    #[error(transparent)]
    Mem(#[from] trapmon_mem::MemError),
}

/// Read the disk image, parse its boot sector, and build a [`World`] running
/// on [`FakeArch`]: this crate family has no bare-metal monitor entry point
/// of its own (that belongs to a boot loader outside its scope), so every
/// subcommand here drives the dispatch/replay machinery through the same
/// in-memory double the rest of the workspace tests against.
pub fn build_world(args: &BootArgs, rr: RecordReplay) -> Result<(World<FakeArch>, BootParams), BootError> {
    let bytes = fs::read(&args.disk).map_err(|source| BootError::Disk {
        path: args.disk.clone(),
        source,
    })?;
    if bytes.len() < 512 {
        return Err(BootError::Truncated { path: args.disk.clone() });
    }
    let boot = BootParams::from_sector(&bytes[..512]);
    log::info!(
        "boot: {} RAM page(s), monitor image at sector {} ({} sector(s)), loader {} byte(s)",
        boot.ram_pages,
        boot.monitor_disk_offset,
        boot.monitor_disk_length,
        boot.loader_size
    );

    let disk = MemDisk::new(bytes);
    let image = DiskImageSource::new(Box::new(disk), boot.monitor_disk_offset as u64);

    let mut pool = PagePool::new(PhysicalAddr::new(args.pool_base), args.pool_pages)?;
    let phys_map_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty())?;
    let shadow_sup_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty())?;
    let shadow_user_pt = pool.alloc(SubPool::General, 1, AllocFlags::empty())?;
    let pt_addrs = PtAddrs {
        phys_map: phys_map_pt.as_u32(),
        shadow_sup: Some(shadow_sup_pt.as_u32()),
        shadow_user: Some(shadow_user_pt.as_u32()),
    };

    let world = World::new(
        pool,
        boot.ram_pages(),
        args.monitor_tss_laddr,
        pt_addrs,
        Box::new(image),
        FakeArch::new(),
        rr,
    );
    Ok((world, boot))
}
