//! The monitor core: boot parameters, guest RAM, the per-guest VCPU, and
//! [`world::World`], which wires the page pool, identity map, shadow page
//! directories, GDT, fault dispatcher, I/O ring and record/replay engine
//! together into one driveable session.
//!
//! Everything privileged (loading `CR3`, disabling interrupts, programmed
//! I/O) goes through [`trapmon_arch::Arch`]; everything else in this crate
//! is ordinary, host-testable Rust.

pub mod boot;
pub mod disk;
pub mod error;
pub mod memory;
pub mod vcpu;
pub mod world;

pub use boot::BootParams;
pub use disk::{BlockDevice, DiskImageSource, MemDisk};
pub use error::{CoreError, MonitorOutcome, Result};
pub use memory::HostRam;
pub use vcpu::Vcpu;
pub use world::{RecordReplay, World};
