//! Guest RAM as a flat host-side buffer.
//!
//! Guest-physical addresses equal host-physical ones outside the monitor's
//! reserved window (`trapmon_paging::consts::MON_BASE..MON_END`), so a
//! single byte buffer sized to the configured RAM amount backs every
//! `GuestMemory` access the paging/GDT/fault crates make into guest-authored
//! structures (page tables, the GDT, the IDT). `trapmon-mem` and
//! `trapmon-gdt` each declare their own copy of this trait rather than
//! sharing one (see their doc comments), so `HostRam` implements both.

use trapmon_mem::{GuestPhysAddr, PAGE_SIZE};

pub struct HostRam {
    bytes: Vec<u8>,
}

impl HostRam {
    pub fn new(pages: usize) -> Self {
        HostRam {
            bytes: vec![0u8; pages * PAGE_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    fn read_u32_inner(&self, addr: u32) -> u32 {
        let addr = addr as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[addr..addr + 4]);
        u32::from_le_bytes(buf)
    }

    fn write_u32_inner(&mut self, addr: u32, value: u32) {
        let addr = addr as usize;
        self.bytes[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl trapmon_mem::GuestMemory for HostRam {
    fn read_u32(&self, addr: GuestPhysAddr) -> u32 {
        self.read_u32_inner(addr.as_u32())
    }

    fn write_u32(&mut self, addr: GuestPhysAddr, value: u32) {
        self.write_u32_inner(addr.as_u32(), value)
    }
}

impl trapmon_gdt::GuestMemory for HostRam {
    fn read_u32(&self, addr: GuestPhysAddr) -> u32 {
        self.read_u32_inner(addr.as_u32())
    }

    fn write_u32(&mut self, addr: GuestPhysAddr, value: u32) {
        self.write_u32_inner(addr.as_u32(), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_mem_crate_trait() {
        let mut ram = HostRam::new(4);
        trapmon_mem::GuestMemory::write_u32(&mut ram, GuestPhysAddr::new(0x100), 0xdead_beef);
        assert_eq!(
            trapmon_mem::GuestMemory::read_u32(&ram, GuestPhysAddr::new(0x100)),
            0xdead_beef
        );
    }

    #[test]
    fn round_trips_through_the_gdt_crate_trait() {
        let mut ram = HostRam::new(4);
        trapmon_gdt::GuestMemory::write_u32(&mut ram, GuestPhysAddr::new(0x200), 0x1234_5678);
        assert_eq!(
            trapmon_gdt::GuestMemory::read_u32(&ram, GuestPhysAddr::new(0x200)),
            0x1234_5678
        );
    }
}
