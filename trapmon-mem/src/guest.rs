//! Guest-physical memory access, as seen by the segment/GDT manager and the
//! shadow pagetable. A single shared trait so both crates agree on the seam
//! without depending on each other.

use crate::addr::GuestPhysAddr;

pub trait GuestMemory {
    fn read_u32(&self, addr: GuestPhysAddr) -> u32;
    fn write_u32(&mut self, addr: GuestPhysAddr, value: u32);

    fn read_page(&self, addr: GuestPhysAddr, buf: &mut [u8; crate::addr::PAGE_SIZE]) {
        for (i, chunk) in buf.chunks_mut(4).enumerate() {
            let word = self.read_u32(GuestPhysAddr::new(addr.as_u32() + (i as u32) * 4));
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }
}
