//! Reference implementation of [`Arch`] for real 32-bit x86 hardware.
//!
//! Every method here is a one- or two-instruction wrapper. None of them
//! validate their arguments; the monitor core is the only caller and it only
//! ever passes values it derived from its own shadow state.

use crate::{Arch, FxSaveArea, IretFrame};
use core::arch::asm;

pub struct X86Arch;

#[cfg(target_arch = "x86")]
impl Arch for X86Arch {
    unsafe fn read_cr2(&self) -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn read_cr3(&self) -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn write_cr3(&self, value: u32) {
        unsafe { asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    unsafe fn lgdt(&self, base: u32, limit: u16) {
        #[repr(C, packed)]
        struct Gdtr {
            limit: u16,
            base: u32,
        }
        let gdtr = Gdtr { limit, base };
        unsafe { asm!("lgdt [{}]", in(reg) &gdtr, options(nostack, readonly)) };
    }

    unsafe fn ltr(&self, selector: u16) {
        unsafe { asm!("ltr {0:x}", in(reg) selector, options(nomem, nostack)) };
    }

    unsafe fn inb(&self, port: u16) -> u8 {
        let value: u8;
        unsafe { asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn inw(&self, port: u16) -> u16 {
        let value: u16;
        unsafe { asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn inl(&self, port: u16) -> u32 {
        let value: u32;
        unsafe { asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn outb(&self, port: u16, value: u8) {
        unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn outw(&self, port: u16, value: u16) {
        unsafe { asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn outl(&self, port: u16, value: u32) {
        unsafe { asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn cli(&self) {
        unsafe { asm!("cli", options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn sti(&self) {
        unsafe { asm!("sti", options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn iret(&self, frame: &IretFrame) -> ! {
        unsafe {
            asm!(
                "push {ss:e}",
                "push {esp:e}",
                "push {eflags:e}",
                "push {cs:e}",
                "push {eip:e}",
                "iretd",
                ss = in(reg) frame.ss as u32,
                esp = in(reg) frame.esp,
                eflags = in(reg) frame.eflags,
                cs = in(reg) frame.cs as u32,
                eip = in(reg) frame.eip,
                options(noreturn),
            )
        }
    }

    unsafe fn fxsave(&self, area: &mut FxSaveArea) {
        unsafe { asm!("fxsave [{}]", in(reg) area.as_mut_ptr(), options(nostack)) };
    }

    unsafe fn fxrstor(&self, area: &FxSaveArea) {
        unsafe { asm!("fxrstor [{}]", in(reg) area.as_ptr(), options(nostack, readonly)) };
    }
}

// Building and testing this crate on a host that is not itself 32-bit x86
// (the common case for `cargo test`) still needs a type that implements
// `Arch` so downstream crates type-check uniformly; it simply cannot be
// exercised outside its native target.
#[cfg(not(target_arch = "x86"))]
impl Arch for X86Arch {
    unsafe fn read_cr2(&self) -> u32 {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn read_cr3(&self) -> u32 {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn write_cr3(&self, _value: u32) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn lgdt(&self, _base: u32, _limit: u16) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn ltr(&self, _selector: u16) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn inb(&self, _port: u16) -> u8 {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn inw(&self, _port: u16) -> u16 {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn inl(&self, _port: u16) -> u32 {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn outb(&self, _port: u16, _value: u8) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn outw(&self, _port: u16, _value: u16) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn outl(&self, _port: u16, _value: u32) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn cli(&self) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn sti(&self) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn iret(&self, _frame: &IretFrame) -> ! {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn fxsave(&self, _area: &mut FxSaveArea) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
    unsafe fn fxrstor(&self, _area: &FxSaveArea) {
        unimplemented!("X86Arch requires target_arch = \"x86\"")
    }
}
