//! Delivering an exception to the guest's own handler: read its IDT,
//! push the `(eip, cs, eflags)` return frame onto its own stack, and report
//! where execution should resume. Mirrors `passthrough`'s `SEL_UCSEG` branch
//! in the reference monitor, minus the `guest_intr_handler` call itself —
//! the `Vcpu` is what actually owns registers and resumes execution, so it
//! applies the frame this returns rather than this crate touching registers
//! directly.

use crate::error::{DispatchError, Result};
use trapmon_mem::GuestMemory;

/// A 32-bit interrupt/trap gate, as read out of the guest's IDT.
struct IdtGate {
    offset: u32,
    selector: u16,
    present: bool,
}

fn read_gate(mem: &dyn GuestMemory, idt_base: u32, idt_limit: u16, vector: u8) -> Result<IdtGate> {
    let entry_off = (vector as u32) * 8;
    if entry_off + 7 > idt_limit as u32 {
        return Err(DispatchError::IdtLimitExceeded(vector));
    }
    let addr = trapmon_mem::GuestPhysAddr::new(idt_base + entry_off);
    let low = mem.read_u32(addr);
    let high = mem.read_u32(trapmon_mem::GuestPhysAddr::new(idt_base + entry_off + 4));
    let offset = (low & 0xffff) | (high & 0xffff_0000);
    let selector = (low >> 16) as u16;
    let present = (high >> 15) & 1 != 0;
    Ok(IdtGate {
        offset,
        selector,
        present,
    })
}

/// The guest state needed to build a passthrough frame: the interrupted
/// instruction's segment/flags/stack, flat (no non-zero segment bases are
/// supported, matching the guest environments this monitor targets).
#[derive(Debug, Clone, Copy)]
pub struct GuestCpuView {
    pub cs: u16,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

/// Where the guest resumes after a passthrough delivery, and the new
/// stack pointer left after the `(eip, cs, eflags)` frame was pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassthroughFrame {
    pub new_cs: u16,
    pub new_eip: u32,
    pub new_esp: u32,
}

/// Deliver `vector` to the guest: read its IDT entry, push the interrupted
/// context onto its stack, and return where it resumes. `error_code`, when
/// `Some`, is pushed below the `(eip, cs, eflags)` frame as x86 does for
/// exceptions that carry one (`#PF`, `#GP`, ...).
pub fn dispatch_passthrough(
    mem: &mut dyn GuestMemory,
    idt_base: u32,
    idt_limit: u16,
    vector: u8,
    error_code: Option<u32>,
    cpu: GuestCpuView,
) -> Result<PassthroughFrame> {
    let gate = read_gate(mem, idt_base, idt_limit, vector)?;
    if !gate.present {
        return Err(DispatchError::IdtEntryNotPresent(vector));
    }

    let mut esp = cpu.esp;
    if let Some(code) = error_code {
        esp -= 4;
        mem.write_u32(trapmon_mem::GuestPhysAddr::new(esp), code);
    }
    esp -= 4;
    mem.write_u32(trapmon_mem::GuestPhysAddr::new(esp), cpu.eflags);
    esp -= 4;
    mem.write_u32(trapmon_mem::GuestPhysAddr::new(esp), cpu.cs as u32);
    esp -= 4;
    mem.write_u32(trapmon_mem::GuestPhysAddr::new(esp), cpu.eip);

    Ok(PassthroughFrame {
        new_cs: gate.selector,
        new_eip: gate.offset,
        new_esp: esp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMem(HashMap<u32, u32>);
    impl GuestMemory for FakeMem {
        fn read_u32(&self, addr: trapmon_mem::GuestPhysAddr) -> u32 {
            *self.0.get(&addr.as_u32()).unwrap_or(&0)
        }
        fn write_u32(&mut self, addr: trapmon_mem::GuestPhysAddr, value: u32) {
            self.0.insert(addr.as_u32(), value);
        }
    }

    fn install_gate(mem: &mut FakeMem, idt_base: u32, vector: u8, selector: u16, offset: u32) {
        let entry_off = idt_base + (vector as u32) * 8;
        let low = (offset & 0xffff) | ((selector as u32) << 16);
        let high = (offset & 0xffff_0000) | (1 << 15) | (0xE << 8);
        mem.write_u32(trapmon_mem::GuestPhysAddr::new(entry_off), low);
        mem.write_u32(trapmon_mem::GuestPhysAddr::new(entry_off + 4), high);
    }

    #[test]
    fn resolves_gate_and_pushes_frame_without_error_code() {
        let mut mem = FakeMem(HashMap::new());
        install_gate(&mut mem, 0x1000, 14, 0x08, 0x0010_2000);
        let cpu = GuestCpuView {
            cs: 0x1b,
            eip: 0x0040_5000,
            eflags: 0x202,
            esp: 0x0050_0000,
        };
        let frame = dispatch_passthrough(&mut mem, 0x1000, 0x07ff, 14, None, cpu).unwrap();
        assert_eq!(frame.new_cs, 0x08);
        assert_eq!(frame.new_eip, 0x0010_2000);
        assert_eq!(frame.new_esp, 0x0050_0000 - 12);
        assert_eq!(mem.read_u32(trapmon_mem::GuestPhysAddr::new(frame.new_esp)), cpu.eip);
        assert_eq!(
            mem.read_u32(trapmon_mem::GuestPhysAddr::new(frame.new_esp + 4)),
            cpu.cs as u32
        );
        assert_eq!(
            mem.read_u32(trapmon_mem::GuestPhysAddr::new(frame.new_esp + 8)),
            cpu.eflags
        );
    }

    #[test]
    fn error_code_is_pushed_below_the_frame() {
        let mut mem = FakeMem(HashMap::new());
        install_gate(&mut mem, 0x1000, 14, 0x08, 0x0010_2000);
        let cpu = GuestCpuView {
            cs: 0x1b,
            eip: 0x0040_5000,
            eflags: 0x202,
            esp: 0x0050_0000,
        };
        let frame = dispatch_passthrough(&mut mem, 0x1000, 0x07ff, 14, Some(0x6), cpu).unwrap();
        assert_eq!(frame.new_esp, 0x0050_0000 - 16);
        assert_eq!(mem.read_u32(trapmon_mem::GuestPhysAddr::new(frame.new_esp + 12)), 0x6);
    }

    #[test]
    fn not_present_gate_is_reported() {
        let mut mem = FakeMem(HashMap::new());
        let cpu = GuestCpuView {
            cs: 0x1b,
            eip: 0,
            eflags: 0,
            esp: 0x1000,
        };
        let err = dispatch_passthrough(&mut mem, 0x1000, 0x07ff, 14, None, cpu).unwrap_err();
        assert!(matches!(err, DispatchError::IdtEntryNotPresent(14)));
    }
}
