//! An in-memory [`Arch`] used by the rest of the workspace's test suites.
//!
//! It keeps no real privilege state: `cr2`/`cr3` are plain cells, port I/O is
//! backed by a byte-addressable fake bus, and `iret`/interrupt toggling are
//! just recorded for assertions. Nothing here touches the host CPU.

use crate::{Arch, FxSaveArea, IretFrame};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Default)]
struct State {
    cr2: u32,
    cr3: u32,
    gdtr: (u32, u16),
    tr: u16,
    interrupts_enabled: bool,
    ports: HashMap<u16, u32>,
    fx: FxSaveArea,
    last_iret: Option<IretFrame>,
}

impl Default for FxSaveArea {
    fn default() -> Self {
        [0u8; 512]
    }
}

/// A host-side stand-in for [`crate::x86::X86Arch`].
pub struct FakeArch {
    state: RefCell<State>,
}

impl FakeArch {
    pub fn new() -> Self {
        FakeArch {
            state: RefCell::new(State::default()),
        }
    }

    /// Seed the value a later `read_cr2` will return (as if a fault had set it).
    pub fn set_cr2(&self, value: u32) {
        self.state.borrow_mut().cr2 = value;
    }

    /// Seed a port's current value, as if a device had driven it.
    pub fn set_port(&self, port: u16, value: u32) {
        self.state.borrow_mut().ports.insert(port, value);
    }

    pub fn last_iret(&self) -> Option<IretFrame> {
        self.state.borrow().last_iret
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.state.borrow().interrupts_enabled
    }

    pub fn gdtr(&self) -> (u32, u16) {
        self.state.borrow().gdtr
    }

    pub fn tr(&self) -> u16 {
        self.state.borrow().tr
    }
}

impl Default for FakeArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for FakeArch {
    unsafe fn read_cr2(&self) -> u32 {
        self.state.borrow().cr2
    }

    unsafe fn read_cr3(&self) -> u32 {
        self.state.borrow().cr3
    }

    unsafe fn write_cr3(&self, value: u32) {
        self.state.borrow_mut().cr3 = value;
    }

    unsafe fn lgdt(&self, base: u32, limit: u16) {
        self.state.borrow_mut().gdtr = (base, limit);
    }

    unsafe fn ltr(&self, selector: u16) {
        self.state.borrow_mut().tr = selector;
    }

    unsafe fn inb(&self, port: u16) -> u8 {
        (*self.state.borrow().ports.get(&port).unwrap_or(&0)) as u8
    }

    unsafe fn inw(&self, port: u16) -> u16 {
        (*self.state.borrow().ports.get(&port).unwrap_or(&0)) as u16
    }

    unsafe fn inl(&self, port: u16) -> u32 {
        *self.state.borrow().ports.get(&port).unwrap_or(&0)
    }

    unsafe fn outb(&self, port: u16, value: u8) {
        self.state.borrow_mut().ports.insert(port, value as u32);
    }

    unsafe fn outw(&self, port: u16, value: u16) {
        self.state.borrow_mut().ports.insert(port, value as u32);
    }

    unsafe fn outl(&self, port: u16, value: u32) {
        self.state.borrow_mut().ports.insert(port, value);
    }

    unsafe fn cli(&self) {
        self.state.borrow_mut().interrupts_enabled = false;
    }

    unsafe fn sti(&self) {
        self.state.borrow_mut().interrupts_enabled = true;
    }

    unsafe fn iret(&self, frame: &IretFrame) -> ! {
        self.state.borrow_mut().last_iret = Some(*frame);
        panic!("FakeArch::iret does not actually transfer control");
    }

    unsafe fn fxsave(&self, area: &mut FxSaveArea) {
        area.copy_from_slice(&self.state.borrow().fx);
    }

    unsafe fn fxrstor(&self, area: &FxSaveArea) {
        self.state.borrow_mut().fx.copy_from_slice(area);
    }
}
