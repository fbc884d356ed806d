//! CPU mode transitions: kernel ↔ user CPL, and which page directory `CR3`
//! currently names (`phys_map`, or one of the two shadow PDs).
//!
//! Mirrors `sys/mode.c` and `mem/pt_mode.c` in the reference monitor:
//! `switch_to_kernel`/`switch_to_user` there use a software interrupt to
//! raise CPL and an `iret`-style trampoline to drop it again, bracketing
//! every privileged operation. This crate has no bare-metal ring transition
//! of its own to perform (that lives in `Arch::iret` when `X86Arch` is the
//! backing implementation); what it owns is the *bookkeeping* — knowing
//! which mode is current, disabling interrupts for the bracket, and
//! restoring both afterward — so callers never have to reload `CR3` without
//! going through this module.

use trapmon_arch::Arch;

/// Guest-visible privilege level the monitor's own code is conceptually
/// executing at. `Kernel` is used for every page-directory load and other
/// privileged operation; `User` for monitor code that must not be trusted
/// to touch privileged state, and as the mode the guest itself always runs
/// under (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cpl {
    Kernel,
    User,
}

/// Which page directory `CR3` currently names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtTarget {
    /// The physical-identity map (§4.3).
    Phys,
    /// One of the two shadow page directories, `false` = supervisor,
    /// `true` = user, matching `vcpu.shadow_page_dir[user]`.
    Shadow(bool),
}

/// Host-physical addresses of the three page directories `switch_pt` can
/// target. Supplied by the caller (the `World` in `trapmon-core`) since this
/// crate has no opinion on where they live.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtAddrs {
    pub phys_map: u32,
    pub shadow_sup: Option<u32>,
    pub shadow_user: Option<u32>,
}

impl PtAddrs {
    fn resolve(&self, target: PtTarget) -> u32 {
        match target {
            PtTarget::Phys => self.phys_map,
            PtTarget::Shadow(false) => self.shadow_sup.expect("supervisor shadow PD not allocated"),
            PtTarget::Shadow(true) => self.shadow_user.expect("user shadow PD not allocated"),
        }
    }
}

/// Tracks the monitor's current CPL and `CR3` target, and performs every
/// transition between them through the same bracket: raise to kernel mode
/// (if not already there) with interrupts off, reload `CR3` if it would
/// actually change, then drop back to the mode the caller was in before.
pub struct ModeSwitcher {
    cpl: Cpl,
    pt: Option<PtTarget>,
}

impl ModeSwitcher {
    /// The reference monitor's initial state: the one thread starts in user
    /// mode, with no page directory loaded yet (real-mode identity map is
    /// used until the guest enables paging).
    pub fn new() -> Self {
        ModeSwitcher {
            cpl: Cpl::User,
            pt: None,
        }
    }

    pub fn cpl(&self) -> Cpl {
        self.cpl
    }

    pub fn pt_target(&self) -> Option<PtTarget> {
        self.pt
    }

    /// Raise to kernel mode if not already there. Returns the mode the
    /// caller was in, so it can be restored with [`Self::switch_mode`].
    pub fn switch_to_kernel(&mut self, arch: &dyn Arch) -> Cpl {
        let prev = self.cpl;
        if prev == Cpl::User {
            unsafe { arch.cli() };
            self.cpl = Cpl::Kernel;
        }
        prev
    }

    /// Drop back to user mode if not already there.
    pub fn switch_to_user(&mut self, arch: &dyn Arch) -> Cpl {
        let prev = self.cpl;
        if prev == Cpl::Kernel {
            self.cpl = Cpl::User;
            unsafe { arch.sti() };
        }
        prev
    }

    pub fn switch_mode(&mut self, arch: &dyn Arch, mode: Cpl) {
        match mode {
            Cpl::Kernel => {
                self.switch_to_kernel(arch);
            }
            Cpl::User => {
                self.switch_to_user(arch);
            }
        }
    }

    /// Retarget `CR3` to `target`, resolved through `addrs`. Brackets the
    /// reload in a kernel-mode, interrupts-off window and restores the
    /// caller's mode afterward, matching `switch_to_phys`/`switch_to_shadow`
    /// in the reference monitor. A no-op if `CR3` already names `target`.
    pub fn switch_pt(&mut self, arch: &dyn Arch, target: PtTarget, addrs: &PtAddrs) {
        let prev_mode = self.switch_to_kernel(arch);
        let new_cr3 = addrs.resolve(target);
        let cur_cr3 = unsafe { arch.read_cr3() };
        if cur_cr3 != new_cr3 {
            unsafe { arch.write_cr3(new_cr3) };
        }
        self.pt = Some(target);
        self.switch_mode(arch, prev_mode);
    }

    pub fn switch_to_phys(&mut self, arch: &dyn Arch, addrs: &PtAddrs) {
        self.switch_pt(arch, PtTarget::Phys, addrs);
    }

    pub fn switch_to_shadow(&mut self, arch: &dyn Arch, user: bool, addrs: &PtAddrs) {
        self.switch_pt(arch, PtTarget::Shadow(user), addrs);
    }
}

impl Default for ModeSwitcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trapmon_arch::fake::FakeArch;

    #[test]
    fn kernel_user_round_trip_restores_cpl_and_interrupts() {
        let arch = FakeArch::new();
        unsafe { arch.sti() };
        let mut ms = ModeSwitcher::new();
        assert_eq!(ms.cpl(), Cpl::User);

        let prev = ms.switch_to_kernel(&arch);
        assert_eq!(prev, Cpl::User);
        assert_eq!(ms.cpl(), Cpl::Kernel);
        assert!(!arch.interrupts_enabled());

        ms.switch_mode(&arch, prev);
        assert_eq!(ms.cpl(), Cpl::User);
        assert!(arch.interrupts_enabled());
    }

    #[test]
    fn switch_pt_reloads_cr3_only_when_target_changes() {
        let arch = FakeArch::new();
        let mut ms = ModeSwitcher::new();
        let addrs = PtAddrs {
            phys_map: 0x0030_0000,
            shadow_sup: Some(0x0031_0000),
            shadow_user: Some(0x0032_0000),
        };

        ms.switch_to_phys(&arch, &addrs);
        assert_eq!(unsafe { arch.read_cr3() }, 0x0030_0000);
        assert_eq!(ms.pt_target(), Some(PtTarget::Phys));

        ms.switch_to_shadow(&arch, false, &addrs);
        assert_eq!(unsafe { arch.read_cr3() }, 0x0031_0000);

        ms.switch_to_shadow(&arch, false, &addrs);
        assert_eq!(unsafe { arch.read_cr3() }, 0x0031_0000);
    }

    #[test]
    fn switch_pt_returns_to_user_mode_afterward() {
        let arch = FakeArch::new();
        unsafe { arch.sti() };
        let mut ms = ModeSwitcher::new();
        let addrs = PtAddrs {
            phys_map: 0x0030_0000,
            shadow_sup: None,
            shadow_user: None,
        };
        ms.switch_to_phys(&arch, &addrs);
        assert_eq!(ms.cpl(), Cpl::User);
        assert!(arch.interrupts_enabled());
    }
}
