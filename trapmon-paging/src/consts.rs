//! The monitor's fixed physical and virtual window.

/// Start of the monitor's reserved physical window.
pub const MON_BASE: u32 = 0x0040_0000;
/// One past the end of the monitor's reserved physical window (8 MiB).
pub const MON_END: u32 = 0x00C0_0000;
/// Virtual address at which the monitor's window is mapped, and the limit
/// beyond which guest segments are truncated.
pub const MON_VBASE: u32 = 0xffc0_0000;

pub fn in_monitor_window(phys: u32) -> bool {
    phys >= MON_BASE && phys < MON_END
}
