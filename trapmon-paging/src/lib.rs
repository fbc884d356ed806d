//! The physical-identity map and the per-guest-CPL shadow page directories
//! that keep a guest's own page tables from ever being trusted directly by
//! the host MMU.

pub mod consts;
pub mod error;
pub mod mtrace;
pub mod physmap;
pub mod pte;
pub mod shadow;
pub mod walk;

pub use consts::{in_monitor_window, MON_BASE, MON_END, MON_VBASE};
pub use error::{PagingError, Result};
pub use mtrace::{TraceEntry, TraceTable};
pub use physmap::{MonitorImageSource, PhysMap};
pub use pte::{Pte, PteFlags};
pub use shadow::{ShadowPageDirectory, ShadowWalkOutcome};
pub use walk::{guest_walk, GuestWalkOutcome, WalkError, WalkFlags};
