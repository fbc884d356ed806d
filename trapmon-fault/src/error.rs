//! Errors the dispatcher can return. These are all "the monitor itself is
//! broken" conditions — a `#PF`/`#GP` that resolves to a guest-visible
//! outcome is reported through [`crate::dispatch::FaultOutcome`], not here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The guest walk and the shadow walk disagree about whether a
    /// translation exists: the hardware's `#PF` should never have happened.
    /// Mirrors the `ASSERT` in `shadow_handle_page_fault` that fires when
    /// neither a true fault nor a known shadow cause explains the trap.
    #[error("page fault at {addr:#010x} has no explanation (guest and shadow walks agree)")]
    Inconsistent { addr: u32 },

    #[error("page pool exhausted while resolving fault")]
    Pool(#[from] trapmon_mem::MemError),

    #[error("guest IDT has no entry for vector {0}")]
    IdtEntryNotPresent(u8),

    #[error("guest IDT limit too small for vector {0}")]
    IdtLimitExceeded(u8),
}

pub type Result<T> = core::result::Result<T, DispatchError>;
