use thiserror::Error;
use trapmon_mem::MemError;

#[derive(Debug, Error)]
pub enum PagingError {
    #[error("guest page directory entry at index {0} is not present")]
    PdeNotPresent(usize),
    #[error("guest page table entry at index {0} is not present")]
    PteNotPresent(usize),
    #[error("access violates protection on entry at {0:#010x}")]
    ProtectionViolation(u32),
    #[error("page pool error: {0}")]
    Pool(#[from] MemError),
    #[error(
        "shadow walk of {addr:#010x} succeeded when the guest walk should have faulted first"
    )]
    Inconsistent { addr: u32 },
}

pub type Result<T> = core::result::Result<T, PagingError>;
