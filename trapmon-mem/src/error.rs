use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemError {
    #[error("requested page count {pages} is invalid")]
    InvalidPageCount { pages: usize },

    #[error("sub-pool {pool:?} is out of memory")]
    OutOfMemory { pool: super::pool::SubPool },

    #[error("sub-pool {pool:?} limit of {limit} pages exceeded (requested {requested})")]
    LimitExceeded {
        pool: super::pool::SubPool,
        limit: usize,
        requested: usize,
    },

    #[error("address {0} is not page-aligned")]
    Misaligned(u32),

    #[error("page {0:#010x} does not belong to the sub-pool it was freed from")]
    NotOwned(u32),

    #[error("address {0:#010x} falls outside the pool's backing arena")]
    OutOfRange(u32),
}

pub type Result<T> = core::result::Result<T, MemError>;
