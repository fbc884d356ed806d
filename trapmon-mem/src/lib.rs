pub mod addr;
pub mod error;
pub mod guest;
pub mod pool;

pub use addr::{pd_index, pt_index, GuestPhysAddr, LinearAddr, PhysicalAddr, LARGE_PAGE_SIZE, PAGE_SIZE};
pub use error::{MemError, Result};
pub use guest::GuestMemory;
pub use pool::{AllocFlags, PagePool, SubPool, SWAP_LIMIT, TC_LIMIT};
