//! The process-wide physical page pool.
//!
//! One arena, one bitmap, three named sub-pools distinguished purely by
//! bookkeeping: `General` (the monitor's own data), `TranslationCache` (code
//! cache pages, bounded by [`TC_LIMIT`]) and `Swap` (shadow-page backing
//! store, bounded by [`SWAP_LIMIT`]). A page belongs to exactly one sub-pool
//! at a time; freeing it from the wrong sub-pool is a programmer error,
//! caught rather than silently accepted.

use crate::addr::{PhysicalAddr, PAGE_SIZE};
use crate::error::{MemError, Result};
use bitflags::bitflags;
use log::trace;

/// Matches the original monitor's `MAX_NUM_TC_PAGES`.
pub const TC_LIMIT: usize = 10_000;
/// Matches the original monitor's `MAX_NUM_SWAP_PAGES`.
pub const SWAP_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubPool {
    General,
    TranslationCache,
    Swap,
}

impl SubPool {
    const fn limit(self) -> Option<usize> {
        match self {
            SubPool::General => None,
            SubPool::TranslationCache => Some(TC_LIMIT),
            SubPool::Swap => Some(SWAP_LIMIT),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Zero the page(s) before returning them.
        const ZERO = 1 << 0;
    }
}

/// A bitmap-backed physical page pool over a single contiguous arena.
///
/// `bytes` is the arena's actual backing storage: every `PhysicalAddr` this
/// pool ever hands out names an offset into it, so content written through
/// [`PagePool::write_page`] (including the zeroing [`AllocFlags::ZERO`]
/// requests) is observable by anyone reading the same address back with
/// [`PagePool::page`].
pub struct PagePool {
    base: PhysicalAddr,
    total_pages: usize,
    used: Vec<u64>,
    owner: Vec<Option<SubPool>>,
    outstanding: [usize; 3],
    bytes: Vec<u8>,
}

fn owner_index(pool: SubPool) -> usize {
    match pool {
        SubPool::General => 0,
        SubPool::TranslationCache => 1,
        SubPool::Swap => 2,
    }
}

impl PagePool {
    /// Build a pool over `total_pages` pages starting at `base`. `base` must
    /// be page-aligned.
    pub fn new(base: PhysicalAddr, total_pages: usize) -> Result<Self> {
        if !base.is_aligned(PAGE_SIZE) {
            return Err(MemError::Misaligned(base.as_u32()));
        }
        let words = total_pages.div_ceil(64);
        Ok(PagePool {
            base,
            total_pages,
            used: vec![0u64; words],
            owner: vec![None; total_pages],
            outstanding: [0; 3],
            bytes: vec![0u8; total_pages * PAGE_SIZE],
        })
    }

    /// Byte offset of `addr`'s page within `self.bytes`. `addr` must be a
    /// page-aligned address this pool owns (i.e. one it previously handed
    /// back from `alloc`).
    fn page_offset(&self, addr: PhysicalAddr) -> Result<usize> {
        if addr < self.base {
            return Err(MemError::OutOfRange(addr.as_u32()));
        }
        let page = (addr.as_u32() - self.base.as_u32()) as usize / PAGE_SIZE;
        if page >= self.total_pages {
            return Err(MemError::OutOfRange(addr.as_u32()));
        }
        Ok(page * PAGE_SIZE)
    }

    /// The page-sized slice of arena storage backing `addr`.
    pub fn page(&self, addr: PhysicalAddr) -> Result<&[u8]> {
        let off = self.page_offset(addr)?;
        Ok(&self.bytes[off..off + PAGE_SIZE])
    }

    /// Overwrite the page-sized slice of arena storage backing `addr`.
    /// `data` must be exactly `PAGE_SIZE` bytes.
    pub fn write_page(&mut self, addr: PhysicalAddr, data: &[u8]) -> Result<()> {
        let off = self.page_offset(addr)?;
        self.bytes[off..off + PAGE_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn is_used(&self, page: usize) -> bool {
        (self.used[page / 64] & (1 << (page % 64))) != 0
    }

    fn mark(&mut self, page: usize, used: bool) {
        if used {
            self.used[page / 64] |= 1 << (page % 64);
        } else {
            self.used[page / 64] &= !(1 << (page % 64));
        }
    }

    /// Allocate `count` contiguous pages from `pool`, first-fit.
    pub fn alloc(&mut self, pool: SubPool, count: usize, flags: AllocFlags) -> Result<PhysicalAddr> {
        if count == 0 {
            return Err(MemError::InvalidPageCount { pages: count });
        }
        if let Some(limit) = pool.limit() {
            let idx = owner_index(pool);
            if self.outstanding[idx] + count > limit {
                return Err(MemError::LimitExceeded {
                    pool,
                    limit,
                    requested: self.outstanding[idx] + count,
                });
            }
        }

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for page in 0..self.total_pages {
            if self.is_used(page) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = page;
            }
            run_len += 1;
            if run_len == count {
                for p in run_start..run_start + count {
                    self.mark(p, true);
                    self.owner[p] = Some(pool);
                }
                self.outstanding[owner_index(pool)] += count;
                let addr = self.base + run_start * PAGE_SIZE;
                trace!("pool: alloc {count} page(s) from {pool:?} at {addr}");
                if flags.contains(AllocFlags::ZERO) {
                    let start = run_start * PAGE_SIZE;
                    self.bytes[start..start + count * PAGE_SIZE].fill(0);
                }
                return Ok(addr);
            }
        }
        Err(MemError::OutOfMemory { pool })
    }

    /// Return `count` pages starting at `addr` to `pool`. Fails if any page
    /// in the run is not currently owned by `pool`.
    pub fn free(&mut self, pool: SubPool, addr: PhysicalAddr, count: usize) -> Result<()> {
        if count == 0 {
            return Err(MemError::InvalidPageCount { pages: count });
        }
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(MemError::Misaligned(addr.as_u32()));
        }
        let start = (addr.as_u32() - self.base.as_u32()) as usize / PAGE_SIZE;
        for p in start..start + count {
            if self.owner[p] != Some(pool) {
                return Err(MemError::NotOwned((self.base + p * PAGE_SIZE).as_u32()));
            }
        }
        for p in start..start + count {
            self.mark(p, false);
            self.owner[p] = None;
        }
        self.outstanding[owner_index(pool)] -= count;
        trace!("pool: free {count} page(s) from {pool:?} at {addr}");
        Ok(())
    }

    pub fn outstanding(&self, pool: SubPool) -> usize {
        self.outstanding[owner_index(pool)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> PagePool {
        PagePool::new(PhysicalAddr::new(0x0010_0000), 64).unwrap()
    }

    #[test]
    fn alloc_then_free_reuses_page() {
        let mut p = pool();
        let a = p.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
        let b = p.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
        assert_eq!(b, a + PAGE_SIZE);
        p.free(SubPool::General, a, 1).unwrap();
        let c = p.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn tc_limit_is_enforced() {
        let mut p = PagePool::new(PhysicalAddr::new(0x0010_0000), TC_LIMIT + 1).unwrap();
        for _ in 0..TC_LIMIT {
            p.alloc(SubPool::TranslationCache, 1, AllocFlags::empty())
                .unwrap();
        }
        assert!(matches!(
            p.alloc(SubPool::TranslationCache, 1, AllocFlags::empty()),
            Err(MemError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn freeing_from_wrong_pool_is_rejected() {
        let mut p = pool();
        let a = p.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
        assert!(matches!(
            p.free(SubPool::Swap, a, 1),
            Err(MemError::NotOwned(_))
        ));
    }

    #[test]
    fn pools_never_overlap() {
        let mut p = pool();
        let g = p.alloc(SubPool::General, 4, AllocFlags::empty()).unwrap();
        let s = p.alloc(SubPool::Swap, 4, AllocFlags::empty()).unwrap();
        assert_ne!(g, s);
        p.free(SubPool::General, g, 4).unwrap();
        p.free(SubPool::Swap, s, 4).unwrap();
    }

    #[test]
    fn write_page_is_visible_through_page() {
        let mut p = pool();
        let a = p.alloc(SubPool::Swap, 1, AllocFlags::empty()).unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[PAGE_SIZE - 1] = 0xCD;
        p.write_page(a, &data).unwrap();
        assert_eq!(p.page(a).unwrap(), &data[..]);
    }

    #[test]
    fn zero_flag_clears_stale_content_on_realloc() {
        let mut p = pool();
        let a = p.alloc(SubPool::General, 1, AllocFlags::empty()).unwrap();
        p.write_page(a, &[0xFFu8; PAGE_SIZE]).unwrap();
        p.free(SubPool::General, a, 1).unwrap();
        let b = p.alloc(SubPool::General, 1, AllocFlags::ZERO).unwrap();
        assert_eq!(b, a);
        assert_eq!(p.page(b).unwrap(), &[0u8; PAGE_SIZE][..]);
    }

    #[test]
    fn page_outside_arena_is_rejected() {
        let p = pool();
        assert!(matches!(
            p.page(PhysicalAddr::new(0x0100_0000)),
            Err(MemError::OutOfRange(_))
        ));
    }
}
