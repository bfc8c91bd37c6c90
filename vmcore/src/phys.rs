//! The physical frame pool the frame table draws from.
//!
//! The teacher wraps `buddy::BuddyAllocator` in a thin adapter (`memory::heap::phys`) to
//! implement `x86_64`'s `FrameAllocator` trait; `PhysFrames` is the same shape, generalized to
//! what the frame table additionally needs: zeroing a frame and moving bytes in and out of one
//! (modeling the kernel's direct/offset-mapped view of physical memory, which every kernel has
//! but which spec leaves implicit).

use crate::types::PAddr;

pub trait PhysFrames {
    /// Obtain one physical frame. If `zeroed`, its contents are all-zero; frame table callers
    /// that reuse a frame via eviction instead of a fresh allocation must zero it themselves if
    /// they need that guarantee (see `zero_page`).
    fn alloc_user_page(&mut self, zeroed: bool) -> Option<PAddr>;

    /// Return a frame obtained from `alloc_user_page` to the pool.
    fn free_user_page(&mut self, paddr: PAddr);

    /// Zero the contents of a frame in place.
    fn zero_page(&mut self, paddr: PAddr);

    /// Copy a frame's contents into `buf` (`buf.len() == PAGE_SIZE`).
    fn read_page(&self, paddr: PAddr, buf: &mut [u8]);

    /// Overwrite a frame's contents from `buf` (`buf.len() == PAGE_SIZE`).
    fn write_page(&mut self, paddr: PAddr, buf: &[u8]);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::types::PAGE_SIZE;
    use alloc::vec;
    use alloc::vec::Vec;

    /// An in-memory physical frame pool, addressed by a made-up "physical address" that is just
    /// `index * PAGE_SIZE`. Good enough to test the frame table and fault resolver without real
    /// memory-mapped I/O.
    pub struct RamFrames {
        frames: Vec<[u8; PAGE_SIZE]>,
        free: Vec<bool>,
    }

    impl RamFrames {
        pub fn new(count: usize) -> Self {
            RamFrames {
                frames: vec![[0u8; PAGE_SIZE]; count],
                free: vec![true; count],
            }
        }

        fn index_of(&self, paddr: PAddr) -> usize {
            (paddr as usize) / PAGE_SIZE
        }
    }

    impl PhysFrames for RamFrames {
        fn alloc_user_page(&mut self, zeroed: bool) -> Option<PAddr> {
            let idx = self.free.iter().position(|f| *f)?;
            self.free[idx] = false;
            if zeroed {
                self.frames[idx] = [0u8; PAGE_SIZE];
            }
            Some((idx * PAGE_SIZE) as PAddr)
        }

        fn free_user_page(&mut self, paddr: PAddr) {
            let idx = self.index_of(paddr);
            self.free[idx] = true;
        }

        fn zero_page(&mut self, paddr: PAddr) {
            let idx = self.index_of(paddr);
            self.frames[idx] = [0u8; PAGE_SIZE];
        }

        fn read_page(&self, paddr: PAddr, buf: &mut [u8]) {
            let idx = self.index_of(paddr);
            buf.copy_from_slice(&self.frames[idx]);
        }

        fn write_page(&mut self, paddr: PAddr, buf: &[u8]) {
            let idx = self.index_of(paddr);
            self.frames[idx].copy_from_slice(buf);
        }
    }
}
