//! The global frame table: every physical frame available for user pages, and the second-chance
//! clock algorithm that picks an eviction victim when the pool is full.
//!
//! Grounded on `vm/frame.c`. One `FrameTable` instance is shared by every process in the system
//! (spec §2); the clock hand sweeps across all occupied frames regardless of which process's
//! descriptor occupies them.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::BlockDevice;
use crate::error::VmError;
use crate::mmu::Mmu;
use crate::page::PageHandle;
use crate::phys::PhysFrames;
use crate::swap::SwapArea;
use crate::types::PAddr;

struct FrameEntry {
    paddr: PAddr,
    occupant: Option<PageHandle>,
}

struct Inner<F: PhysFrames> {
    frames: Vec<FrameEntry>,
    used: Vec<bool>,
    clock_hand: usize,
    phys: F,
}

/// The number of frames the frame table itself consumes for its own bookkeeping (the frame
/// array and occupancy bitmap), subtracted from the usable pool. Grounded on
/// `vm/frame.c:frame_init`'s `bm_pages` calculation; at this crate's scale that bookkeeping lives
/// in the kernel heap rather than in dedicated physical pages, so the real subtraction is the
/// caller's job at construction time (see `FrameTable::new`'s `reserved` parameter) — this
/// function documents what PintOS reserved so a caller porting the sizing math over can match it.
pub fn metadata_frames(total_user_pages: usize) -> usize {
    // PintOS reserves enough pages to hold one `struct frame` (16 bytes) and one bitmap bit per
    // user page; at 4096-byte pages this rounds to a small, usually-zero number of frames, but
    // we keep the computation explicit rather than assuming it is always zero.
    let frame_struct_bytes = total_user_pages * 16;
    let bitmap_bytes = (total_user_pages + 7) / 8;
    (frame_struct_bytes + bitmap_bytes + 4095) / 4096
}

pub struct FrameTable<F: PhysFrames> {
    inner: Mutex<Inner<F>>,
}

impl<F: PhysFrames> FrameTable<F> {
    /// Build a frame table with `usable_frames` entries, each initially empty and unallocated.
    pub fn new(phys: F, usable_frames: usize) -> Self {
        FrameTable {
            inner: Mutex::new(Inner {
                frames: (0..usable_frames)
                    .map(|_| FrameEntry {
                        paddr: 0,
                        occupant: None,
                    })
                    .collect(),
                used: vec![false; usable_frames],
                clock_hand: 0,
                phys,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn paddr_of(&self, idx: usize) -> PAddr {
        self.inner.lock().frames[idx].paddr
    }

    pub fn read_frame(&self, idx: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        inner.phys.read_page(inner.frames[idx].paddr, buf);
    }

    pub fn write_frame(&self, idx: usize, buf: &[u8]) {
        let mut inner = self.inner.lock();
        let paddr = inner.frames[idx].paddr;
        inner.phys.write_page(paddr, buf);
    }

    pub fn zero_frame(&self, idx: usize) {
        let mut inner = self.inner.lock();
        let paddr = inner.frames[idx].paddr;
        inner.phys.zero_page(paddr);
    }

    /// Obtain a frame for `occupant`, evicting a victim under the clock algorithm if the pool is
    /// full. The occupant is recorded as soon as a frame index is chosen — before its contents
    /// are materialized — exactly as `vm/frame.c` sets `frame->page_occupant` immediately after
    /// `get_frame()` returns; callers are expected to pin `occupant` before calling this and
    /// unpin it only once the page is fully resident, so the clock scan cannot pick this frame
    /// out from under a fault still in progress.
    pub fn acquire<B: BlockDevice, M: Mmu>(
        &self,
        occupant: PageHandle,
        swap: &SwapArea<B>,
        mmu: &M,
    ) -> Result<usize, VmError> {
        let mut inner = self.inner.lock();
        if inner.frames.is_empty() {
            return Err(VmError::NoFrames);
        }
        if let Some(idx) = inner.used.iter().position(|u| !u) {
            let paddr = inner.phys.alloc_user_page(true).ok_or(VmError::OutOfMemory)?;
            inner.used[idx] = true;
            inner.frames[idx].paddr = paddr;
            inner.frames[idx].occupant = Some(occupant);
            return Ok(idx);
        }
        let idx = Self::evict_one(&mut inner, swap, mmu)?;
        inner.frames[idx].occupant = Some(occupant);
        Ok(idx)
    }

    /// Release frame `idx`: clear its occupant's mapping, return the physical page to the pool,
    /// and mark the slot free.
    pub fn release<M: Mmu>(&self, idx: usize, mmu: &M) {
        let mut inner = self.inner.lock();
        if let Some(occ) = inner.frames[idx].occupant.take() {
            mmu.clear(occ.owner_pagedir(), occ.vaddr);
        }
        inner.used[idx] = false;
        let paddr = inner.frames[idx].paddr;
        inner.phys.free_user_page(paddr);
    }

    /// Run the second-chance clock starting at the current hand, under the table lock, until it
    /// finds and evicts a victim. Panics if a full sweep finds no candidate, matching spec §4.2's
    /// "this signals a logic error elsewhere in the system" — with every frame occupied and
    /// pinned or perpetually re-accessed, there is nothing correct left to do but stop.
    fn evict_one<B: BlockDevice, M: Mmu>(
        inner: &mut Inner<F>,
        swap: &SwapArea<B>,
        mmu: &M,
    ) -> Result<usize, VmError> {
        let n = inner.frames.len();
        let max_scans = 2 * n + 1;
        for _ in 0..max_scans {
            let idx = inner.clock_hand;
            inner.clock_hand = (idx + 1) % n;

            let occ = inner.frames[idx].occupant.clone().unwrap_or_else(|| {
                panic!(
                    "frame table bug: frame {} is marked allocated but has no occupant",
                    idx
                )
            });

            if mmu.accessed(occ.owner_pagedir(), occ.vaddr) {
                mmu.clear_accessed(occ.owner_pagedir(), occ.vaddr);
                continue;
            }

            if !occ.try_pin() {
                continue;
            }

            let mut buf = [0u8; crate::types::PAGE_SIZE];
            inner.phys.read_page(inner.frames[idx].paddr, &mut buf);
            let slot = swap
                .insert(&buf)
                .expect("no free swap slots available to evict into");
            occ.set_evicted(slot);
            mmu.clear(occ.owner_pagedir(), occ.vaddr);
            inner.frames[idx].occupant = None;
            occ.unpin();

            return Ok(idx);
        }
        panic!(
            "second-chance clock swept {} frames without finding a victim",
            max_scans
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::RamBlockDevice;
    use crate::mmu::test_support::FakeMmu;
    use crate::page::PageDescriptor;
    use crate::phys::test_support::RamFrames;
    use crate::types::PageDirId;

    fn swap(slots: usize) -> SwapArea<RamBlockDevice> {
        SwapArea::new(
            RamBlockDevice::new((slots * crate::swap::SECTORS_PER_SLOT) as u64),
            slots,
        )
    }

    #[test]
    fn acquire_hands_out_distinct_frames() {
        let table = FrameTable::new(RamFrames::new(2), 2);
        let s = swap(4);
        let mmu = FakeMmu::new();
        let a = PageDescriptor::new_file(0x1000, PageDirId(1), true, 1, 0, 0);
        let b = PageDescriptor::new_file(0x2000, PageDirId(1), true, 1, 0, 0);
        let ia = table.acquire(a, &s, &mmu).unwrap();
        let ib = table.acquire(b, &s, &mmu).unwrap();
        assert_ne!(ia, ib);
    }

    #[test]
    fn eviction_picks_unaccessed_unpinned_victim() {
        let table = FrameTable::new(RamFrames::new(1), 1);
        let s = swap(4);
        let mmu = FakeMmu::new();
        let resident = PageDescriptor::new_file(0x1000, PageDirId(1), true, 1, 0, 0);
        let idx = table.acquire(resident.clone(), &s, &mmu).unwrap();
        mmu.install(PageDirId(1), 0x1000, table.paddr_of(idx), true);
        resident.set_resident(idx);

        let newcomer = PageDescriptor::new_file(0x2000, PageDirId(1), true, 1, 0, 0);
        let idx2 = table.acquire(newcomer, &s, &mmu).unwrap();
        assert_eq!(idx, idx2, "only frame available must be reused");
        assert_eq!(resident.status(), crate::page::PageStatus::InSwap);
        assert!(!mmu.resolved(PageDirId(1), 0x1000));
    }

    #[test]
    fn clock_gives_accessed_pages_a_second_chance() {
        let table = FrameTable::new(RamFrames::new(1), 1);
        let s = swap(4);
        let mmu = FakeMmu::new();
        let resident = PageDescriptor::new_file(0x1000, PageDirId(1), true, 1, 0, 0);
        let idx = table.acquire(resident.clone(), &s, &mmu).unwrap();
        mmu.install(PageDirId(1), 0x1000, table.paddr_of(idx), true);
        resident.set_resident(idx);
        mmu.touch(PageDirId(1), 0x1000);

        let newcomer = PageDescriptor::new_file(0x2000, PageDirId(1), true, 1, 0, 0);
        table.acquire(newcomer, &s, &mmu).unwrap();
        // accessed bit was cleared on the first pass and the page evicted on the (implicit)
        // second; since there is only one frame, the clock must wrap to revisit it.
        assert_eq!(resident.status(), crate::page::PageStatus::InSwap);
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let table = FrameTable::new(RamFrames::new(1), 1);
        let s = swap(4);
        let mmu = FakeMmu::new();
        let resident = PageDescriptor::new_file(0x1000, PageDirId(1), true, 1, 0, 0);
        let idx = table.acquire(resident.clone(), &s, &mmu).unwrap();
        resident.set_resident(idx);
        resident.pin();

        let newcomer = PageDescriptor::new_file(0x2000, PageDirId(1), true, 1, 0, 0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            table.acquire(newcomer, &s, &mmu)
        }));
        assert!(result.is_err(), "clock must panic rather than evict a pinned page forever");
    }
}
