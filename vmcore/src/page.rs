//! The per-process supplemental page table.
//!
//! Grounded on `dpk326_vm_turnin/vm/page.c` and `vm/page.h`: one descriptor per page the process
//! knows about but that is not necessarily mapped, keyed by page-aligned virtual address, plus
//! the `DNR` ("do not remove") pin lock each descriptor carries to keep the evictor and teardown
//! from fighting over it.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::sync::PinLock;
use crate::types::{page_no, FileId, PAddr, PageDirId, SlotId, VAddr};

/// Where a page's bytes currently live, per spec §3's data model.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageStatus {
    /// Never touched; reads as zero, nothing backs it yet.
    AllZero,
    /// Resident: `frame` names the occupied frame table entry.
    InFrame,
    /// Evicted: `swap_slot` names where its bytes were written.
    InSwap,
    /// Backed by a file, not yet paged in.
    InFile,
}

#[derive(Default)]
struct PageState {
    status_frame_swap: Option<(PageStatus, Option<usize>, Option<SlotId>)>,
}

/// A handle to a page descriptor, shared between the owning process's supplemental table and
/// (transiently, while resident) the frame table entry that occupies it. Cloning is cheap
/// (refcount bump); the two sides never need to agree on ownership because neither one is ever
/// the sole owner — see spec §9's note on cyclic ownership.
pub type PageHandle = Arc<PageDescriptor>;

pub struct PageDescriptor {
    pub vaddr: VAddr,
    owner_pagedir: PageDirId,
    pub writable: bool,
    pub is_stack: bool,
    pub file: Option<FileId>,
    pub offset: u64,
    pub read_bytes: u32,
    state: Mutex<PageState>,
    pin: PinLock,
}

impl PageDescriptor {
    fn new(
        vaddr: VAddr,
        owner_pagedir: PageDirId,
        writable: bool,
        is_stack: bool,
        file: Option<FileId>,
        offset: u64,
        read_bytes: u32,
        status: PageStatus,
    ) -> PageHandle {
        Arc::new(PageDescriptor {
            vaddr: page_no(vaddr),
            owner_pagedir,
            writable,
            is_stack,
            file,
            offset,
            read_bytes,
            state: Mutex::new(PageState {
                status_frame_swap: Some((status, None, None)),
            }),
            pin: PinLock::new(),
        })
    }

    /// A descriptor backed by a file: present but not yet paged in.
    pub fn new_file(
        vaddr: VAddr,
        owner_pagedir: PageDirId,
        writable: bool,
        file: FileId,
        offset: u64,
        read_bytes: u32,
    ) -> PageHandle {
        Self::new(
            vaddr,
            owner_pagedir,
            writable,
            false,
            Some(file),
            offset,
            read_bytes,
            PageStatus::InFile,
        )
    }

    /// A demand-zero page backed by nothing: the first fault on it just zeroes a frame. Used for
    /// BSS and other anonymous regions that are not the stack.
    pub fn new_zero(vaddr: VAddr, owner_pagedir: PageDirId, writable: bool) -> PageHandle {
        Self::new(
            vaddr,
            owner_pagedir,
            writable,
            false,
            None,
            0,
            0,
            PageStatus::AllZero,
        )
    }

    /// A freshly grown stack page. Created already claiming `InFrame`, mirroring
    /// `userprog/exception.c`'s stack-growth path, which links the new descriptor before the
    /// frame is actually acquired; harmless here because the descriptor is not yet the occupant
    /// of any frame table entry, so the evictor cannot observe the inconsistency.
    pub fn new_stack(vaddr: VAddr, owner_pagedir: PageDirId) -> PageHandle {
        Self::new(
            vaddr,
            owner_pagedir,
            true,
            true,
            None,
            0,
            0,
            PageStatus::InFrame,
        )
    }

    pub fn owner_pagedir(&self) -> PageDirId {
        self.owner_pagedir
    }

    pub fn status(&self) -> PageStatus {
        self.state.lock().status_frame_swap.unwrap().0
    }

    pub fn frame(&self) -> Option<usize> {
        self.state.lock().status_frame_swap.unwrap().1
    }

    pub fn swap_slot(&self) -> Option<SlotId> {
        self.state.lock().status_frame_swap.unwrap().2
    }

    /// Mark the descriptor resident in frame table entry `idx`.
    pub fn set_resident(&self, idx: usize) {
        self.state.lock().status_frame_swap = Some((PageStatus::InFrame, Some(idx), None));
    }

    /// Mark the descriptor evicted into swap slot `slot`.
    pub fn set_evicted(&self, slot: SlotId) {
        self.state.lock().status_frame_swap = Some((PageStatus::InSwap, None, Some(slot)));
    }

    /// Take the pin lock, blocking. Used by teardown, which must wait out any in-flight
    /// eviction rather than skip it.
    pub fn pin(&self) {
        self.pin.lock();
    }

    /// Take the pin lock without blocking. Used by the evictor, which skips a page already
    /// pinned rather than wait for it.
    pub fn try_pin(&self) -> bool {
        self.pin.try_lock()
    }

    pub fn unpin(&self) {
        self.pin.unlock();
    }
}

/// One process's view of its address space: which pages it knows about and where their bytes
/// currently live. Accesses from the owning thread are serialized by the single-threaded nature
/// of that thread (spec §5); the `Mutex` here exists only because a preemptible kernel can
/// migrate that thread across cores mid-access, not because of contention with other processes.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: Mutex<BTreeMap<VAddr, PageHandle>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, vaddr: VAddr) -> Option<PageHandle> {
        self.pages.lock().get(&page_no(vaddr)).cloned()
    }

    pub fn insert(&self, desc: PageHandle) {
        self.pages.lock().insert(desc.vaddr, desc);
    }

    /// Look the page up and pin it, returning whether it existed. Matches
    /// `page_do_not_remove`/`page_allow_remove`'s shape exactly.
    pub fn pin(&self, vaddr: VAddr) -> bool {
        match self.lookup(vaddr) {
            Some(desc) => {
                desc.pin();
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, vaddr: VAddr) -> bool {
        match self.lookup(vaddr) {
            Some(desc) => {
                desc.unpin();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear the table down: every descriptor is pinned (blocking out any eviction already in
    /// flight against it), its frame released and its swap slot freed if it has either, then
    /// dropped. `release_frame` and `free_swap` are callbacks rather than direct dependencies on
    /// `FrameTable`/`SwapArea` so this module does not need to know their generic parameters.
    pub fn destroy(
        &self,
        mut release_frame: impl FnMut(usize),
        mut free_swap: impl FnMut(SlotId),
    ) {
        let mut pages = self.pages.lock();
        for (_, desc) in pages.iter() {
            desc.pin();
            if let Some(idx) = desc.frame() {
                release_frame(idx);
            }
            if let Some(slot) = desc.swap_slot() {
                free_swap(slot);
            }
            desc.unpin();
        }
        pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_before_insert() {
        let t = SupplementalPageTable::new();
        assert!(t.lookup(0x1000).is_none());
    }

    #[test]
    fn insert_then_lookup_ignores_offset_within_page() {
        let t = SupplementalPageTable::new();
        let d = PageDescriptor::new_file(0x4000, PageDirId(1), true, 7, 0, 4096);
        t.insert(d);
        assert!(t.lookup(0x4abc).is_some());
        assert_eq!(t.lookup(0x4abc).unwrap().status(), PageStatus::InFile);
    }

    #[test]
    fn try_pin_fails_while_pinned() {
        let d = PageDescriptor::new_file(0x4000, PageDirId(1), true, 7, 0, 4096);
        d.pin();
        assert!(!d.try_pin());
        d.unpin();
        assert!(d.try_pin());
    }

    #[test]
    fn destroy_invokes_callbacks_and_empties_table() {
        let t = SupplementalPageTable::new();
        let d = PageDescriptor::new_file(0x4000, PageDirId(1), true, 7, 0, 4096);
        d.set_resident(3);
        t.insert(d);
        let mut released = None;
        t.destroy(|idx| released = Some(idx), |_| {});
        assert_eq!(released, Some(3));
        assert!(t.is_empty());
    }
}
