//! The MMU surface the fault resolver and frame evictor drive.
//!
//! Out of scope as a subsystem (spec §1: "the MMU driver ... is an external collaborator"), kept
//! here as the exact four-operation surface spec §6 names: install a mapping, clear one, ask
//! whether one resolves, and the accessed-bit pair the clock algorithm needs.

use crate::types::{PAddr, PageDirId, VAddr};

pub trait Mmu {
    /// Install a mapping from `vaddr` to `paddr` in `pagedir`, with the given writability.
    /// Returns whether the mapping could be installed (PintOS's `pagedir_set_page` can fail if
    /// installing requires a page-table page and the allocator is out of memory).
    fn install(&self, pagedir: PageDirId, vaddr: VAddr, paddr: PAddr, writable: bool) -> bool;

    /// Remove any mapping for `vaddr` in `pagedir`. A no-op if none exists.
    fn clear(&self, pagedir: PageDirId, vaddr: VAddr);

    /// Whether `vaddr` currently resolves to a physical frame in `pagedir`.
    fn resolved(&self, pagedir: PageDirId, vaddr: VAddr) -> bool;

    /// The hardware accessed bit for `vaddr` in `pagedir`.
    fn accessed(&self, pagedir: PageDirId, vaddr: VAddr) -> bool;

    /// Clear the hardware accessed bit for `vaddr` in `pagedir`.
    fn clear_accessed(&self, pagedir: PageDirId, vaddr: VAddr);
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use alloc::collections::BTreeMap;
    use spin::Mutex;

    #[derive(Clone, Copy, Default)]
    struct Entry {
        paddr: PAddr,
        writable: bool,
        accessed: bool,
    }

    /// A software MMU fake: a map from (pagedir, page) to (paddr, accessed bit). Good enough to
    /// exercise the resolver and the clock algorithm without real page tables.
    #[derive(Default)]
    pub struct FakeMmu {
        table: Mutex<BTreeMap<(PageDirId, VAddr), Entry>>,
    }

    impl FakeMmu {
        pub fn new() -> Self {
            FakeMmu {
                table: Mutex::new(BTreeMap::new()),
            }
        }

        /// Simulate a user access, as hardware would on a TLB fill, setting the accessed bit.
        pub fn touch(&self, pagedir: PageDirId, vaddr: VAddr) {
            let mut table = self.table.lock();
            if let Some(e) = table.get_mut(&(pagedir, crate::types::page_no(vaddr))) {
                e.accessed = true;
            }
        }
    }

    impl Mmu for FakeMmu {
        fn install(&self, pagedir: PageDirId, vaddr: VAddr, paddr: PAddr, writable: bool) -> bool {
            let mut table = self.table.lock();
            table.insert(
                (pagedir, crate::types::page_no(vaddr)),
                Entry {
                    paddr,
                    writable,
                    accessed: false,
                },
            );
            true
        }

        fn clear(&self, pagedir: PageDirId, vaddr: VAddr) {
            self.table
                .lock()
                .remove(&(pagedir, crate::types::page_no(vaddr)));
        }

        fn resolved(&self, pagedir: PageDirId, vaddr: VAddr) -> bool {
            self.table
                .lock()
                .contains_key(&(pagedir, crate::types::page_no(vaddr)))
        }

        fn accessed(&self, pagedir: PageDirId, vaddr: VAddr) -> bool {
            self.table
                .lock()
                .get(&(pagedir, crate::types::page_no(vaddr)))
                .map(|e| e.accessed)
                .unwrap_or(false)
        }

        fn clear_accessed(&self, pagedir: PageDirId, vaddr: VAddr) {
            if let Some(e) = self
                .table
                .lock()
                .get_mut(&(pagedir, crate::types::page_no(vaddr)))
            {
                e.accessed = false;
            }
        }
    }
}
