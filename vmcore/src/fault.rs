//! The page-fault resolver: the state machine in spec §4.4 that turns a raw fault into either a
//! resolved mapping or a decision to kill the faulting process.
//!
//! Grounded on `userprog/exception.c`'s `page_fault` handler. Two paths: the fault address has an
//! existing supplemental-table descriptor (bring it in from wherever it lives), or it doesn't
//! (maybe it's legitimate stack growth).

use crate::block::BlockDevice;
use crate::error::VmError;
use crate::fs::{FilesysLock, Filesystem};
use crate::frame::FrameTable;
use crate::mmu::Mmu;
use crate::page::{PageDescriptor, PageHandle, PageStatus};
use crate::phys::PhysFrames;
use crate::process::ProcessContext;
use crate::swap::SwapArea;
use crate::types::{page_no, VAddr, PAGE_SIZE};

/// How far from `esp` a faulting address may be and still be treated as a `PUSH`/`PUSHA`
/// touching not-yet-mapped stack, per `userprog/exception.c`.
pub const STACK_FAULT_WINDOW: u64 = 32;

/// The largest a process's stack is allowed to grow to, in pages (8 MiB at 4 KiB pages).
pub const STACK_PAGE_LIMIT: usize = 2048;

/// Where user address space ends and kernel address space begins, plus the derived stack-growth
/// bounds. Out-of-process configuration, since it depends on the address space layout the MMU
/// implementation actually uses.
#[derive(Clone, Copy)]
pub struct AddressLayout {
    pub user_top: VAddr,
    pub stack_fault_window: u64,
    pub stack_page_limit: usize,
}

impl AddressLayout {
    /// The layout `userprog/exception.c` assumes: a 3 GiB/1 GiB user/kernel split.
    pub fn pintos_default() -> Self {
        AddressLayout {
            user_top: 0xc000_0000,
            stack_fault_window: STACK_FAULT_WINDOW,
            stack_page_limit: STACK_PAGE_LIMIT,
        }
    }
}

pub struct FaultInput {
    pub fault_addr: VAddr,
    pub esp: VAddr,
    pub write: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
    /// The fault was resolved; the faulting instruction may be retried.
    Resolved,
    /// The fault could not be resolved; the faulting process must be terminated.
    Terminate,
}

/// Resolve a page fault. `held_filesys_lock` records whether the faulting thread already held
/// the filesystem lock when the fault happened (spec §5: the resolver must release it before
/// doing anything that can itself fault or block, and reacquire it before returning).
pub fn handle_page_fault<F, B, M, FS>(
    input: &FaultInput,
    layout: &AddressLayout,
    sup: &crate::page::SupplementalPageTable,
    ctx: &mut ProcessContext,
    frames: &FrameTable<F>,
    swap: &SwapArea<B>,
    mmu: &M,
    fs: &FS,
    filesys_lock: &impl FilesysLock,
    held_filesys_lock: bool,
) -> Outcome
where
    F: PhysFrames,
    B: BlockDevice,
    M: Mmu,
    FS: Filesystem,
{
    if held_filesys_lock {
        filesys_lock.release();
    }

    let outcome = resolve(input, layout, sup, ctx, frames, swap, mmu, fs, filesys_lock);

    if held_filesys_lock {
        filesys_lock.acquire();
    }

    outcome
}

fn resolve<F, B, M, FS>(
    input: &FaultInput,
    layout: &AddressLayout,
    sup: &crate::page::SupplementalPageTable,
    ctx: &mut ProcessContext,
    frames: &FrameTable<F>,
    swap: &SwapArea<B>,
    mmu: &M,
    fs: &FS,
    filesys_lock: &impl FilesysLock,
) -> Outcome
where
    F: PhysFrames,
    B: BlockDevice,
    M: Mmu,
    FS: Filesystem,
{
    let fa = input.fault_addr;
    if fa == 0 || fa >= layout.user_top {
        return Outcome::Terminate;
    }

    match sup.lookup(fa) {
        Some(desc) => materialize(desc, frames, swap, mmu, fs, filesys_lock),
        None => grow_stack(input, layout, sup, ctx, frames, swap, mmu),
    }
}

/// Bring an existing descriptor's page into a frame and install the mapping, or report that it
/// cannot be resolved. Covers the `IN_FILE`, `IN_SWAP` and `ALL_ZERO` legs of spec §4.4's state
/// machine unconditionally, regardless of whether the fault was a read or a write: a page not yet
/// resident is never a rights violation, only a fault that must be serviced. `IN_FRAME` means the
/// mapping already exists, so a fault reaching it at all means the access violated the mapping's
/// own permissions (e.g. a write to a page installed read-only) — that's the only rights-violation
/// case, and it needs no `write` flag to detect.
fn materialize<F, B, M, FS>(
    desc: PageHandle,
    frames: &FrameTable<F>,
    swap: &SwapArea<B>,
    mmu: &M,
    fs: &FS,
    filesys_lock: &impl FilesysLock,
) -> Outcome
where
    F: PhysFrames,
    B: BlockDevice,
    M: Mmu,
    FS: Filesystem,
{
    match desc.status() {
        PageStatus::InFrame => Outcome::Terminate,
        PageStatus::AllZero => {
            desc.pin();
            let result = (|| -> Result<usize, VmError> {
                let idx = frames.acquire(desc.clone(), swap, mmu)?;
                frames.zero_frame(idx);
                Ok(idx)
            })();
            finish_materialize(desc, result, frames, mmu)
        }
        PageStatus::InFile => {
            desc.pin();
            let result = (|| -> Result<usize, VmError> {
                let idx = frames.acquire(desc.clone(), swap, mmu)?;
                let mut buf = [0u8; PAGE_SIZE];
                let read_bytes = desc.read_bytes as usize;
                filesys_lock.acquire();
                let got = fs.read_at(desc.file.expect("InFile descriptor without a file"), &mut buf[..read_bytes], desc.offset);
                filesys_lock.release();
                if got != read_bytes {
                    frames.release(idx, mmu);
                    return Err(VmError::OutOfMemory);
                }
                frames.write_frame(idx, &buf);
                Ok(idx)
            })();
            finish_materialize(desc, result, frames, mmu)
        }
        PageStatus::InSwap => {
            desc.pin();
            let result = (|| -> Result<usize, VmError> {
                let slot = desc.swap_slot().expect("InSwap descriptor without a slot");
                let idx = frames.acquire(desc.clone(), swap, mmu)?;
                let mut buf = [0u8; PAGE_SIZE];
                swap.load(slot, &mut buf);
                frames.write_frame(idx, &buf);
                Ok(idx)
            })();
            finish_materialize(desc, result, frames, mmu)
        }
    }
}

fn finish_materialize<F: PhysFrames, M: Mmu>(
    desc: PageHandle,
    result: Result<usize, VmError>,
    frames: &FrameTable<F>,
    mmu: &M,
) -> Outcome {
    let idx = match result {
        Ok(idx) => idx,
        Err(_) => {
            desc.unpin();
            return Outcome::Terminate;
        }
    };
    let paddr = frames.paddr_of(idx);
    if !mmu.install(desc.owner_pagedir(), desc.vaddr, paddr, desc.writable) {
        frames.release(idx, mmu);
        desc.unpin();
        return Outcome::Terminate;
    }
    desc.set_resident(idx);
    desc.unpin();
    Outcome::Resolved
}

/// Handle a fault against an address with no supplemental-table entry: either legitimate stack
/// growth, or a wild access to be rejected. Grounded on `userprog/exception.c`'s stack-growth
/// branch, with one correction spec.md calls out explicitly: the newly-created descriptor (not
/// whatever descriptor happened to be looked up, which here is none) is the one linked to the
/// acquired frame.
fn grow_stack<F, B, M>(
    input: &FaultInput,
    layout: &AddressLayout,
    sup: &crate::page::SupplementalPageTable,
    ctx: &mut ProcessContext,
    frames: &FrameTable<F>,
    swap: &SwapArea<B>,
    mmu: &M,
) -> Outcome
where
    F: PhysFrames,
    B: BlockDevice,
    M: Mmu,
{
    let fa = input.fault_addr;
    let stack_limit_bytes = (layout.stack_page_limit as u64) * (PAGE_SIZE as u64);

    let in_stack_range = fa < layout.user_top && fa >= layout.user_top.saturating_sub(stack_limit_bytes);
    let near_esp = fa >= input.esp.saturating_sub(layout.stack_fault_window)
        && fa <= input.esp.saturating_add(layout.stack_fault_window);
    if !(in_stack_range && near_esp) {
        return Outcome::Terminate;
    }

    let current_stack = layout.user_top - (ctx.stack_pages as u64) * (PAGE_SIZE as u64);
    let mut addr = page_no(fa);

    while addr < current_stack {
        if ctx.stack_pages >= layout.stack_page_limit {
            return Outcome::Terminate;
        }

        let desc = PageDescriptor::new_stack(addr, ctx.pagedir);
        sup.insert(desc.clone());
        ctx.stack_pages += 1;

        desc.pin();
        let idx = match frames.acquire(desc.clone(), swap, mmu) {
            Ok(idx) => idx,
            Err(e) => panic!("out of frames while growing the stack: {}", e),
        };
        frames.zero_frame(idx);
        let paddr = frames.paddr_of(idx);
        if !mmu.install(ctx.pagedir, addr, paddr, true) {
            panic!("failed to install mapping for newly grown stack page");
        }
        desc.set_resident(idx);
        desc.unpin();

        addr += PAGE_SIZE as u64;
    }

    Outcome::Resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::RamBlockDevice;
    use crate::fs::test_support::{NullFilesysLock, RamFile, RamFilesystem};
    use crate::mmu::test_support::FakeMmu;
    use crate::page::SupplementalPageTable;
    use crate::phys::test_support::RamFrames;
    use crate::types::PageDirId;

    struct Harness {
        sup: SupplementalPageTable,
        ctx: ProcessContext,
        frames: FrameTable<RamFrames>,
        swap: SwapArea<RamBlockDevice>,
        mmu: FakeMmu,
        fs: RamFilesystem,
        lock: NullFilesysLock,
        layout: AddressLayout,
    }

    impl Harness {
        fn new(frame_count: usize, file_bytes: &[u8]) -> Self {
            Harness {
                sup: SupplementalPageTable::new(),
                ctx: ProcessContext::new(PageDirId(1)),
                frames: FrameTable::new(RamFrames::new(frame_count), frame_count),
                swap: SwapArea::new(RamBlockDevice::new(64), 8),
                mmu: FakeMmu::new(),
                fs: RamFilesystem {
                    file: RamFile {
                        contents: file_bytes.to_vec(),
                    },
                },
                lock: NullFilesysLock::default(),
                layout: AddressLayout::pintos_default(),
            }
        }

        fn fault(&mut self, fault_addr: VAddr, esp: VAddr, write: bool) -> Outcome {
            let input = FaultInput {
                fault_addr,
                esp,
                write,
            };
            handle_page_fault(
                &input,
                &self.layout,
                &self.sup,
                &mut self.ctx,
                &self.frames,
                &self.swap,
                &self.mmu,
                &self.fs,
                &self.lock,
                false,
            )
        }
    }

    #[test]
    fn cold_demand_load_from_file() {
        let mut h = Harness::new(2, b"hello, page!");
        let desc = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 12);
        h.sup.insert(desc);
        assert_eq!(h.fault(0x2000, 0xbffffffc, false), Outcome::Resolved);
        assert!(h.mmu.resolved(PageDirId(1), 0x2000));
    }

    #[test]
    fn partial_page_load_zero_fills_the_rest() {
        let contents = [0xAAu8; 10];
        let mut h = Harness::new(2, &contents);
        let desc = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 10);
        h.sup.insert(desc);
        assert_eq!(h.fault(0x2000, 0xbffffffc, false), Outcome::Resolved);
    }

    #[test]
    fn stack_growth_maps_one_page() {
        let mut h = Harness::new(2, b"");
        let esp = h.layout.user_top - 4;
        assert_eq!(h.fault(esp, esp, true), Outcome::Resolved);
        assert_eq!(h.ctx.stack_pages, 1);
        assert!(h.mmu.resolved(PageDirId(1), page_no(esp)));
    }

    #[test]
    fn wild_access_far_below_stack_is_rejected() {
        let mut h = Harness::new(2, b"");
        assert_eq!(
            h.fault(0x1000_0000, 0xbfff_f000, false),
            Outcome::Terminate
        );
    }

    #[test]
    fn access_far_from_esp_is_rejected() {
        let mut h = Harness::new(2, b"");
        let esp = h.layout.user_top - 0x1000;
        let fa = esp - 0x1000; // a full page below esp, well outside the 32-byte window
        assert_eq!(h.fault(fa, esp, false), Outcome::Terminate);
    }

    #[test]
    fn forced_eviction_makes_room_for_a_new_page() {
        let mut h = Harness::new(1, b"AAAA");
        let a = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(a);
        assert_eq!(h.fault(0x2000, 0xbffffffc, false), Outcome::Resolved);

        let b = PageDescriptor::new_file(0x3000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(b);
        assert_eq!(h.fault(0x3000, 0xbffffffc, false), Outcome::Resolved);

        // only one frame exists; bringing in `b` must have evicted `a`.
        assert!(!h.mmu.resolved(PageDirId(1), 0x2000));
        assert!(h.mmu.resolved(PageDirId(1), 0x3000));
    }

    #[test]
    fn teardown_frees_a_swapped_out_page() {
        let mut h = Harness::new(1, b"AAAA");
        let a = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(a);
        h.fault(0x2000, 0xbffffffc, false);
        let b = PageDescriptor::new_file(0x3000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(b);
        h.fault(0x3000, 0xbffffffc, false); // evicts `a` into swap

        let frames = &h.frames;
        let mmu = &h.mmu;
        h.sup.destroy(|idx| frames.release(idx, mmu), |slot| h.swap.free(slot));
        assert!(h.sup.is_empty());
    }

    #[test]
    fn first_touch_write_to_read_only_page_still_resolves() {
        // Bringing a never-resident page in must not be gated on the access that faulted it in;
        // only a fault against an already-resident mapping can be a rights violation.
        let mut h = Harness::new(2, b"AAAA");
        let desc = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(desc);
        assert_eq!(h.fault(0x2000, 0xbffffffc, true), Outcome::Resolved);
    }

    #[test]
    fn write_to_resident_read_only_page_is_rejected() {
        let mut h = Harness::new(2, b"AAAA");
        let desc = PageDescriptor::new_file(0x2000, PageDirId(1), false, 1, 0, 4);
        h.sup.insert(desc);
        // First touch brings the page in and installs the read-only mapping.
        assert_eq!(h.fault(0x2000, 0xbffffffc, false), Outcome::Resolved);
        // A second fault against the now-resident page is a rights violation.
        assert_eq!(h.fault(0x2000, 0xbffffffc, true), Outcome::Terminate);
    }
}
