//! Wires the hardware-agnostic virtual memory core (`vmcore`) to this kernel's real MMU,
//! physical frame pool, a heap-backed stand-in swap device, and the page-fault entry point.
//!
//! This kernel is a single address space (see the `memory` module's top-level doc comment):
//! every task shares the one `RecursivePageTable`, so there is exactly one `PageDirId` and one
//! supplemental page table system-wide, rather than one per process as a multi-address-space
//! kernel would have. `vmcore` itself does not know this: it is written generically against
//! `PageDirId`, keyed tables and a configurable address layout, so porting this kernel to real
//! per-task address spaces later would only mean tracking one `ProcessContext` per task instead
//! of one globally, plus an `Mmu` that switches page directories.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use x86_64::structures::paging::{
    Mapper, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB, UnusedPhysFrame,
};
use x86_64::{PhysAddr, VirtAddr};

use vmcore::block::{BlockDevice, Sector, SECTOR_SIZE};
use vmcore::fault::{self, AddressLayout, FaultInput, Outcome};
use vmcore::frame::FrameTable;
use vmcore::fs::{FilesysLock, Filesystem};
use vmcore::mmu::Mmu;
use vmcore::page::PageDescriptor;
use vmcore::phys::PhysFrames;
use vmcore::swap::SwapArea;
use vmcore::types::{FileId, PAddr, PageDirId, VAddr, PAGE_SIZE};

use super::paging::{PAGE_TABLES, PHYS_MEM_ALLOC, PHYS_SCRATCH_PAGE, RECURSIVE_INDEX};
use crate::process::Process;

/// Single address space: every task's pages live under this one page directory id.
const PAGEDIR: PageDirId = PageDirId(0);

/// How many frames the frame table tracks concurrently. Does not bound how much physical memory
/// exists, only how many user pages may be resident at once before the clock algorithm starts
/// evicting victims; kept small on purpose so eviction is exercised in practice.
const FRAME_POOL_SIZE: usize = 512;

/// Swap slots backing the frame pool.
const SWAP_SLOTS: usize = FRAME_POOL_SIZE * 4;

static FRAMES: Mutex<Option<FrameTable<KernelPhysFrames>>> = Mutex::new(None);
static SWAP: Mutex<Option<SwapArea<HeapBlockDevice>>> = Mutex::new(None);

/// The one running process's virtual memory identity. See `process::Process`'s doc comment for
/// why there is only ever one of these today.
static CURRENT: Mutex<Option<Process>> = Mutex::new(None);

/// Where the (single) user stack lives and how far it may grow. Unlike PintOS's fixed 3GiB/1GiB
/// split, this kernel hands out virtual address ranges from one flat 48-bit space (see
/// `paging`'s layout doc comment), so the stack's top is wherever
/// `sched::user::allocate_user_stack` put it; `register_stack_top` records it once that happens.
/// Until then, faults below any registered page are just rejected as wild accesses.
static LAYOUT: Mutex<Option<AddressLayout>> = Mutex::new(None);

static FILESYS_LOCK: FilesysLockImpl = FilesysLockImpl::new();
static FILESYSTEM: KernelFilesystem = KernelFilesystem;

/// Initialize the frame pool, swap area and supplemental page table. Called once from
/// `memory::init`, after paging is up.
pub fn init() {
    *FRAMES.lock() = Some(FrameTable::new(KernelPhysFrames, FRAME_POOL_SIZE));
    *SWAP.lock() = Some(SwapArea::new(
        HeapBlockDevice::new(SWAP_SLOTS * vmcore::swap::SECTORS_PER_SLOT),
        SWAP_SLOTS,
    ));
    *CURRENT.lock() = Some(Process::new(PAGEDIR));
    printk!(
        "\tvm core inited ({} frames, {} swap slots)\n",
        FRAME_POOL_SIZE,
        SWAP_SLOTS
    );
}

/// Record where the user stack region tops out, so stack-growth faults below it are recognized.
/// Called once by `sched::user::allocate_user_stack`.
pub fn register_stack_top(top: VAddr) {
    *LAYOUT.lock() = Some(AddressLayout {
        user_top: top,
        stack_fault_window: fault::STACK_FAULT_WINDOW,
        stack_page_limit: fault::STACK_PAGE_LIMIT,
    });
}

/// Register `[start, start+len)` as demand-zero and `writable`, to be paged in lazily on first
/// touch. Called by `paging::map_region`.
pub fn register_demand_zero_region(start: u64, len: u64, writable: bool) {
    let current = CURRENT.lock();
    let current = current.as_ref().expect("vm core not initialized");
    let mut addr = start;
    while addr < start + len {
        current
            .sup
            .insert(PageDescriptor::new_zero(addr, PAGEDIR, writable));
        addr += PAGE_SIZE as u64;
    }
}

/// Route a page fault through the resolver. `esp` is the faulting task's stack pointer at the
/// time of the fault (needed to recognize legitimate stack growth); `write` is whether the fault
/// was caused by a write.
///
/// This kernel does not yet track per-task filesystem lock ownership across a fault (there is
/// only one runnable task at a time and it never holds the lock across a fault today), so
/// `held_filesys_lock` is always `false`.
pub fn handle_fault(fault_addr: VAddr, esp: VAddr, write: bool) -> Outcome {
    let input = FaultInput {
        fault_addr,
        esp,
        write,
    };
    let layout = LAYOUT.lock().unwrap_or_else(AddressLayout::pintos_default);

    let mut current_guard = CURRENT.lock();
    let current = current_guard.as_mut().expect("vm core not initialized");
    let sup = &current.sup;
    let ctx = &mut current.ctx;
    let frames_guard = FRAMES.lock();
    let frames = frames_guard.as_ref().expect("vm core not initialized");
    let swap_guard = SWAP.lock();
    let swap = swap_guard.as_ref().expect("vm core not initialized");

    fault::handle_page_fault(
        &input,
        &layout,
        sup,
        ctx,
        frames,
        swap,
        &X86Mmu,
        &FILESYSTEM,
        &FILESYS_LOCK,
        false,
    )
}

////////////////////////////////////////////////////////////////////////////////
// Mmu
////////////////////////////////////////////////////////////////////////////////

/// The real MMU, backed by the recursively-mapped page tables `paging` maintains.
pub struct X86Mmu;

fn recursive_index() -> x86_64::structures::paging::PageTableIndex {
    RECURSIVE_INDEX.lock().expect("recursive index not set")
}

/// Get the page-table entry that would map `page`, via the recursive mapping slot. Only valid to
/// call when `page`'s own page table is already present, which holds at every call site here:
/// `accessed`/`clear_accessed` are only ever asked about frames the clock algorithm is currently
/// scanning, and those are by definition mapped.
unsafe fn pte_for(page: Page<Size4KiB>) -> &'static mut x86_64::structures::paging::PageTableEntry {
    let pt_page = Page::<Size4KiB>::from_page_table_indices(
        recursive_index(),
        page.p4_index(),
        page.p3_index(),
        page.p2_index(),
    );
    let pt = &mut *(pt_page.start_address().as_mut_ptr::<PageTable>());
    &mut pt[page.p1_index()]
}

impl Mmu for X86Mmu {
    fn install(&self, _pagedir: PageDirId, vaddr: VAddr, paddr: PAddr, writable: bool) -> bool {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(vaddr));
        let frame = match PhysFrame::from_start_address(PhysAddr::new(paddr)) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        let mut page_tables = PAGE_TABLES.lock();
        let mut phys_alloc = PHYS_MEM_ALLOC.lock();
        let result = unsafe {
            page_tables.as_mut().unwrap().map_to(
                page,
                UnusedPhysFrame::new(frame),
                flags,
                phys_alloc.as_mut().unwrap(),
            )
        };
        match result {
            Ok(flush) => {
                flush.flush();
                true
            }
            Err(_) => false,
        }
    }

    fn clear(&self, _pagedir: PageDirId, vaddr: VAddr) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(vaddr));
        if let Ok((_, flush)) = PAGE_TABLES.lock().as_mut().unwrap().unmap(page) {
            flush.flush();
        }
    }

    fn resolved(&self, _pagedir: PageDirId, vaddr: VAddr) -> bool {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(vaddr));
        PAGE_TABLES
            .lock()
            .as_mut()
            .unwrap()
            .translate_page(page)
            .is_ok()
    }

    fn accessed(&self, _pagedir: PageDirId, vaddr: VAddr) -> bool {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(vaddr));
        let _page_tables = PAGE_TABLES.lock();
        unsafe { pte_for(page).flags().contains(PageTableFlags::ACCESSED) }
    }

    fn clear_accessed(&self, _pagedir: PageDirId, vaddr: VAddr) {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(vaddr));
        let _page_tables = PAGE_TABLES.lock();
        unsafe {
            let entry = pte_for(page);
            let flags = entry.flags();
            entry.set_flags(flags - PageTableFlags::ACCESSED);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// PhysFrames
////////////////////////////////////////////////////////////////////////////////

/// Serializes use of the one scratch virtual page `KernelPhysFrames` temporarily maps a physical
/// frame into. This kernel has no linear mapping of all physical memory, so reading or writing
/// an arbitrary frame's bytes means borrowing this page for the duration.
static SCRATCH_LOCK: Mutex<()> = Mutex::new(());

fn with_scratch_mapped(paddr: PAddr, f: impl FnOnce(*mut u8)) {
    let _guard = SCRATCH_LOCK.lock();
    let page = Page::<Size4KiB>::containing_address(VirtAddr::new(PHYS_SCRATCH_PAGE));
    let frame = PhysFrame::from_start_address(PhysAddr::new(paddr)).expect("unaligned physical frame");

    {
        let mut page_tables = PAGE_TABLES.lock();
        let mut phys_alloc = PHYS_MEM_ALLOC.lock();
        unsafe {
            page_tables
                .as_mut()
                .unwrap()
                .map_to(
                    page,
                    UnusedPhysFrame::new(frame),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                    phys_alloc.as_mut().unwrap(),
                )
                .expect("failed to map scratch page")
                .flush();
        }
    }

    f(page.start_address().as_mut_ptr::<u8>());

    let (_, flush) = PAGE_TABLES
        .lock()
        .as_mut()
        .unwrap()
        .unmap(page)
        .expect("failed to unmap scratch page");
    flush.flush();
}

/// The physical frame source the frame table draws from, wrapping `paging`'s buddy allocator and
/// the scratch-page trick above for direct byte access.
pub struct KernelPhysFrames;

impl PhysFrames for KernelPhysFrames {
    fn alloc_user_page(&mut self, zeroed: bool) -> Option<PAddr> {
        let frame = PHYS_MEM_ALLOC.lock().as_mut().unwrap().allocate_frame()?;
        let paddr = frame.frame().start_address().as_u64();
        if zeroed {
            self.zero_page(paddr);
        }
        Some(paddr)
    }

    fn free_user_page(&mut self, paddr: PAddr) {
        PHYS_MEM_ALLOC.lock().as_mut().unwrap().free_frame(paddr);
    }

    fn zero_page(&mut self, paddr: PAddr) {
        with_scratch_mapped(paddr, |ptr| unsafe {
            core::ptr::write_bytes(ptr, 0, PAGE_SIZE);
        });
    }

    fn read_page(&self, paddr: PAddr, buf: &mut [u8]) {
        with_scratch_mapped(paddr, |ptr| unsafe {
            core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), PAGE_SIZE);
        });
    }

    fn write_page(&mut self, paddr: PAddr, buf: &[u8]) {
        with_scratch_mapped(paddr, |ptr| unsafe {
            core::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, PAGE_SIZE);
        });
    }
}

////////////////////////////////////////////////////////////////////////////////
// BlockDevice / Filesystem / FilesysLock
////////////////////////////////////////////////////////////////////////////////

/// A `BlockDevice` backed by kernel heap memory rather than a real disk. This kernel has no disk
/// driver at all (see `interrupts::pic`'s IDE entry, a no-op), and the swap block device is
/// explicitly out of scope as a subsystem; this is the simplest concrete stand-in that actually
/// round-trips bytes for the eviction path to exercise.
pub struct HeapBlockDevice {
    sectors: Vec<Sector>,
}

impl HeapBlockDevice {
    fn new(sector_count: usize) -> Self {
        HeapBlockDevice {
            sectors: vec![[0u8; SECTOR_SIZE]; sector_count],
        }
    }
}

impl BlockDevice for HeapBlockDevice {
    fn read_sector(&self, sector: u64, buf: &mut Sector) {
        buf.copy_from_slice(&self.sectors[sector as usize]);
    }

    fn write_sector(&mut self, sector: u64, buf: &Sector) {
        // A write to the first sector of a slot only ever happens from `SwapArea::insert`, which
        // only the clock's eviction path calls (`FrameTable::evict_one`) — trace it at the
        // granularity of "a page got evicted", not one line per 512-byte sector.
        if sector % vmcore::swap::SECTORS_PER_SLOT as u64 == 0 {
            printk!("\tevicting a frame to swap slot {}\n", sector / vmcore::swap::SECTORS_PER_SLOT as u64);
        }
        self.sectors[sector as usize].copy_from_slice(buf);
    }
}

/// No executable file is loaded yet (`sched::user::load_user_code_section` is still a stub that
/// writes test instructions directly rather than reading an ELF), so this never actually gets a
/// read; it exists so the resolver has a real `Filesystem` to run against once a loader lands.
pub struct KernelFilesystem;

impl Filesystem for KernelFilesystem {
    fn read_at(&self, _file: FileId, _buf: &mut [u8], _offset: u64) -> usize {
        0
    }
}

/// A manual acquire/release lock, in the same spirit as `vmcore`'s internal pin lock: the fault
/// resolver releases the filesystem lock in one call and reacquires it in a later one, which no
/// RAII guard can span.
struct FilesysLockImpl(AtomicBool);

impl FilesysLockImpl {
    const fn new() -> Self {
        FilesysLockImpl(AtomicBool::new(false))
    }
}

impl FilesysLock for FilesysLockImpl {
    fn acquire(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::sync::atomic::spin_loop_hint();
        }
    }

    fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}
