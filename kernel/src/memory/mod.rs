//! The memory management subsystem.
//!
//! Beyond the kernel's own paging bootstrap (`paging`) and heap (`heap`), this module owns the
//! virtual memory core that backs *user* address spaces: a per-process supplemental page table
//! (`page`), a global frame pool with clock eviction (`frame`), a swap area (`swap`) and the
//! page-fault resolver that drives them (`fault`). See `vm` for how they fit together.

use bootloader::BootInfo;

use x86_64::structures::idt::InterruptDescriptorTable;

use crate::interrupts::SAVED_KERNEL_RSP_IST_FRAME_INDEX;

pub use self::heap::KernelAllocator;
pub use self::paging::{map_region, VirtualMemoryRegion};

mod heap;
mod paging;
pub mod vm;

/// Initialize memory-related subsystems
pub fn init(allocator: &mut KernelAllocator, boot_info: &'static BootInfo) {
    // Set up a bare-bones heap so we can start initializing everything.
    heap::early::init(allocator);

    // Early paging init... just enough to set up the heap...
    paging::early_init(boot_info);

    // init the heap
    heap::init(
        allocator,
        paging::KERNEL_HEAP_START as usize,
        paging::KERNEL_HEAP_SIZE as usize,
    );

    // Setup paging
    paging::init(boot_info);

    // Bring up the user-space virtual memory core: frame pool and swap area.
    vm::init();
}

/// Initialize the page fault handler entry in the IDT.
pub unsafe fn init_pf_handler(idt: &mut InterruptDescriptorTable) {
    idt.page_fault
        .set_handler_fn(crate::memory::paging::handle_page_fault)
        .set_stack_index(SAVED_KERNEL_RSP_IST_FRAME_INDEX);
}
