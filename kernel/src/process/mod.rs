//! Minimal process identity for the virtual memory core to hang page faults off of.
//!
//! The thread/trap layer is out of scope here (see `memory::vm`'s doc comment), but the fault
//! resolver still needs *something* to call "the current process": which page directory it runs
//! under, its supplemental page table, and how tall its stack currently is. `sched`'s
//! continuation-based scheduler never modeled more than one address space, so today there is
//! exactly one `Process`, constructed once in `memory::vm::init`. Nothing here assumes that;
//! a real multi-task scheduler would keep one of these per task instead of one globally.

use vmcore::page::SupplementalPageTable;
use vmcore::process::ProcessContext;
use vmcore::types::PageDirId;

/// A process's virtual memory identity: owning page directory, supplemental page table, and
/// fault-relevant context (currently just the stack height the clock/stack-growth logic tracks).
pub struct Process {
    pub pagedir: PageDirId,
    pub sup: SupplementalPageTable,
    pub ctx: ProcessContext,
}

impl Process {
    pub fn new(pagedir: PageDirId) -> Self {
        Process {
            pagedir,
            sup: SupplementalPageTable::new(),
            ctx: ProcessContext::new(pagedir),
        }
    }
}

/// Terminate the current process on an unrecoverable user-space fault (access to memory with no
/// legitimate resident/zero/swap/file/growth interpretation).
///
/// The real shape of this operation is "tear down the faulting thread's continuation and let
/// `sched` schedule something else" — but `sched` only ever runs one continuation chain to
/// completion and has no mechanism to kill one task out from under the others. Until it does,
/// this is the kernel's only option. Callers should still go through this function rather than
/// panicking inline, so the call site here is the one to change once `sched` grows that ability.
pub fn terminate(reason: &str) -> ! {
    panic!("process terminated: {}", reason);
}
