//! The (cooperative, continuation-based) scheduler.
//!
//! Tasks are `Continuation`s. A runnable task is popped and run to completion (which, in this
//! model, means it never "returns" in the usual sense — `Continuation::run` always ends by
//! calling back into the scheduler). A task that is not yet runnable waits on an `EventKind`;
//! each trip through `sched()` polls the waiting list and promotes anything whose precondition
//! now holds.
//!
//! Because `run` always calls back into `sched()`, and `sched()` always hands off to the next
//! task's `run`, naively doing this in plain Rust would recurse one native stack frame deeper on
//! every single task switch — harmless for a handful of switches, fatal for a long-running
//! system. Every core here is single-threaded, so only one task is ever actually executing; we
//! exploit that by keeping two stacks (the one in use, and a clean spare) and resetting `%rsp`
//! before calling into the next task, the same way `sched_part_2_thunk` does below. The old stack
//! is then cleared and becomes the next switch's clean spare.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::borrow::Borrow;
use core::mem;

use spin::Mutex;

use crate::continuation::{Continuation, Event, EventKind};
use crate::time::SysTime;

pub mod user;

/// The size of a task's stack, in words.
const STACK_WORDS: usize = 1 << 12; // 16KB

struct Waiting {
    until: EventKind,
    cont: Continuation,
}

/// A stack for running continuations on. Only one task ever runs at a time, so rather than clear
/// the current stack out from under itself, we switch to a spare clean one and clear the old one
/// once we're safely off of it.
struct Stack(Box<[usize; STACK_WORDS]>);

impl Stack {
    fn new() -> Self {
        Stack(box [0; STACK_WORDS]) // initialize in place
    }

    /// The `%rsp` to start a task at: near the bottom (highest address) of the stack, with a
    /// little padding in case a bug causes us to unwind too far.
    fn first_rsp(&self) -> usize {
        const PADDING: usize = 400; // words

        let stack: &[usize; STACK_WORDS] = self.0.borrow();
        let bottom = stack.as_ptr();
        unsafe { bottom.add(STACK_WORDS - PADDING) as usize }
    }

    /// Clear the contents of this stack.
    fn clear(&mut self) {
        for word in self.0.iter_mut() {
            *word = 0xDEADBEEF_DEADBEEF;
        }
    }
}

struct Scheduler {
    runnable: Vec<(Continuation, Event)>,
    waiting: Vec<Waiting>,

    /// The stack of the task currently executing (or about to execute, during a switch).
    current_stack: Stack,

    /// A clean stack, ready for whichever task runs next.
    clean_stack: Stack,
}

static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

/// Initialize the scheduler with the first continuation to run.
pub fn init(first: Continuation) {
    *SCHEDULER.lock() = Some(Scheduler {
        runnable: alloc::vec![(first, Event::Now)],
        waiting: Vec::new(),
        current_stack: Stack::new(),
        clean_stack: Stack::new(),
    });
}

/// Start running tasks. Never returns.
pub fn start() -> ! {
    sched()
}

/// Move any waiting task whose precondition now holds onto the runnable list. Called with the
/// scheduler already locked.
fn promote_ready(scheduler: &mut Scheduler) {
    let waiting = mem::replace(&mut scheduler.waiting, Vec::new());

    let mut still_waiting = Vec::new();
    for w in waiting {
        match w.until {
            EventKind::Now => scheduler.runnable.push((w.cont, Event::Now)),
            EventKind::Until(t) => {
                if SysTime::now() >= t {
                    scheduler.runnable.push((w.cont, Event::Timer));
                } else {
                    still_waiting.push(w);
                }
            }
            EventKind::Keyboard => {
                if let Some(c) = crate::io::kbd::kbd_next() {
                    scheduler.runnable.push((w.cont, Event::Keyboard(c)));
                } else {
                    still_waiting.push(w);
                }
            }
        }
    }
    scheduler.waiting = still_waiting;
}

/// Run the scheduler: pick a runnable task and hand control to it. Never returns; the chosen
/// task's own `Continuation::run` calls back in here once it finishes.
///
/// Switches to the clean spare stack before doing anything else, via `sched_part_2_thunk`, so
/// that repeated task switches reset the native call stack each time instead of growing it.
pub fn sched() -> ! {
    let rsp = {
        let mut s = SCHEDULER.lock();
        let scheduler = s.as_mut().unwrap();

        // Make the clean stack the current stack.
        mem::swap(&mut scheduler.current_stack, &mut scheduler.clean_stack);

        scheduler.current_stack.first_rsp()

        // Lock dropped, borrows end, etc. when we call `sched_part_2_thunk`.
    };

    unsafe {
        sched_part_2_thunk(rsp);
    }
}

/// Part 2 of `sched`. Actually switches to the new stack, then calls `sched_part_3`, having
/// already switched. This is its own function so the compiler knows no state from before the
/// switch can be carried over — we cannot accidentally keep using stack slots (e.g. locks) that
/// belong to the stack we just abandoned.
unsafe fn sched_part_2_thunk(rsp: usize) -> ! {
    asm! {
        "
        movq $0, %rsp
        movq $0, %rbp
        "
         : /* no outputs */
         : "r"(rsp)
         : "rbp", "rsp"
         : "volatile"
    };
    sched_part_3();
}

/// Now that we're running on the new stack, clean the old one, then pick and run the next task.
unsafe fn sched_part_3() -> ! {
    let next = {
        let mut s = SCHEDULER.lock();
        let scheduler = s.as_mut().unwrap();

        // Clean the stack we just switched off of.
        scheduler.clean_stack.clear();

        promote_ready(scheduler);
        scheduler.runnable.pop()

        // Lock dropped, borrows end, etc. when we call `cont.run`.
    };

    if let Some((cont, event)) = next {
        cont.run(event);
    }

    // Nothing runnable yet; wait for the next interrupt (timer or keyboard) to make something
    // ready, then go round again.
    x86_64::instructions::hlt();
    sched();
}

/// Enqueue continuations to wait on the given events.
pub fn enqueue(conts: Vec<(EventKind, Continuation)>) {
    let mut s = SCHEDULER.lock();
    let scheduler = s.as_mut().unwrap();
    for (until, cont) in conts {
        scheduler.waiting.push(Waiting { until, cont });
    }
}

/// Enqueue the idle task: a continuation that immediately finishes and re-idles, keeping the
/// scheduler fed with something runnable until real work shows up.
pub fn idle() {
    enqueue(alloc::vec![(
        EventKind::Now,
        Continuation::new(|_| crate::continuation::ContResult::Done)
    )]);
}
