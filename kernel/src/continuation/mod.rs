//! A module for defining continuations and events.

use alloc::{boxed::Box, vec::Vec};

use crate::sched;
use crate::time::SysTime;

/// Different kinds of events a continuation can wait for.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
pub enum EventKind {
    /// Wait for "now" to occur, i.e. don't wait for anything.
    Now,

    /// Wait for keyboard input.
    Keyboard,

    /// Wait for the system clock to reach a given reading.
    Until(SysTime),
}

/// The events corresponding to `EventKind`.
#[derive(Copy, Clone)]
pub enum Event {
    /// It's now!
    Now,

    /// The given character has been typed.
    Keyboard(u8),

    /// A timer has expired.
    Timer,
}

/// The possible results of running a continuation.
#[allow(dead_code)]
pub enum ContResult {
    /// The continuation succeeded; here are the next continuations and the events they wait for.
    Success(Vec<(EventKind, Continuation)>),

    /// The continuation failed; here is the continuation to handle the error.
    Error(Continuation),

    /// The continuation succeeded and there is nothing left to do.
    Done,
}

/// Represents a single task in the system.
pub struct Continuation {
    routine: Option<Box<dyn FnMut(Event) -> ContResult + Send>>,
}

impl Continuation {
    /// Create a new `Continuation` whose entry point is `routine`.
    pub fn new<F>(routine: F) -> Continuation
    where
        F: 'static + Send + FnMut(Event) -> ContResult,
    {
        Continuation {
            routine: Some(Box::new(routine)),
        }
    }

    /// Execute this continuation, enqueue whatever it produces, then cede control to the
    /// scheduler.
    ///
    /// # NOTE
    ///
    /// No funny stuff happens with the stack here, so this is safe to call from most places.
    /// Usually, this will be called just from the scheduler.
    pub fn run(mut self, event: Event) -> ! {
        match (self.routine.take().unwrap())(event) {
            ContResult::Success(conts) => sched::enqueue(conts),
            ContResult::Error(cont) => sched::enqueue(alloc::vec![(EventKind::Now, cont)]),
            ContResult::Done => sched::idle(),
        }

        drop(self);

        sched::sched()
    }
}
