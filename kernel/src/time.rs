//! A module for dealing with system time and the passage of time.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::interrupts::PIT_HZ;

/// Counts timer interrupts. This is the system's only source of time.
static TICKS: AtomicUsize = AtomicUsize::new(0);

/// Opaquely represents a system time.
#[derive(Copy, Clone, Eq, Ord, PartialEq, PartialOrd)]
pub struct SysTime(usize);

impl SysTime {
    /// Get the current system time.
    pub fn now() -> Self {
        SysTime(TICKS.load(Ordering::Relaxed))
    }

    /// Get the time `secs` seconds after `self`.
    pub fn after(&self, secs: usize) -> Self {
        SysTime(self.0 + secs * PIT_HZ)
    }
}

/// Tick the clock atomically.
///
/// # NOTE
///
/// This should only be called from the timer interrupt handler.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}
