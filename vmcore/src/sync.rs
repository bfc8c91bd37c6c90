//! A manual, non-RAII spinlock used for the per-page pin lock.
//!
//! `spin::Mutex` ties unlocking to a guard's `Drop`, which is awkward here: the pin lock is
//! sometimes taken in one call (`SupplementalPageTable::pin`) and released in a later, unrelated
//! call (`unpin`), which no RAII guard can span. PintOS's own `struct lock DNR` is acquired and
//! released the same manual way, so this mirrors that shape instead of fighting it.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct PinLock(AtomicBool);

impl PinLock {
    pub const fn new() -> Self {
        PinLock(AtomicBool::new(false))
    }

    /// Block until the lock is acquired.
    pub fn lock(&self) {
        while self
            .0
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Acquire the lock without blocking. Returns whether it was acquired.
    pub fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for PinLock {
    fn default() -> Self {
        Self::new()
    }
}
