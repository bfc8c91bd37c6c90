//! Errors for the fallible, non-fault-path operations in the vm core.
//!
//! Fault resolution itself never returns `Err`: a page fault either resolves or terminates the
//! faulting process (see `fault::Outcome`). `VmError` is for the narrower set of internal
//! operations — mainly the swap area — that can run out of room and where the caller, not this
//! crate, decides whether that is a panic or a propagated failure.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmError {
    /// The swap area has no free slot left to hold a page.
    SwapExhausted,
    /// The physical frame allocator returned nothing.
    OutOfMemory,
    /// The frame table has no frames at all (misconfiguration).
    NoFrames,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::SwapExhausted => write!(f, "swap area is full"),
            VmError::OutOfMemory => write!(f, "physical frame allocator is out of memory"),
            VmError::NoFrames => write!(f, "frame table was configured with zero frames"),
        }
    }
}
