//! The swap area: a bitmap of fixed-size slots on a block device, each slot holding one page's
//! worth of bytes across `SECTORS_PER_SLOT` sectors.
//!
//! Grounded on `vm/swap.c`. Deliberately knows nothing about pages or frames — it just moves
//! `PAGE_SIZE`-byte buffers to and from numbered slots — so the frame table's eviction path and
//! the fault resolver are the ones responsible for copying bytes between a frame and a buffer
//! around calls to `insert`/`load`.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::{BlockDevice, SECTOR_SIZE};
use crate::error::VmError;
use crate::types::{PAGE_SIZE, SlotId};

pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

struct Inner<B: BlockDevice> {
    device: B,
    used: Vec<bool>,
}

/// All three operations are serialized under a single internal lock, per spec §5: the swap area
/// is simple enough that per-slot locking would not pay for itself at this scale.
pub struct SwapArea<B: BlockDevice> {
    inner: Mutex<Inner<B>>,
}

impl<B: BlockDevice> SwapArea<B> {
    pub fn new(device: B, slot_count: usize) -> Self {
        SwapArea {
            inner: Mutex::new(Inner {
                device,
                used: vec![false; slot_count],
            }),
        }
    }

    /// Write `content` (one page's worth of bytes) into a free slot, returning its id.
    pub fn insert(&self, content: &[u8]) -> Result<SlotId, VmError> {
        debug_assert_eq!(content.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        let idx = inner
            .used
            .iter()
            .position(|used| !used)
            .ok_or(VmError::SwapExhausted)?;
        inner.used[idx] = true;
        let mut sector = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_SLOT {
            sector.copy_from_slice(&content[s * SECTOR_SIZE..(s + 1) * SECTOR_SIZE]);
            let sector_no = (idx * SECTORS_PER_SLOT + s) as u64;
            inner.device.write_sector(sector_no, &sector);
        }
        Ok(SlotId(idx))
    }

    /// Read a slot's bytes into `out` and free the slot.
    pub fn load(&self, slot: SlotId, out: &mut [u8]) {
        debug_assert_eq!(out.len(), PAGE_SIZE);
        let mut inner = self.inner.lock();
        assert!(
            inner.used[slot.0],
            "swap: load() on slot {} that was not in use",
            slot.0
        );
        let mut sector = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_SLOT {
            let sector_no = (slot.0 * SECTORS_PER_SLOT + s) as u64;
            inner.device.read_sector(sector_no, &mut sector);
            out[s * SECTOR_SIZE..(s + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        inner.used[slot.0] = false;
    }

    /// Free a slot without reading it back, for a page whose swapped-out copy is being
    /// discarded (teardown of a process that was never faulted back in for that page).
    pub fn free(&self, slot: SlotId) {
        let mut inner = self.inner.lock();
        assert!(
            inner.used[slot.0],
            "swap: free() on slot {} that was not in use",
            slot.0
        );
        inner.used[slot.0] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_support::RamBlockDevice;

    fn area(slots: usize) -> SwapArea<RamBlockDevice> {
        SwapArea::new(RamBlockDevice::new((slots * SECTORS_PER_SLOT) as u64), slots)
    }

    #[test]
    fn round_trips_content() {
        let a = area(4);
        let mut page = [0u8; PAGE_SIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let slot = a.insert(&page).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        a.load(slot, &mut out);
        assert_eq!(&page[..], &out[..]);
    }

    #[test]
    fn load_frees_the_slot_for_reuse() {
        let a = area(1);
        let slot = a.insert(&[7u8; PAGE_SIZE]).unwrap();
        let mut out = [0u8; PAGE_SIZE];
        a.load(slot, &mut out);
        assert!(a.insert(&[1u8; PAGE_SIZE]).is_ok());
    }

    #[test]
    fn exhaustion_is_reported_not_panicked() {
        let a = area(1);
        assert!(a.insert(&[0u8; PAGE_SIZE]).is_ok());
        assert_eq!(a.insert(&[0u8; PAGE_SIZE]), Err(VmError::SwapExhausted));
    }

    #[test]
    fn free_without_load_makes_slot_available_again() {
        let a = area(1);
        let slot = a.insert(&[9u8; PAGE_SIZE]).unwrap();
        a.free(slot);
        assert!(a.insert(&[1u8; PAGE_SIZE]).is_ok());
    }
}
