//! Swap area.
//!
//! A page-sized slot allocator over the swap disk. The bitmap holds one
//! bit per slot, where a slot is [`PAGE_BLOCKS`] consecutive sectors; the
//! sector index `slot * PAGE_BLOCKS` appears only in the I/O loops below.
//! One mutex covers the bitmap and the slot I/O; nothing else sleeps on
//! the swap device, so holding it across the transfer is harmless.

use super::{PAGE_BLOCKS, PGSIZE};
use crate::dev::{Disk, Sector, SECTOR_SIZE};
use crate::KernelError;
use std::sync::Mutex;

struct SwapInner {
    /// One bit per page-sized slot; set = in use.
    bits: Vec<u64>,
    slots: usize,
}

impl SwapInner {
    fn test(&self, slot: usize) -> bool {
        self.bits[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: usize) {
        self.bits[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.bits[slot / 64] &= !(1 << (slot % 64));
    }
}

/// The swap device and its slot bitmap.
pub struct SwapArea {
    disk: Disk,
    inner: Mutex<SwapInner>,
}

impl SwapArea {
    /// Build the swap area over `disk`, one slot per [`PGSIZE`] worth of
    /// sectors.
    pub(crate) fn new(disk: Disk) -> Self {
        let slots = disk.sector_count() / PAGE_BLOCKS;
        info!("swap: {} slots of {} sectors", slots, PAGE_BLOCKS);
        Self {
            disk,
            inner: Mutex::new(SwapInner {
                bits: vec![0; slots.div_ceil(64)],
                slots,
            }),
        }
    }

    /// Write a page to a fresh slot, returning the slot index.
    pub(crate) fn swap_out(&self, data: &[u8; PGSIZE]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = (0..inner.slots)
            .find(|&s| !inner.test(s))
            .ok_or(KernelError::NoSpace)?;
        inner.set(slot);

        for i in 0..PAGE_BLOCKS {
            let src = (&data[i * SECTOR_SIZE..][..SECTOR_SIZE]).try_into().unwrap();
            if let Err(e) = self.disk.write(Sector((slot * PAGE_BLOCKS + i) as u32), src) {
                inner.clear(slot);
                return Err(e);
            }
        }
        Ok(slot)
    }

    /// Read a slot back into `data` and free it.
    pub(crate) fn swap_in(&self, slot: usize, data: &mut [u8; PGSIZE]) -> Result<(), KernelError> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(slot < inner.slots);
        if !inner.test(slot) {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..PAGE_BLOCKS {
            let dst = (&mut data[i * SECTOR_SIZE..][..SECTOR_SIZE]).try_into().unwrap();
            self.disk.read(Sector((slot * PAGE_BLOCKS + i) as u32), dst)?;
        }
        inner.clear(slot);
        Ok(())
    }

    /// Free a slot without reading it; process teardown.
    pub(crate) fn clear(&self, slot: usize) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.test(slot), "clearing a free swap slot");
        inner.clear(slot);
    }

    /// Number of free slots.
    pub fn free_slots(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        (0..inner.slots).filter(|&s| !inner.test(s)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{DiskRole, MemDisk};

    fn swap(sectors: usize) -> SwapArea {
        SwapArea::new(Disk::new(MemDisk::new(sectors), DiskRole::Swap))
    }

    #[test]
    fn slot_count_is_page_granular() {
        // 20 sectors hold two full page slots; the stragglers are unused.
        let area = swap(20);
        assert_eq!(area.free_slots(), 2);
    }

    #[test]
    fn out_then_in_round_trips() {
        let area = swap(64);
        let mut page = [0u8; PGSIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let slot = area.swap_out(&page).unwrap();
        assert_eq!(area.free_slots(), 64 / PAGE_BLOCKS - 1);

        let mut back = [0u8; PGSIZE];
        area.swap_in(slot, &mut back).unwrap();
        assert_eq!(page[..], back[..]);
        // swap_in frees the slot.
        assert_eq!(area.free_slots(), 64 / PAGE_BLOCKS);
        assert_eq!(
            area.swap_in(slot, &mut back),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let area = swap(PAGE_BLOCKS);
        let page = [1u8; PGSIZE];
        area.swap_out(&page).unwrap();
        assert_eq!(area.swap_out(&page), Err(KernelError::NoSpace));
    }

    #[test]
    fn clear_releases_without_io() {
        let area = swap(64);
        let page = [2u8; PGSIZE];
        let slot = area.swap_out(&page).unwrap();
        area.clear(slot);
        assert_eq!(area.free_slots(), 64 / PAGE_BLOCKS);
    }
}
