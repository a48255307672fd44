//! Per-task MMU page table.
//!
//! The hardware page table, modeled in software: a map from page-aligned
//! virtual addresses to a frame index plus the flag bits the eviction
//! policy and the write-back paths consult. The MMU
//! "sets" ACCESSED and DIRTY when user memory is touched through the
//! access helpers in [`crate::task`]; the VM core reads and clears them
//! exactly as it would drive a real page table.

use super::{Va, PGSIZE};
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Page-table entry bits.
    pub struct PteFlags: u8 {
        /// Translation is valid.
        const PRESENT = 1 << 0;
        /// Writes permitted.
        const WRITABLE = 1 << 1;
        /// Set on every access through the MMU.
        const ACCESSED = 1 << 2;
        /// Set on every write through the MMU.
        const DIRTY = 1 << 3;
    }
}

/// One installed translation.
#[derive(Debug, Clone, Copy)]
pub struct Pte {
    pub frame: usize,
    pub flags: PteFlags,
}

/// A task's page table.
#[derive(Default)]
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a translation from `va` to `frame`.
    pub fn map(&mut self, va: Va, frame: usize, writable: bool) {
        debug_assert!(va.is_aligned());
        let mut flags = PteFlags::PRESENT;
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(va.0, Pte { frame, flags });
    }

    /// Remove the translation for `va`, returning its frame.
    pub fn unmap(&mut self, va: Va) -> Option<usize> {
        self.entries.remove(&va.page_down().0).map(|pte| pte.frame)
    }

    /// The translation covering `va`, if present.
    pub fn lookup(&self, va: Va) -> Option<Pte> {
        self.entries.get(&va.page_down().0).copied()
    }

    pub(crate) fn lookup_mut(&mut self, va: Va) -> Option<&mut Pte> {
        self.entries.get_mut(&va.page_down().0)
    }

    /// Whether the accessed bit is set for `va`.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.lookup(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::ACCESSED))
    }

    /// Set or clear the accessed bit for `va`.
    pub fn set_accessed(&mut self, va: Va, accessed: bool) {
        if let Some(pte) = self.lookup_mut(va) {
            pte.flags.set(PteFlags::ACCESSED, accessed);
        }
    }

    /// Whether the dirty bit is set for `va`.
    pub fn is_dirty(&self, va: Va) -> bool {
        self.lookup(va)
            .map_or(false, |pte| pte.flags.contains(PteFlags::DIRTY))
    }

    /// Set or clear the dirty bit for `va`.
    pub fn set_dirty(&mut self, va: Va, dirty: bool) {
        if let Some(pte) = self.lookup_mut(va) {
            pte.flags.set(PteFlags::DIRTY, dirty);
        }
    }

    /// Number of installed translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no translation is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Number of pages covering `len` bytes.
pub(crate) fn page_span(len: usize) -> usize {
    len.div_ceil(PGSIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_lookup_unmap() {
        let mut pt = PageTable::new();
        pt.map(Va(0x4000), 3, true);
        let pte = pt.lookup(Va(0x4123)).unwrap();
        assert_eq!(pte.frame, 3);
        assert!(pte.flags.contains(PteFlags::PRESENT | PteFlags::WRITABLE));
        assert!(!pte.flags.contains(PteFlags::ACCESSED));

        assert_eq!(pt.unmap(Va(0x4000)), Some(3));
        assert!(pt.lookup(Va(0x4000)).is_none());
    }

    #[test]
    fn read_only_mapping() {
        let mut pt = PageTable::new();
        pt.map(Va(0x8000), 1, false);
        assert!(!pt.lookup(Va(0x8000)).unwrap().flags.contains(PteFlags::WRITABLE));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pt = PageTable::new();
        pt.map(Va(0x1000), 0, true);
        assert!(!pt.is_accessed(Va(0x1000)));

        pt.set_accessed(Va(0x1fff), true);
        pt.set_dirty(Va(0x1000), true);
        assert!(pt.is_accessed(Va(0x1000)));
        assert!(pt.is_dirty(Va(0x1000)));

        pt.set_accessed(Va(0x1000), false);
        assert!(!pt.is_accessed(Va(0x1000)));
        assert!(pt.is_dirty(Va(0x1000)));
    }

    #[test]
    fn page_span_rounds_up() {
        assert_eq!(page_span(0), 0);
        assert_eq!(page_span(1), 1);
        assert_eq!(page_span(PGSIZE), 1);
        assert_eq!(page_span(PGSIZE + 1), 2);
    }
}
