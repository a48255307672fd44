//! Memory-mapped file records.
//!
//! One [`Mmap`] per active mapping: the id the syscall layer chose (the
//! originating file descriptor), the reopened file handle, the base
//! address and the mapped byte length. The per-page bookkeeping lives in
//! the supplemental page table; [`crate::task::Task::mmap`] populates it
//! and [`crate::task::Task::munmap`] tears it down, writing dirty pages
//! back to the file.

use super::{Va, PGSIZE, PHYS_BASE, STACK_MAX};
use crate::fs::Inode;
use crate::KernelError;
use std::sync::Arc;

/// Identifier of an active mapping, chosen by the caller.
pub type MapId = usize;

/// An active memory mapping.
pub struct Mmap {
    pub id: MapId,
    pub(crate) inode: Arc<Inode>,
    pub base: Va,
    pub length: usize,
}

/// A task's mapping list.
#[derive(Default)]
pub struct MmapTable {
    pub(crate) maps: Vec<Mmap>,
}

impl MmapTable {
    pub(crate) fn contains(&self, id: MapId) -> bool {
        self.maps.iter().any(|m| m.id == id)
    }

    pub(crate) fn push(&mut self, map: Mmap) {
        debug_assert!(!self.contains(map.id));
        self.maps.push(map);
    }

    pub(crate) fn remove(&mut self, id: MapId) -> Option<Mmap> {
        let at = self.maps.iter().position(|m| m.id == id)?;
        Some(self.maps.swap_remove(at))
    }

    /// Ids of the live mappings.
    pub fn ids(&self) -> Vec<MapId> {
        self.maps.iter().map(|m| m.id).collect()
    }
}

/// Validate an mmap request, returning the file length to map.
///
/// Rejected: a null or unaligned base, a zero-length file, and any base
/// or extent reaching the stack region `[PHYS_BASE - STACK_MAX, PHYS_BASE)`
/// or beyond. Overlap with existing page records is checked by the caller
/// against the supplemental table.
pub(crate) fn validate_range(inode: &Inode, base: Va) -> Result<usize, KernelError> {
    if base.0 == 0 || !base.is_aligned() {
        return Err(KernelError::InvalidArgument);
    }
    let length = inode.length();
    if length == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let stack_floor = PHYS_BASE - STACK_MAX;
    let pages = length.div_ceil(PGSIZE);
    let end = base
        .0
        .checked_add(pages * PGSIZE)
        .ok_or(KernelError::InvalidArgument)?;
    if base.0 >= stack_floor || end > stack_floor {
        return Err(KernelError::InvalidArgument);
    }
    Ok(length)
}
