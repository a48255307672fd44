//! Virtual-memory core.
//!
//! Demand paging over a fixed pool of physical frames. Each task keeps a
//! *supplemental page table* describing where every virtual page's contents
//! live -- zero-fill, a file range, a memory-mapped file range, or a swap
//! slot -- beside the MMU [page table] holding the installed translations
//! and their accessed/dirty bits. A fault enters [`page::page_in`], which
//! materializes the page, evicting another frame through second-chance
//! selection and [`page::page_out`] when the pool is full.
//!
//! [`Vm`] bundles the machine-wide pieces: the [frame table] and the
//! block-backed [swap area]. Per-task pieces live in [`crate::task::Task`].
//!
//! [page table]: page_table::PageTable
//! [frame table]: frame::FrameTable
//! [swap area]: swap::SwapArea

pub mod frame;
pub mod mmap;
pub mod page;
pub mod page_table;
pub mod swap;

pub use frame::FrameTable;
pub use mmap::{MapId, MmapTable};
pub use page::{PageSource, VPage};
pub use page_table::PageTable;
pub use swap::SwapArea;

use crate::dev::{Disk, DiskRole, SECTOR_SIZE};
use crate::KernelError;
use std::sync::Arc;

/// Size of a page in bytes.
pub const PGSIZE: usize = 4096;
/// Sectors per page on the swap device.
pub const PAGE_BLOCKS: usize = PGSIZE / SECTOR_SIZE;
/// First kernel virtual address; user pages live strictly below.
pub const PHYS_BASE: usize = 0xC000_0000;
/// Maximum stack size in bytes.
pub const STACK_MAX: usize = 8 * 1024 * 1024;
/// Slack below the stack pointer still treated as stack growth (PUSHA
/// pushes 32 bytes before the fault is taken).
pub(crate) const STACK_SLACK: usize = 32;

/// A virtual address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Va(pub usize);

impl Va {
    /// Round down to the containing page boundary.
    #[inline]
    pub fn page_down(self) -> Va {
        Va(self.0 & !(PGSIZE - 1))
    }

    /// Offset within the containing page.
    #[inline]
    pub fn page_offset(self) -> usize {
        self.0 & (PGSIZE - 1)
    }

    /// Whether the address is page-aligned.
    #[inline]
    pub fn is_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Whether the address lies in user space.
    #[inline]
    pub fn is_user(self) -> bool {
        self.0 < PHYS_BASE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, rhs: usize) -> Self {
        Self(self.0 + rhs)
    }
}

/// Machine-wide virtual-memory state: the frame pool and the swap area.
pub struct Vm {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapArea,
}

impl Vm {
    /// Bring up the VM with `user_pages` physical frames and the given
    /// swap disk.
    pub fn new(user_pages: usize, swap_disk: Disk) -> Result<Arc<Vm>, KernelError> {
        if swap_disk.role() != DiskRole::Swap {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Arc::new(Vm {
            frames: FrameTable::new(user_pages),
            swap: SwapArea::new(swap_disk),
        }))
    }

    /// Number of physical frames in the pool.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Number of free swap slots.
    pub fn free_swap_slots(&self) -> usize {
        self.swap.free_slots()
    }
}
