//! Supplemental page records and the page-in / page-out paths.
//!
//! The supplemental page table is a per-task map from page-aligned virtual
//! addresses to [`VPage`] records. The record says where the page's
//! contents come from ([`PageSource`]), whether it is writable, which
//! frame currently backs it, and -- when it has been evicted to swap --
//! which slot holds it. A sticky dirty bit accumulates the MMU dirty bit
//! across evictions, so a page dirtied once keeps owing a write-back even
//! after round trips through swap.
//!
//! At most one of `frame` / `swap_slot` is set, except transiently inside
//! an eviction, where the frame stays pinned until the swap write and the
//! unmap complete.
//!
//! [`page_in`] materializes a page: resolve (or create, for stack growth)
//! the record, acquire a frame -- pinned and possibly evicting -- fill it
//! from swap, zeros, or the backing file, then install the MMU mapping.
//! Read-only file-backed pages stay pinned after the fill, trading a
//! little pool capacity for never re-reading hot text pages. [`page_out`]
//! is the reverse: fold in the MMU dirty bit, write dirty contents to
//! swap (anonymous and file pages) or back to the file (mmap pages), then
//! unmap and drop the frame association. Clean pages skip the write but
//! still unmap.

use super::mmap::MapId;
use super::{Va, PGSIZE, PHYS_BASE, STACK_MAX, STACK_SLACK};
use crate::fs::Inode;
use crate::task::Task;
use crate::KernelError;
use std::sync::Arc;

/// Where a virtual page's contents come from.
#[derive(Clone)]
pub enum PageSource {
    /// Fresh anonymous or stack page; fills with zeros.
    Zero,
    /// A file range, set up by the program loader.
    File {
        inode: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// A range of a memory-mapped file; dirty pages write back to it.
    Mmap {
        id: MapId,
        inode: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

impl PageSource {
    /// Whether the page is filled from a file (plain or mmap).
    pub fn is_file_backed(&self) -> bool {
        matches!(self, PageSource::File { .. } | PageSource::Mmap { .. })
    }
}

/// Supplemental record for one virtual page.
pub struct VPage {
    pub va: Va,
    pub writable: bool,
    pub source: PageSource,
    /// Index of the backing frame while resident.
    pub frame: Option<usize>,
    /// Swap slot holding the contents while evicted there.
    pub swap_slot: Option<usize>,
    /// Sticky dirty bit, OR of the MMU dirty bit across evictions.
    pub dirty: bool,
}

impl VPage {
    /// A fresh zero-fill record.
    pub(crate) fn zero(va: Va, writable: bool) -> Self {
        Self {
            va,
            writable,
            source: PageSource::Zero,
            frame: None,
            swap_slot: None,
            dirty: false,
        }
    }

    /// A record with an explicit source.
    pub(crate) fn with_source(va: Va, writable: bool, source: PageSource) -> Self {
        Self {
            va,
            writable,
            source,
            frame: None,
            swap_slot: None,
            dirty: false,
        }
    }
}

/// Whether a faulting access at `addr` is legitimate stack growth.
///
/// The address must lie in the stack region and at or above the stack
/// pointer minus the PUSHA slack.
fn grows_stack(addr: Va, stack_pointer: usize) -> bool {
    addr.0 < PHYS_BASE && addr.0 >= PHYS_BASE - STACK_MAX && addr.0 + STACK_SLACK >= stack_pointer
}

/// Materialize the page covering `addr` for `task`.
///
/// Failure means the access was invalid (or resources ran out); the fault
/// handler turns that into process termination.
pub fn page_in(task: &Arc<Task>, addr: Va) -> Result<(), KernelError> {
    if !addr.is_user() {
        return Err(KernelError::BadAddress);
    }
    let va = addr.page_down();
    let _fault = task.fault_lock.lock().unwrap();

    // Resolve the record; an unrecorded address may still be stack growth.
    let (source, writable, swap_slot) = {
        let mut spt = task.spt();
        if !spt.contains_key(&va.0) {
            // An unrecorded address may still be legitimate stack growth.
            if !grows_stack(addr, task.stack_pointer()) {
                return Err(KernelError::BadAddress);
            }
            debug!("task {}: stack growth at {:#x}", task.name(), va.0);
            spt.insert(va.0, VPage::zero(va, true));
        }
        let rec = &spt[&va.0];
        if rec.frame.is_some() {
            // A racing fault on the same page already resolved it.
            return Ok(());
        }
        (rec.source.clone(), rec.writable, rec.swap_slot)
    };

    // Acquire a frame: returned pinned, bound to (task, va), possibly
    // after evicting another page. No supplemental-table lock is held
    // here; eviction may need to lock it.
    let frame = task.vm().frames.alloc(task, va)?;

    // Fill the pinned frame.
    let filled = task.vm().frames.with_frame(frame, |data| {
        if let Some(slot) = swap_slot {
            return task.vm().swap.swap_in(slot, data);
        }
        match &source {
            PageSource::Zero => {
                data.fill(0);
                Ok(())
            }
            PageSource::File {
                inode,
                offset,
                read_bytes,
                zero_bytes,
            }
            | PageSource::Mmap {
                inode,
                offset,
                read_bytes,
                zero_bytes,
                ..
            } => {
                debug_assert_eq!(read_bytes + zero_bytes, PGSIZE);
                let n = inode.read_at(&mut data[..*read_bytes], *offset)?;
                if n != *read_bytes {
                    return Err(KernelError::IOError);
                }
                data[*read_bytes..].fill(0);
                Ok(())
            }
        }
    });
    if let Err(e) = filled {
        task.vm().frames.release(frame);
        return Err(e);
    }

    // Install the mapping.
    {
        let mut spt = task.spt();
        let Some(rec) = spt.get_mut(&va.0) else {
            task.vm().frames.release(frame);
            return Err(KernelError::BadAddress);
        };
        rec.frame = Some(frame);
        if swap_slot.is_some() {
            // swap_in freed the slot.
            rec.swap_slot = None;
        }
        task.page_table().map(va, frame, rec.writable);
    }

    // Read-only file-backed pages (program text) stay pinned so they are
    // never reloaded; everything else becomes evictable again.
    if writable || !source.is_file_backed() {
        task.vm().frames.set_pinned(frame, false);
    }
    Ok(())
}

/// Evict the page covering `va` from its frame.
///
/// The caller (victim selection, with the frame claimed) owns the frame's
/// rebinding; this only writes contents where they belong and severs the
/// page's association.
pub(crate) fn page_out(task: &Arc<Task>, va: Va) -> Result<(), KernelError> {
    let mut spt = task.spt();
    let Some(rec) = spt.get_mut(&va.0) else {
        return Ok(());
    };
    let Some(frame) = rec.frame else {
        return Ok(());
    };

    let mut pt = task.page_table();
    rec.dirty |= pt.is_dirty(va);
    if rec.dirty {
        match rec.source.clone() {
            PageSource::Mmap {
                inode,
                offset,
                read_bytes,
                ..
            } => {
                // Dirty mmap pages go back to the file, not to swap.
                let n = task
                    .vm()
                    .frames
                    .with_frame(frame, |data| inode.write_at(&data[..read_bytes], offset))?;
                if n != read_bytes {
                    return Err(KernelError::IOError);
                }
                pt.set_dirty(va, false);
                rec.dirty = false;
            }
            PageSource::Zero | PageSource::File { .. } => {
                let slot = task
                    .vm()
                    .frames
                    .with_frame(frame, |data| task.vm().swap.swap_out(data))?;
                rec.swap_slot = Some(slot);
            }
        }
    }

    pt.unmap(va);
    rec.frame = None;
    Ok(())
}

/// Drop a record's resources: frame, MMU mapping, swap slot.
pub(crate) fn release_record(task: &Task, rec: &VPage) {
    if let Some(frame) = rec.frame {
        task.page_table().unmap(rec.va);
        task.vm().frames.release(frame);
    }
    if let Some(slot) = rec.swap_slot {
        task.vm().swap.clear(slot);
    }
}
