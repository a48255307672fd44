//! Tasks.
//!
//! A [`Task`] owns the per-process virtual-memory state: the MMU page
//! table, the supplemental page table, the mapping list and the recorded
//! user stack pointer. The scheduler and syscall front end live outside
//! this crate, so a task here is just that state plus the entry points
//! they would call: [`Task::page_fault`] from the fault handler,
//! [`Task::mmap`]/[`Task::munmap`] from the syscall layer,
//! [`Task::read_user`]/[`Task::write_user`] for validated user-memory
//! access, and [`Task::pin`]/[`Task::unpin`] to keep syscall buffers
//! resident across device I/O.
//!
//! The access helpers perform speculative-load validation: an address at
//! or above the user/kernel split fails immediately; a missing
//! translation faults into the page-in path and only then fails. Every
//! successful access drives the MMU accessed and
//! dirty bits, which is what the eviction policy and the write-back
//! paths observe.
//!
//! Dropping a task tears its address space down synchronously: every
//! mapping is unmapped (writing dirty mmap pages back to their files),
//! then every remaining page record releases its frame or swap slot.

use crate::fs::Inode;
use crate::vm::mmap::{self, MapId, Mmap, MmapTable};
use crate::vm::page::{self, PageSource, VPage};
use crate::vm::page_table::{page_span, PageTable, PteFlags};
use crate::vm::{Va, Vm, PGSIZE, PHYS_BASE};
use crate::KernelError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A user process, as far as the storage and memory core is concerned.
pub struct Task {
    name: String,
    vm: Arc<Vm>,
    pt: Mutex<PageTable>,
    spt: Mutex<BTreeMap<usize, VPage>>,
    maps: Mutex<MmapTable>,
    stack_pointer: AtomicUsize,
    /// Serializes fault handling and address-space mutation per task.
    pub(crate) fault_lock: Mutex<()>,
}

impl Task {
    /// Create a task with an empty address space.
    pub fn new(name: impl Into<String>, vm: Arc<Vm>) -> Arc<Task> {
        Arc::new(Task {
            name: name.into(),
            vm,
            pt: Mutex::new(PageTable::new()),
            spt: Mutex::new(BTreeMap::new()),
            maps: Mutex::new(MmapTable::default()),
            stack_pointer: AtomicUsize::new(PHYS_BASE),
            fault_lock: Mutex::new(()),
        })
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn vm(&self) -> &Vm {
        &self.vm
    }

    pub(crate) fn page_table(&self) -> MutexGuard<'_, PageTable> {
        self.pt.lock().unwrap()
    }

    pub(crate) fn spt(&self) -> MutexGuard<'_, BTreeMap<usize, VPage>> {
        self.spt.lock().unwrap()
    }

    /// Record the user stack pointer, consulted by stack-growth checks.
    pub fn set_stack_pointer(&self, sp: usize) {
        self.stack_pointer.store(sp, Ordering::SeqCst);
    }

    pub(crate) fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::SeqCst)
    }

    /// Whether a page record exists at `va`.
    pub fn has_record(&self, va: Va) -> bool {
        self.spt().contains_key(&va.page_down().0)
    }

    /// Whether the page at `va` is currently backed by a frame.
    pub fn is_resident(&self, va: Va) -> bool {
        self.spt()
            .get(&va.page_down().0)
            .map_or(false, |rec| rec.frame.is_some())
    }

    /// Whether the page at `va` currently lives in swap.
    pub fn is_swapped(&self, va: Va) -> bool {
        self.spt()
            .get(&va.page_down().0)
            .map_or(false, |rec| rec.swap_slot.is_some())
    }

    /// Create (or find) an anonymous zero-fill page record at `va`.
    pub fn alloc_page(&self, va: Va, writable: bool) -> Result<(), KernelError> {
        let va = va.page_down();
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        let mut spt = self.spt();
        spt.entry(va.0).or_insert_with(|| VPage::zero(va, writable));
        Ok(())
    }

    /// Register file-backed page records for a program segment.
    ///
    /// `read_bytes` come from the file at `offset`, then `zero_bytes` of
    /// zeros; the sum must be page-aligned and `base` page-aligned, as the
    /// loader guarantees.
    pub fn map_segment(
        &self,
        inode: Arc<Inode>,
        offset: usize,
        base: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), KernelError> {
        if !base.is_aligned() || (read_bytes + zero_bytes) % PGSIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let _fault = self.fault_lock.lock().unwrap();
        let mut spt = self.spt();
        let pages = (read_bytes + zero_bytes) / PGSIZE;
        for i in 0..pages {
            if spt.contains_key(&(base + i * PGSIZE).0) {
                return Err(KernelError::InvalidArgument);
            }
        }
        let mut remaining = read_bytes;
        for i in 0..pages {
            let va = base + i * PGSIZE;
            let page_read = remaining.min(PGSIZE);
            remaining -= page_read;
            let source = PageSource::File {
                inode: inode.clone(),
                offset: offset + i * PGSIZE,
                read_bytes: page_read,
                zero_bytes: PGSIZE - page_read,
            };
            spt.insert(va.0, VPage::with_source(va, writable, source));
        }
        Ok(())
    }

    /// Handle a page fault at `addr`.
    ///
    /// An error means the access was illegal; the caller terminates the
    /// task with exit code -1.
    pub fn page_fault(self: &Arc<Self>, addr: Va) -> Result<(), KernelError> {
        page::page_in(self, addr)
    }

    /// Fault the page at `va` in if needed and pin its frame, so device
    /// I/O into the buffer cannot fault while locks are held.
    ///
    /// The check-and-pin runs under the fault lock and the table lock, so
    /// it cannot interleave with this task's own fault handling, and a
    /// frame already claimed by an eviction is refused rather than
    /// "pinned" after the fact -- the claim would win once the page-out
    /// unblocks.
    pub fn pin(self: &Arc<Self>, va: Va) -> Result<(), KernelError> {
        let page = va.page_down();
        loop {
            let pinned = {
                let _fault = self.fault_lock.lock().unwrap();
                let spt = self.spt();
                spt.get(&page.0)
                    .and_then(|rec| rec.frame)
                    .map(|frame| self.vm.frames.try_pin(frame))
            };
            match pinned {
                Some(true) => return Ok(()),
                Some(false) => {
                    // An eviction holds the frame; let it finish.
                    std::thread::yield_now();
                }
                None => page::page_in(self, va)?,
            }
        }
    }

    /// Release a pin taken by [`Task::pin`].
    pub fn unpin(&self, va: Va) {
        let spt = self.spt();
        if let Some(rec) = spt.get(&va.page_down().0) {
            if let Some(frame) = rec.frame {
                // Text pages stay pinned by policy.
                if rec.writable || !rec.source.is_file_backed() {
                    self.vm.frames.set_pinned(frame, false);
                }
            }
        }
    }

    /// Map `inode` at `base` under the caller-chosen `id`.
    ///
    /// One page record per covered page is created, the tail page zero
    /// padded past end of file. Fails on a null, unaligned, or
    /// stack-region base, a zero-length file, a duplicate id, or overlap
    /// with any existing page record.
    pub fn mmap(&self, inode: Arc<Inode>, id: MapId, base: Va) -> Result<MapId, KernelError> {
        let length = mmap::validate_range(&inode, base)?;
        let _fault = self.fault_lock.lock().unwrap();
        let mut spt = self.spt();
        let mut maps = self.maps.lock().unwrap();
        if maps.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let pages = page_span(length);
        for i in 0..pages {
            if spt.contains_key(&(base + i * PGSIZE).0) {
                return Err(KernelError::InvalidArgument);
            }
        }
        for i in 0..pages {
            let va = base + i * PGSIZE;
            let read_bytes = (length - i * PGSIZE).min(PGSIZE);
            let source = PageSource::Mmap {
                id,
                inode: inode.clone(),
                offset: i * PGSIZE,
                read_bytes,
                zero_bytes: PGSIZE - read_bytes,
            };
            spt.insert(va.0, VPage::with_source(va, true, source));
        }
        maps.push(Mmap {
            id,
            inode,
            base,
            length,
        });
        debug!("task {}: mmap id {} at {:#x}", self.name, id, base.0);
        Ok(id)
    }

    /// Tear the mapping `id` down, writing dirty pages back to the file.
    pub fn munmap(&self, id: MapId) -> Result<(), KernelError> {
        let _fault = self.fault_lock.lock().unwrap();
        let map = self
            .maps
            .lock()
            .unwrap()
            .remove(id)
            .ok_or(KernelError::InvalidArgument)?;
        self.unmap_region(&map)
    }

    /// Release every page record of `map`, writing dirty resident pages
    /// back to the file at their recorded offsets.
    fn unmap_region(&self, map: &Mmap) -> Result<(), KernelError> {
        let mut first_err = None;
        for i in 0..page_span(map.length) {
            let va = map.base + i * PGSIZE;
            let mut spt = self.spt();
            let Some(rec) = spt.get(&va.0) else {
                continue;
            };
            let dirty = rec.dirty || self.page_table().is_dirty(va);
            if let (Some(frame), true) = (rec.frame, dirty) {
                let PageSource::Mmap {
                    inode,
                    offset,
                    read_bytes,
                    ..
                } = &rec.source
                else {
                    continue;
                };
                let (inode, offset, read_bytes) = (inode.clone(), *offset, *read_bytes);
                let res = self
                    .vm
                    .frames
                    .with_frame(frame, |data| inode.write_at(&data[..read_bytes], offset));
                match res {
                    Ok(n) if n == read_bytes => {}
                    Ok(_) => {
                        first_err.get_or_insert(KernelError::IOError);
                    }
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            let rec = spt.remove(&va.0).unwrap();
            drop(spt);
            page::release_record(self, &rec);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn user_range_ok(&self, va: Va, len: usize) -> bool {
        va.0.checked_add(len).map_or(false, |end| end <= PHYS_BASE)
    }

    /// Copy user memory at `va` into `buf`.
    ///
    /// Pages are faulted in on demand and pinned around the copy; every
    /// touched page gets its accessed bit set. Fails with
    /// [`KernelError::BadAddress`] on kernel addresses or unmapped pages,
    /// which the syscall layer turns into exit(-1).
    pub fn read_user(self: &Arc<Self>, va: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        if !self.user_range_ok(va, buf.len()) {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let chunk = (buf.len() - done).min(PGSIZE - cur.page_offset());
            loop {
                self.pin(cur)?;
                let res = self.copy_page(
                    cur,
                    |data, offset| {
                        buf[done..done + chunk].copy_from_slice(&data[offset..offset + chunk]);
                    },
                    false,
                );
                self.unpin(cur);
                if res? {
                    break;
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy `buf` into user memory at `va`.
    ///
    /// Like [`Task::read_user`], but requires the pages to be writable and
    /// drives their dirty bits.
    pub fn write_user(self: &Arc<Self>, va: Va, buf: &[u8]) -> Result<(), KernelError> {
        if !self.user_range_ok(va, buf.len()) {
            return Err(KernelError::BadAddress);
        }
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let chunk = (buf.len() - done).min(PGSIZE - cur.page_offset());
            loop {
                self.pin(cur)?;
                let res = self.copy_page(
                    cur,
                    |data, offset| {
                        data[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
                    },
                    true,
                );
                self.unpin(cur);
                if res? {
                    break;
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Run `access` over the resident page covering `va`, driving the MMU
    /// accessed/dirty bits. The page must be pinned by the caller.
    ///
    /// `Ok(false)` means the page slipped out of residence before the pin
    /// took effect (an eviction had already claimed its frame); the caller
    /// faults it back in and retries.
    fn copy_page(
        &self,
        va: Va,
        access: impl FnOnce(&mut [u8; PGSIZE], usize),
        is_write: bool,
    ) -> Result<bool, KernelError> {
        let page = va.page_down();
        let spt = self.spt();
        let rec = spt.get(&page.0).ok_or(KernelError::BadAddress)?;
        if is_write && !rec.writable {
            return Err(KernelError::BadAddress);
        }
        let Some(frame) = rec.frame else {
            return Ok(false);
        };
        {
            let mut pt = self.page_table();
            if let Some(pte) = pt.lookup_mut(page) {
                pte.flags |= PteFlags::ACCESSED;
                if is_write {
                    pte.flags |= PteFlags::DIRTY;
                }
            }
        }
        // Take the frame's content lock before letting the table go. Any
        // eviction of this page must first pass through the table (where
        // `rec.frame` is still set) and then through this content lock,
        // so the bytes below can never belong to a rebound frame.
        let mut data = self.vm.frames.lock_frame(frame);
        drop(spt);
        let buf: &mut [u8; PGSIZE] = &mut data;
        access(buf, va.page_offset());
        Ok(true)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Write dirty mmap pages back, then drop every page record.
        let maps = std::mem::take(&mut *self.maps.lock().unwrap());
        for map in &maps.maps {
            if let Err(e) = self.unmap_region(map) {
                warn!("task {}: mmap write-back on exit failed: {}", self.name, e);
            }
        }
        let records: Vec<VPage> = {
            let mut spt = self.spt();
            std::mem::take(&mut *spt).into_values().collect()
        };
        for rec in &records {
            page::release_record(self, rec);
        }
        debug!("task {}: address space torn down", self.name);
    }
}
