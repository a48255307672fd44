//! Frame table.
//!
//! The pool of physical frames handed to user pages, built once at VM
//! bring-up. Each frame is a page-sized kernel buffer plus bookkeeping: a
//! weak back-reference to the owning task's virtual page (weak so a dead
//! task's frames fall back into the pool on their own), a pinned flag
//! that exempts the frame from eviction while I/O is in flight on it, and
//! an eviction-claim flag marking a frame whose page-out is underway.
//! The claim is separate from the pin so that [`FrameTable::try_pin`] can
//! tell a frame it may still protect from one that is already on its way
//! out; a pin that raced the claim would otherwise be silently defeated
//! once the page-out unblocks.
//!
//! Allocation scans for an unbound frame first, then runs second-chance
//! victim selection: a persistent clock cursor sweeps the pool, skipping
//! pinned frames, clearing accessed bits as it passes and selecting the
//! first page whose bit is already clear. Selection prefers frames of the
//! allocating task; when two full local sweeps find nothing it widens to
//! every task's frames, and only a saturated pool of pinned frames fails
//! the allocation.
//!
//! The table mutex covers the bookkeeping and cursor only. Eviction
//! claims the victim inside the lock, then calls [`page_out`] outside it, so
//! page-out disk I/O never stalls other allocators' bookkeeping. Frame
//! contents are guarded by a per-frame lock, taken only while the frame is
//! pinned (fills, swap writes, user copies).
//!
//! [`page_out`]: super::page::page_out

use super::page::page_out;
use super::{Va, PGSIZE};
use crate::task::Task;
use crate::KernelError;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

struct FrameInfo {
    /// The virtual page this frame backs, if any.
    vpage: Option<(Weak<Task>, Va)>,
    /// Pinned frames are never selected as victims.
    pinned: bool,
    /// An eviction has claimed this frame; its page-out is in flight.
    evicting: bool,
}

struct Inner {
    frames: Vec<FrameInfo>,
    /// Second-chance clock hand.
    cursor: usize,
}

/// The physical frame pool.
pub struct FrameTable {
    contents: Box<[Mutex<Box<[u8; PGSIZE]>>]>,
    inner: Mutex<Inner>,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Scope {
    Local,
    Global,
}

impl FrameTable {
    /// Build a pool of `user_pages` frames.
    pub(crate) fn new(user_pages: usize) -> Self {
        assert!(user_pages > 0, "frame pool must not be empty");
        info!("frame table: {} user pages", user_pages);
        let contents = (0..user_pages)
            .map(|_| {
                let page: Box<[u8; PGSIZE]> =
                    vec![0u8; PGSIZE].into_boxed_slice().try_into().unwrap();
                Mutex::new(page)
            })
            .collect();
        let frames = (0..user_pages)
            .map(|_| FrameInfo {
                vpage: None,
                pinned: false,
                evicting: false,
            })
            .collect();
        Self {
            contents,
            inner: Mutex::new(Inner { frames, cursor: 0 }),
        }
    }

    /// Number of frames in the pool.
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    /// Whether the pool is empty. It never is; see [`FrameTable::new`].
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Lock a frame's contents, returning the guard.
    ///
    /// The caller must hold whatever makes the frame index current (the
    /// owning record's table lock, or a pin); holding the returned guard
    /// then keeps a page-out or refill of the frame waiting until the
    /// access is complete.
    pub(crate) fn lock_frame(&self, idx: usize) -> MutexGuard<'_, Box<[u8; PGSIZE]>> {
        self.contents[idx].lock().unwrap()
    }

    /// Run `f` over the frame's contents, holding its content lock.
    pub(crate) fn with_frame<R>(&self, idx: usize, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        let mut data = self.lock_frame(idx);
        f(&mut data)
    }

    /// Acquire a frame for `(task, va)`.
    ///
    /// Returns the frame index with the frame *pinned* and bound to the
    /// page; the caller unpins once the fill is installed. May evict
    /// another page via [`page_out`].
    pub(crate) fn alloc(&self, task: &Arc<Task>, va: Va) -> Result<usize, KernelError> {
        let (idx, evictee) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(idx) = inner.frames.iter().position(|f| f.vpage.is_none()) {
                inner.frames[idx] = FrameInfo {
                    vpage: Some((Arc::downgrade(task), va)),
                    pinned: true,
                    evicting: false,
                };
                return Ok(idx);
            }
            match Self::select_victim(&mut inner, task) {
                Some(victim) => victim,
                None => {
                    // Every frame pinned: the pool is saturated.
                    warn!("frame table: no evictable frame");
                    return Err(KernelError::NoMemory);
                }
            }
        };

        // Write the victim out with the frame claimed but the table
        // unlocked.
        if let Some((owner, old_va)) = evictee {
            debug!("frame {}: evicting page {:#x}", idx, old_va.0);
            if let Err(e) = page_out(&owner, old_va) {
                let mut inner = self.inner.lock().unwrap();
                inner.frames[idx].evicting = false;
                return Err(e);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        let frame = &mut inner.frames[idx];
        debug_assert!(frame.evicting);
        frame.vpage = Some((Arc::downgrade(task), va));
        frame.evicting = false;
        frame.pinned = true;
        Ok(idx)
    }

    /// Second-chance selection. Returns the victim index (already claimed
    /// via the eviction flag) and its owner, or `None` with every
    /// candidate pinned. An owner that has exited yields the frame without
    /// a page-out.
    fn select_victim(
        inner: &mut Inner,
        task: &Arc<Task>,
    ) -> Option<(usize, Option<(Arc<Task>, Va)>)> {
        let n = inner.frames.len();
        for scope in [Scope::Local, Scope::Global] {
            // Two sweeps: the first may only be clearing accessed bits.
            for _ in 0..2 * n {
                let idx = inner.cursor;
                inner.cursor = (inner.cursor + 1) % n;

                let frame = &mut inner.frames[idx];
                if frame.pinned || frame.evicting {
                    continue;
                }
                let Some((weak, va)) = frame.vpage.clone() else {
                    continue;
                };
                let Some(owner) = weak.upgrade() else {
                    frame.evicting = true;
                    return Some((idx, None));
                };
                if scope == Scope::Local && !Arc::ptr_eq(&owner, task) {
                    continue;
                }
                let mut pt = owner.page_table();
                if pt.is_accessed(va) {
                    pt.set_accessed(va, false);
                    continue;
                }
                drop(pt);
                frame.evicting = true;
                return Some((idx, Some((owner, va))));
            }
        }
        None
    }

    /// Clear the frame's page association, returning it to the pool.
    pub(crate) fn release(&self, idx: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames[idx] = FrameInfo {
            vpage: None,
            pinned: false,
            evicting: false,
        };
    }

    /// Pin or unpin a frame.
    pub(crate) fn set_pinned(&self, idx: usize, pinned: bool) {
        self.inner.lock().unwrap().frames[idx].pinned = pinned;
    }

    /// Pin a frame unless an eviction has already claimed it.
    ///
    /// A claimed frame is about to lose its page no matter what; the
    /// caller backs off and lets the page-out finish rather than holding
    /// a pin the eviction would ignore.
    pub(crate) fn try_pin(&self, idx: usize) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.frames[idx].evicting {
            return false;
        }
        inner.frames[idx].pinned = true;
        true
    }

    /// Whether a frame is currently pinned. Test support.
    pub fn is_pinned(&self, idx: usize) -> bool {
        self.inner.lock().unwrap().frames[idx].pinned
    }
}
