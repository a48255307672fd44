//! Reader/writer monitor.
//!
//! [`SharedLock`] allows a number of readers or at most one writer at any
//! point in time. It is the per-cache-entry lease primitive of the buffer
//! cache: writers hold it exclusively while mutating the cached bytes,
//! readers and the background flusher hold it shared while copying them
//! out.
//!
//! The monitor state is a single integer guarded by a mutex: `0` when idle,
//! the reader count when positive, `-1` while a writer holds the lock.
//! Blocking uses one condition variable for both sides; a departing reader
//! that leaves the lock idle signals one waiter, a departing writer wakes
//! everyone.
//!
//! Unlike a plain RwLock, an exclusive holder can atomically
//! [`downgrade`](ExclusiveGuard::downgrade) to a shared lease: the state
//! transition happens under the monitor's own mutex, so no other thread can
//! observe the lock idle in between. The buffer cache relies on this to
//! admit concurrent readers of a freshly filled entry without opening a
//! window in which the entry could be evicted and rebound.
//!
//! Writer starvation under a continuous stream of readers is possible and
//! accepted: every reader's critical section is one sector copy.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};

/// A reader/writer monitor protecting a value of type `T`.
pub struct SharedLock<T> {
    /// 0: idle, > 0: number of readers, -1: writer holds the lock.
    state: Mutex<isize>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

// Readers alias &T across threads, so T must be Sync; guards can release on
// another thread than the acquirer in principle, so T must be Send.
unsafe impl<T: Send + Sync> Sync for SharedLock<T> {}
unsafe impl<T: Send> Send for SharedLock<T> {}

/// RAII structure used to release the shared access of a lock when dropped.
pub struct SharedGuard<'a, T> {
    lock: &'a SharedLock<T>,
}

/// RAII structure used to release the exclusive access of a lock when
/// dropped.
pub struct ExclusiveGuard<'a, T> {
    lock: &'a SharedLock<T>,
}

impl<T> SharedLock<T> {
    /// Creates a new instance of a `SharedLock<T>` which is unlocked.
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(0),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires a shared lease, blocking the current thread until no writer
    /// holds the lock.
    pub fn read(&self) -> SharedGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while *state < 0 {
            state = self.cond.wait(state).unwrap();
        }
        *state += 1;
        SharedGuard { lock: self }
    }

    /// Acquires the exclusive lease, blocking the current thread until the
    /// lock is idle.
    pub fn write(&self) -> ExclusiveGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while *state != 0 {
            state = self.cond.wait(state).unwrap();
        }
        *state = -1;
        ExclusiveGuard { lock: self }
    }

    /// Consumes this lock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<'a, T> ExclusiveGuard<'a, T> {
    /// Downgrade the exclusive lease into a shared lease.
    ///
    /// The writer state becomes one reader under the monitor mutex; the
    /// lock is never observed idle during the transition. Other shared
    /// waiters are woken, since they may now proceed.
    pub fn downgrade(self) -> SharedGuard<'a, T> {
        let this = core::mem::ManuallyDrop::new(self);
        let lock = this.lock;
        {
            let mut state = lock.state.lock().unwrap();
            debug_assert_eq!(*state, -1);
            *state = 1;
            lock.cond.notify_all();
        }
        SharedGuard { lock }
    }
}

impl<T> Deref for SharedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for ExclusiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SharedGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        debug_assert!(*state > 0);
        *state -= 1;
        if *state == 0 {
            self.lock.cond.notify_one();
        }
    }
}

impl<T> Drop for ExclusiveGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        debug_assert_eq!(*state, -1);
        *state = 0;
        self.lock.cond.notify_all();
    }
}
