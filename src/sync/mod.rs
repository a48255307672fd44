//! Synchronization primitives.

pub mod shared_lock;

pub use shared_lock::{ExclusiveGuard, SharedGuard, SharedLock};
