//! # minos: storage and memory core of a teaching operating system
//!
//! This crate implements the two subsystems that carry most of the
//! engineering weight in a small POSIX-like kernel:
//!
//! - a **filesystem core**: a fixed-size sector [buffer cache] in front of a
//!   block device, a persistent [free map], and a multi-level indexed
//!   [inode] layer with sparse, growable files and directories;
//! - a **virtual-memory core**: per-task supplemental page tables, a
//!   [frame table] with second-chance eviction, a block-backed [swap area],
//!   and [memory-mapped files] with dirty write-back.
//!
//! The pieces the core consumes but does not own -- the block device driver,
//! the scheduler's blocking primitives, the syscall front end -- appear only
//! as interfaces: block devices are implementations of
//! [`dev::BlockDevice`], blocking uses the host's mutexes and condition
//! variables, and tasks are explicit [`task::Task`] values handed to the VM
//! entry points.
//!
//! The cache and the VM interact: page-in of a file-backed page reads
//! through the buffer cache, eviction of an anonymous page writes to swap,
//! and an inode flush walks the cache. See the module documentation for the
//! locking protocol each layer follows.
//!
//! [buffer cache]: fs::BufferCache
//! [free map]: fs::FreeMap
//! [inode]: fs::Inode
//! [frame table]: vm::FrameTable
//! [swap area]: vm::SwapArea
//! [memory-mapped files]: vm::MmapTable

#[macro_use]
extern crate log;

pub mod dev;
pub mod fs;
pub mod sync;
pub mod task;
pub mod vm;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// while servicing a request. These errors can be returned to the user
/// program to indicate the nature of the failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Not a directory. (ENOTDIR)
    NotDirectory,
    /// Is a directory. (EISDIR)
    IsDirectory,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// File too large. (EFBIG)
    FileTooLarge,
    /// Directory not empty. (ENOTEMPTY)
    DirectoryNotEmpty,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding negative errno
    /// value, for use as a raw system-call return value.
    pub fn into_isize(self) -> isize {
        match self {
            KernelError::OperationNotPermitted => -1,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::NotDirectory => -20,
            KernelError::IsDirectory => -21,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::DirectoryNotEmpty => -39,
            KernelError::FileTooLarge => -27,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::FilesystemCorrupted(why) => {
                write!(f, "filesystem corrupted: {}", why)
            }
            e => write!(f, "{:?} ({})", e, e.clone().into_isize()),
        }
    }
}

impl std::error::Error for KernelError {}
