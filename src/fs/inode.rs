//! Inode engine.
//!
//! Every file and directory is described by an inode occupying exactly one
//! sector: a byte length, a magic tag, a directory flag, and 125 sector
//! pointers -- 123 direct, one indirect (a sector of 128 pointers), one
//! doubly indirect (a sector of pointers to pointer sectors). The layout
//! caps a file at `(123 + 128 + 128*128) * 512` bytes, a little over 8 MiB.
//!
//! Files are sparse. A pointer slot holding the on-disk sentinel is a
//! *hole*: reads of a hole see zeros and allocate nothing; the first write
//! to a hole allocates a zero-filled sector lazily, growing the pointer
//! tree level by level as needed. Writing past the end of the file just
//! extends the recorded length -- the skipped range remains holes.
//!
//! In-memory inodes are reference-counted and coalesced: opening the same
//! sector twice yields the same [`Arc<Inode>`], tracked by the filesystem's
//! open-inode table. The last handle to drop flushes the inode's sectors
//! and, if the inode was marked removed, walks the pointer tree returning
//! every allocated sector (and the inode sector itself) to the free map.
//!
//! The per-inode lock protects the cached on-disk image and length
//! extension. Data-sector I/O happens outside it, so concurrent reads and
//! writes to disjoint ranges of one file run in parallel, serialized only
//! per-sector by the buffer cache.

use super::{cache::BufferCache, FsCore, ROOT_DIR_SECTOR};
use crate::dev::{Sector, SECTOR_NONE, SECTOR_SIZE};
use crate::KernelError;
use static_assertions::const_assert;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use zerocopy::{AsBytes, FromBytes};

/// Number of direct pointers in an inode.
pub const DIRECT_COUNT: usize = 123;
/// Slot index of the indirect pointer.
const INDIRECT_SLOT: usize = DIRECT_COUNT;
/// Slot index of the doubly-indirect pointer.
const DBL_INDIRECT_SLOT: usize = DIRECT_COUNT + 1;
/// Total pointer slots in the on-disk inode.
const BLOCK_SLOTS: usize = DIRECT_COUNT + 2;
/// Sector pointers per indirect sector.
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// First file sector served by the indirect tree.
const INDIRECT_BEGIN: usize = DIRECT_COUNT;
/// First file sector served by the doubly-indirect tree.
const DBL_BEGIN: usize = DIRECT_COUNT + PTRS_PER_SECTOR;
/// One past the largest addressable file sector.
pub const MAX_FILE_SECTOR: usize = DBL_BEGIN + PTRS_PER_SECTOR * PTRS_PER_SECTOR;
/// Largest representable file length in bytes.
pub const MAX_LENGTH: usize = MAX_FILE_SECTOR * SECTOR_SIZE;

/// Identifies an inode sector. ASCII "INOD".
const INODE_MAGIC: u32 = 0x494e4f44;

/// On-disk inode. Must be exactly one sector long.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RawInode {
    /// File size in bytes.
    length: u32,
    /// Magic number.
    magic: u32,
    /// 0 = file, nonzero = directory.
    is_dir: u32,
    /// Sector pointers; [`SECTOR_NONE`] marks a hole.
    blocks: [u32; BLOCK_SLOTS],
}
const_assert!(core::mem::size_of::<RawInode>() == SECTOR_SIZE);

/// On-disk indirect sector: an array of sector pointers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct RawIndirect {
    slots: [u32; PTRS_PER_SECTOR],
}
const_assert!(core::mem::size_of::<RawIndirect>() == SECTOR_SIZE);

/// Decoded on-disk inode image, cached in memory while the inode is open.
struct DiskInode {
    length: u32,
    is_dir: bool,
    blocks: [Option<Sector>; BLOCK_SLOTS],
}

impl DiskInode {
    fn from_raw(raw: &RawInode) -> Result<Self, KernelError> {
        if raw.magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("inode magic mismatch"));
        }
        let mut blocks = [None; BLOCK_SLOTS];
        for (slot, raw) in blocks.iter_mut().zip(raw.blocks.iter()) {
            *slot = Sector::decode(*raw);
        }
        Ok(Self {
            length: raw.length,
            is_dir: raw.is_dir != 0,
            blocks,
        })
    }

    fn into_raw(&self) -> RawInode {
        let mut blocks = [SECTOR_NONE; BLOCK_SLOTS];
        for (raw, slot) in blocks.iter_mut().zip(self.blocks.iter()) {
            *raw = Sector::encode(*slot);
        }
        RawInode {
            length: self.length,
            magic: INODE_MAGIC,
            is_dir: if self.is_dir { 1 } else { 0 },
            blocks,
        }
    }
}

fn read_indirect(
    cache: &BufferCache,
    sector: Sector,
) -> Result<[Option<Sector>; PTRS_PER_SECTOR], KernelError> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector, &mut buf)?;
    let raw = RawIndirect::read_from(&buf[..])
        .ok_or(KernelError::FilesystemCorrupted("short indirect sector"))?;
    let mut slots = [None; PTRS_PER_SECTOR];
    for (slot, raw) in slots.iter_mut().zip(raw.slots.iter()) {
        *slot = Sector::decode(*raw);
    }
    Ok(slots)
}

fn write_indirect(
    cache: &BufferCache,
    sector: Sector,
    slots: &[Option<Sector>; PTRS_PER_SECTOR],
) -> Result<(), KernelError> {
    let mut raw = RawIndirect {
        slots: [SECTOR_NONE; PTRS_PER_SECTOR],
    };
    for (dst, slot) in raw.slots.iter_mut().zip(slots.iter()) {
        *dst = Sector::encode(*slot);
    }
    let mut buf = [0u8; SECTOR_SIZE];
    buf.copy_from_slice(raw.as_bytes());
    cache.write(sector, &buf)
}

/// An open inode.
///
/// Handles are `Arc<Inode>`; the filesystem's open-inode table coalesces
/// opens of the same sector onto one object. Dropping the last handle
/// flushes the inode and releases its storage if it was removed.
pub struct Inode {
    core: Arc<FsCore>,
    sector: Sector,
    state: Mutex<DiskInode>,
    removed: AtomicBool,
    deny_write_cnt: AtomicI32,
    /// Serializes directory-entry mutations when this inode is a directory.
    pub(crate) dir_lock: Mutex<()>,
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode").field("sector", &self.sector).finish()
    }
}

impl Inode {
    /// Initialize an inode image of `length` zero bytes at `sector`.
    ///
    /// All pointer slots start as holes; no data sector is allocated here.
    pub(crate) fn create(
        core: &FsCore,
        sector: Sector,
        length: usize,
        is_dir: bool,
    ) -> Result<(), KernelError> {
        if length > MAX_LENGTH {
            return Err(KernelError::FileTooLarge);
        }
        let data = DiskInode {
            length: length as u32,
            is_dir,
            blocks: [None; BLOCK_SLOTS],
        };
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(data.into_raw().as_bytes());
        core.cache.write(sector, &buf)
    }

    /// Open the inode stored at `sector`, coalescing with any live handle.
    pub(crate) fn open(core: &Arc<FsCore>, sector: Sector) -> Result<Arc<Inode>, KernelError> {
        if let Some(existing) = Self::probe(core, sector) {
            return Ok(existing);
        }

        let mut buf = [0u8; SECTOR_SIZE];
        core.cache.read(sector, &mut buf)?;
        let raw = RawInode::read_from(&buf[..])
            .ok_or(KernelError::FilesystemCorrupted("short inode sector"))?;
        let data = DiskInode::from_raw(&raw)?;

        let mut table = core.open_inodes.lock().unwrap();
        table.retain(|(_, weak)| weak.strong_count() > 0);
        // Someone may have opened the same sector while we read the disk.
        for (s, weak) in table.iter() {
            if *s == sector.0 {
                if let Some(existing) = weak.upgrade() {
                    return Ok(existing);
                }
            }
        }
        let inode = Arc::new(Inode {
            core: core.clone(),
            sector,
            state: Mutex::new(data),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicI32::new(0),
            dir_lock: Mutex::new(()),
        });
        table.push((sector.0, Arc::downgrade(&inode)));
        Ok(inode)
    }

    fn probe(core: &FsCore, sector: Sector) -> Option<Arc<Inode>> {
        let table = core.open_inodes.lock().unwrap();
        table
            .iter()
            .find(|(s, _)| *s == sector.0)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// The sector holding this inode, which doubles as its inode number.
    #[inline]
    pub fn inumber(&self) -> u32 {
        self.sector.0
    }

    /// The sector holding this inode.
    #[inline]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// File length in bytes.
    pub fn length(&self) -> usize {
        self.state.lock().unwrap().length as usize
    }

    /// Whether this inode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.state.lock().unwrap().is_dir
    }

    /// Mark the inode for deletion on last close. Removing the root fails.
    pub fn remove(&self) -> Result<(), KernelError> {
        if self.sector == ROOT_DIR_SECTOR {
            return Err(KernelError::OperationNotPermitted);
        }
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether the inode has been marked removed.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Disable writes to the inode.
    pub fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Re-enable writes; must pair with a prior [`Inode::deny_write`].
    pub fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "allow_write without deny_write");
    }

    fn write_back_image(&self, data: &DiskInode) -> Result<(), KernelError> {
        let mut buf = [0u8; SECTOR_SIZE];
        buf.copy_from_slice(data.into_raw().as_bytes());
        self.core.cache.write(self.sector, &buf)
    }

    /// Allocate a data sector and zero it through the cache.
    fn alloc_zeroed(&self) -> Result<Sector, KernelError> {
        let sector = self.core.free_map.allocate(1)?;
        if let Err(e) = self.core.cache.write(sector, &[0u8; SECTOR_SIZE]) {
            let _ = self.core.free_map.release(sector, 1);
            return Err(e);
        }
        Ok(sector)
    }

    /// Allocate a pointer sector filled with hole markers.
    fn alloc_indirect(&self) -> Result<Sector, KernelError> {
        let sector = self.core.free_map.allocate(1)?;
        let empty = [None; PTRS_PER_SECTOR];
        if let Err(e) = write_indirect(&self.core.cache, sector, &empty) {
            let _ = self.core.free_map.release(sector, 1);
            return Err(e);
        }
        Ok(sector)
    }

    /// Map a file sector index to its device sector without allocating.
    ///
    /// `Ok(None)` means the position is a hole (or past the file-size
    /// limit) and reads as zeros.
    fn block_lookup(&self, file_sector: usize) -> Result<Option<Sector>, KernelError> {
        if file_sector >= MAX_FILE_SECTOR {
            return Ok(None);
        }
        let state = self.state.lock().unwrap();
        if file_sector < INDIRECT_BEGIN {
            return Ok(state.blocks[file_sector]);
        }
        if file_sector < DBL_BEGIN {
            let Some(root) = state.blocks[INDIRECT_SLOT] else {
                return Ok(None);
            };
            let slots = read_indirect(&self.core.cache, root)?;
            return Ok(slots[file_sector - INDIRECT_BEGIN]);
        }
        let Some(root) = state.blocks[DBL_INDIRECT_SLOT] else {
            return Ok(None);
        };
        let idx = file_sector - DBL_BEGIN;
        let (outer, inner) = (idx / PTRS_PER_SECTOR, idx % PTRS_PER_SECTOR);
        let outer_slots = read_indirect(&self.core.cache, root)?;
        let Some(mid) = outer_slots[outer] else {
            return Ok(None);
        };
        let inner_slots = read_indirect(&self.core.cache, mid)?;
        Ok(inner_slots[inner])
    }

    /// Map a file sector index to its device sector, allocating the data
    /// sector and any missing pointer levels.
    ///
    /// Holds the inode lock for the whole walk, so concurrent growth of one
    /// inode is serialized.
    fn block_alloc(&self, file_sector: usize) -> Result<Sector, KernelError> {
        if file_sector >= MAX_FILE_SECTOR {
            return Err(KernelError::FileTooLarge);
        }
        let mut state = self.state.lock().unwrap();

        if file_sector < INDIRECT_BEGIN {
            if let Some(sector) = state.blocks[file_sector] {
                return Ok(sector);
            }
            let sector = self.alloc_zeroed()?;
            state.blocks[file_sector] = Some(sector);
            self.write_back_image(&state)?;
            return Ok(sector);
        }

        if file_sector < DBL_BEGIN {
            let root = match state.blocks[INDIRECT_SLOT] {
                Some(root) => root,
                None => {
                    let root = self.alloc_indirect()?;
                    state.blocks[INDIRECT_SLOT] = Some(root);
                    self.write_back_image(&state)?;
                    root
                }
            };
            let mut slots = read_indirect(&self.core.cache, root)?;
            let idx = file_sector - INDIRECT_BEGIN;
            if let Some(sector) = slots[idx] {
                return Ok(sector);
            }
            let sector = self.alloc_zeroed()?;
            slots[idx] = Some(sector);
            write_indirect(&self.core.cache, root, &slots)?;
            return Ok(sector);
        }

        let root = match state.blocks[DBL_INDIRECT_SLOT] {
            Some(root) => root,
            None => {
                let root = self.alloc_indirect()?;
                state.blocks[DBL_INDIRECT_SLOT] = Some(root);
                self.write_back_image(&state)?;
                root
            }
        };
        let idx = file_sector - DBL_BEGIN;
        let (outer, inner) = (idx / PTRS_PER_SECTOR, idx % PTRS_PER_SECTOR);
        let mut outer_slots = read_indirect(&self.core.cache, root)?;
        let mid = match outer_slots[outer] {
            Some(mid) => mid,
            None => {
                let mid = self.alloc_indirect()?;
                outer_slots[outer] = Some(mid);
                write_indirect(&self.core.cache, root, &outer_slots)?;
                mid
            }
        };
        let mut inner_slots = read_indirect(&self.core.cache, mid)?;
        if let Some(sector) = inner_slots[inner] {
            return Ok(sector);
        }
        let sector = self.alloc_zeroed()?;
        inner_slots[inner] = Some(sector);
        write_indirect(&self.core.cache, mid, &inner_slots)?;
        Ok(sector)
    }

    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns the number of bytes read, short at end of file. Holes read
    /// as zeros.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize, KernelError> {
        let length = self.length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(length - offset);
        let mut read = 0;
        while read < max {
            let pos = offset + read;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (max - read).min(SECTOR_SIZE - sector_ofs);
            match self.block_lookup(pos / SECTOR_SIZE)? {
                None => buf[read..read + chunk].fill(0),
                Some(sector) if sector_ofs == 0 && chunk == SECTOR_SIZE => {
                    let dst = (&mut buf[read..read + SECTOR_SIZE]).try_into().unwrap();
                    self.core.cache.read(sector, dst)?;
                }
                Some(sector) => {
                    let mut bounce = [0u8; SECTOR_SIZE];
                    self.core.cache.read(sector, &mut bounce)?;
                    buf[read..read + chunk]
                        .copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
                }
            }
            read += chunk;
        }
        Ok(read)
    }

    /// Write `buf` starting at `offset`, growing the file as needed.
    ///
    /// Returns the number of bytes written, which is short only at the
    /// file-size limit or on an allocation failure after partial progress.
    /// A write entirely past the limit, or any failure before the first
    /// byte lands, is an error. Writes while writes are denied return 0.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, KernelError> {
        if self.deny_write_cnt.load(Ordering::SeqCst) > 0 {
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= MAX_LENGTH {
            return Err(KernelError::FileTooLarge);
        }
        let max = buf.len().min(MAX_LENGTH - offset);
        let mut written = 0;
        while written < max {
            let pos = offset + written;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (max - written).min(SECTOR_SIZE - sector_ofs);
            let sector = match self.block_alloc(pos / SECTOR_SIZE) {
                Ok(sector) => sector,
                Err(e) => {
                    if written > 0 {
                        break;
                    }
                    return Err(e);
                }
            };
            let res = if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src = (&buf[written..written + SECTOR_SIZE]).try_into().unwrap();
                self.core.cache.write(sector, src)
            } else {
                // The sector may hold data before or after the chunk; read,
                // splice, write back.
                let mut bounce = [0u8; SECTOR_SIZE];
                self.core
                    .cache
                    .read(sector, &mut bounce)
                    .and_then(|()| {
                        bounce[sector_ofs..sector_ofs + chunk]
                            .copy_from_slice(&buf[written..written + chunk]);
                        self.core.cache.write(sector, &bounce)
                    })
            };
            if let Err(e) = res {
                if written > 0 {
                    break;
                }
                return Err(e);
            }
            written += chunk;

            // Extend the recorded length once the data is in place. Length
            // is monotone non-decreasing under the inode lock.
            let end = (pos + chunk) as u32;
            let mut state = self.state.lock().unwrap();
            if end > state.length {
                state.length = end;
                self.write_back_image(&state)?;
            }
        }
        Ok(written)
    }

    /// Visit every sector materialized by this inode: the inode sector,
    /// each pointer sector, and each allocated data sector.
    fn walk_sectors(
        &self,
        state: &MutexGuard<'_, DiskInode>,
        mut visit: impl FnMut(Sector) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        visit(self.sector)?;
        for slot in state.blocks[..DIRECT_COUNT].iter().flatten() {
            visit(*slot)?;
        }
        if let Some(root) = state.blocks[INDIRECT_SLOT] {
            visit(root)?;
            for leaf in read_indirect(&self.core.cache, root)?.iter().flatten() {
                visit(*leaf)?;
            }
        }
        if let Some(root) = state.blocks[DBL_INDIRECT_SLOT] {
            visit(root)?;
            for mid in read_indirect(&self.core.cache, root)?.iter().flatten() {
                visit(*mid)?;
                for leaf in read_indirect(&self.core.cache, *mid)?.iter().flatten() {
                    visit(*leaf)?;
                }
            }
        }
        Ok(())
    }

    /// Write back every dirty cache entry belonging to this inode.
    pub fn flush(&self) -> Result<(), KernelError> {
        let state = self.state.lock().unwrap();
        self.walk_sectors(&state, |sector| self.core.cache.flush_sector(sector))
    }

    /// Return all sectors of a removed inode to the free map.
    fn release_storage(&self) {
        let state = self.state.lock().unwrap();
        let result = self.walk_sectors(&state, |sector| self.core.free_map.release(sector, 1));
        if let Err(e) = result {
            warn!(
                "inode {}: releasing storage failed: {}",
                self.sector.0, e
            );
        }
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("inode {}: flush on close failed: {}", self.sector.0, e);
        }
        {
            let mut table = self.core.open_inodes.lock().unwrap();
            table.retain(|(_, weak)| weak.strong_count() > 0);
        }
        if self.is_removed() {
            debug!("inode {}: last close of removed inode", self.sector.0);
            self.release_storage();
        }
    }
}
