//! Free map.
//!
//! One bit per device sector, persisted in [`FREE_MAP_SECTOR`] through the
//! buffer cache (where that sector is pinned, so updates never wait on an
//! eviction). A set bit means the sector is in use. Allocation is
//! first-fit over a contiguous run of clear bits.
//!
//! A single bitmap sector bounds the filesystem device at
//! `SECTOR_SIZE * 8` sectors; `format` checks the device fits.

use super::FREE_MAP_SECTOR;
use crate::dev::{Sector, SECTOR_SIZE};
use crate::fs::cache::BufferCache;
use crate::KernelError;
use std::sync::{Arc, Mutex};

/// Maximum number of device sectors one bitmap sector can track.
pub const FREE_MAP_CAPACITY: usize = SECTOR_SIZE * 8;

const WORDS: usize = SECTOR_SIZE / 8;

struct Bitmap {
    bits: [u64; WORDS],
    sector_count: usize,
}

impl Bitmap {
    fn test(&self, pos: usize) -> bool {
        let (word, off) = (pos / 64, pos % 64);
        self.bits[word] & (1 << off) != 0
    }

    fn set(&mut self, pos: usize) {
        let (word, off) = (pos / 64, pos % 64);
        self.bits[word] |= 1 << off;
    }

    fn clear(&mut self, pos: usize) {
        let (word, off) = (pos / 64, pos % 64);
        self.bits[word] &= !(1 << off);
    }
}

/// The persistent sector allocator.
pub struct FreeMap {
    cache: Arc<BufferCache>,
    inner: Mutex<Bitmap>,
}

impl FreeMap {
    /// Build a fresh map for a `sector_count`-sector device, with the
    /// bitmap sector and the root-directory sector already marked used.
    pub fn create(cache: Arc<BufferCache>, sector_count: usize) -> Result<Self, KernelError> {
        if sector_count > FREE_MAP_CAPACITY {
            return Err(KernelError::InvalidArgument);
        }
        let mut bitmap = Bitmap {
            bits: [0; WORDS],
            sector_count,
        };
        // Sectors beyond the device are permanently "used".
        for pos in sector_count..FREE_MAP_CAPACITY {
            bitmap.set(pos);
        }
        bitmap.set(FREE_MAP_SECTOR.into_usize());
        bitmap.set(super::ROOT_DIR_SECTOR.into_usize());
        let map = Self {
            cache,
            inner: Mutex::new(bitmap),
        };
        map.write_back()?;
        Ok(map)
    }

    /// Load the map persisted at [`FREE_MAP_SECTOR`].
    pub fn load(cache: Arc<BufferCache>, sector_count: usize) -> Result<Self, KernelError> {
        if sector_count > FREE_MAP_CAPACITY {
            return Err(KernelError::InvalidArgument);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(FREE_MAP_SECTOR, &mut buf)?;
        let mut bits = [0u64; WORDS];
        for (word, chunk) in bits.iter_mut().zip(buf.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        let bitmap = Bitmap { bits, sector_count };
        if !bitmap.test(FREE_MAP_SECTOR.into_usize()) {
            return Err(KernelError::FilesystemCorrupted("free map sector is free"));
        }
        Ok(Self {
            cache,
            inner: Mutex::new(bitmap),
        })
    }

    fn write_back(&self) -> Result<(), KernelError> {
        let mut buf = [0u8; SECTOR_SIZE];
        {
            let bitmap = self.inner.lock().unwrap();
            for (word, chunk) in bitmap.bits.iter().zip(buf.chunks_exact_mut(8)) {
                chunk.copy_from_slice(&word.to_le_bytes());
            }
        }
        self.cache.write(FREE_MAP_SECTOR, &buf)
    }

    /// Allocate a contiguous run of `cnt` sectors, first fit.
    pub fn allocate(&self, cnt: usize) -> Result<Sector, KernelError> {
        debug_assert!(cnt > 0);
        let start = {
            let mut bitmap = self.inner.lock().unwrap();
            let mut run = 0;
            let mut start = 0;
            let mut found = None;
            for pos in 0..bitmap.sector_count {
                if bitmap.test(pos) {
                    run = 0;
                    continue;
                }
                if run == 0 {
                    start = pos;
                }
                run += 1;
                if run == cnt {
                    found = Some(start);
                    break;
                }
            }
            let start = found.ok_or(KernelError::NoSpace)?;
            for pos in start..start + cnt {
                bitmap.set(pos);
            }
            start
        };
        self.write_back()?;
        Ok(Sector(start as u32))
    }

    /// Return a run of sectors to the map.
    pub fn release(&self, sector: Sector, cnt: usize) -> Result<(), KernelError> {
        {
            let mut bitmap = self.inner.lock().unwrap();
            for pos in sector.into_usize()..sector.into_usize() + cnt {
                debug_assert!(bitmap.test(pos), "releasing a free sector");
                bitmap.clear(pos);
            }
        }
        self.write_back()
    }

    /// Whether `sector` is currently allocated.
    pub fn is_allocated(&self, sector: Sector) -> bool {
        self.inner.lock().unwrap().test(sector.into_usize())
    }

    /// Number of free sectors left.
    pub fn free_sectors(&self) -> usize {
        let bitmap = self.inner.lock().unwrap();
        (0..bitmap.sector_count).filter(|&p| !bitmap.test(p)).count()
    }
}
