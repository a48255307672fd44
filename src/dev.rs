//! Block devices.
//!
//! Disks are exposed to the rest of the kernel as [`Disk`] handles: a
//! sector-addressed byte sink with a role tag that tells the mount code
//! whether the device backs the filesystem or the swap area. The actual
//! driver is anything implementing [`BlockDevice`]; [`MemDisk`] is the
//! RAM-backed implementation used by the test harness.

use crate::KernelError;
use std::sync::{Arc, Mutex};

/// Size of one disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector, the access granularity of a disk.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Sector(pub u32);

/// On-disk sentinel for "no sector" in block pointer slots.
pub const SECTOR_NONE: u32 = u32::MAX;

impl Sector {
    /// Get the byte offset represented by the sector.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.0 as usize * SECTOR_SIZE
    }

    /// Cast into usize.
    #[inline]
    pub fn into_usize(self) -> usize {
        self.0 as usize
    }

    /// Decode an on-disk slot value into an optional sector.
    #[inline]
    pub fn decode(raw: u32) -> Option<Sector> {
        if raw == SECTOR_NONE {
            None
        } else {
            Some(Sector(raw))
        }
    }

    /// Encode an optional sector into its on-disk slot value.
    #[inline]
    pub fn encode(sector: Option<Sector>) -> u32 {
        match sector {
            Some(s) => s.0,
            None => SECTOR_NONE,
        }
    }
}

impl core::ops::Add<u32> for Sector {
    type Output = Self;

    fn add(self, rhs: u32) -> Self {
        Self(self.0 + rhs)
    }
}

/// The role a disk plays in the system.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DiskRole {
    /// Holds the filesystem (free map, inodes, data).
    FileSys,
    /// Holds evicted page contents.
    Swap,
}

/// A driver for a sector-addressed device.
///
/// Implementations must be usable from multiple threads; the cache and the
/// swap area both issue I/O concurrently.
pub trait BlockDevice: Send + Sync {
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Read one sector into `buf`.
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError>;

    /// Write one sector from `buf`.
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError>;
}

/// The type for disk hooking.
///
/// Hooks observe every sector transfer (`is_write` distinguishes the
/// direction) before it reaches the driver and may fail it. The test
/// harness uses hooks to count physical I/O.
pub type Hook = Arc<dyn Fn(Sector, &[u8; SECTOR_SIZE], bool) -> Result<(), KernelError> + Send + Sync>;

/// A disk, a device that has a byte sink.
#[derive(Clone)]
pub struct Disk {
    device: Arc<dyn BlockDevice>,
    role: DiskRole,
    is_ro: bool,
    hook: Option<Hook>,
}

impl Disk {
    /// Create a new disk handle over a device.
    pub fn new(device: Arc<dyn BlockDevice>, role: DiskRole) -> Self {
        Self {
            device,
            role,
            is_ro: false,
            hook: None,
        }
    }

    /// Make the disk read-only.
    pub fn ro(self) -> Self {
        Self { is_ro: true, ..self }
    }

    /// Add a hook for the disk.
    pub fn hook(self, hook: Hook) -> Self {
        Self {
            hook: Some(hook),
            ..self
        }
    }

    /// The role this disk was attached with.
    #[inline]
    pub fn role(&self) -> DiskRole {
        self.role
    }

    /// Number of sectors on the underlying device.
    #[inline]
    pub fn sector_count(&self) -> usize {
        self.device.sector_count()
    }

    /// Read [`SECTOR_SIZE`] bytes from the disk at `sector`.
    pub fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if sector.into_usize() >= self.sector_count() {
            return Err(KernelError::IOError);
        }
        self.device.read(sector, buf)?;
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, false)?;
        }
        Ok(())
    }

    /// Write [`SECTOR_SIZE`] bytes to the disk at `sector`.
    pub fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        if self.is_ro {
            return Err(KernelError::NotSupportedOperation);
        }
        if sector.into_usize() >= self.sector_count() {
            return Err(KernelError::IOError);
        }
        if let Some(hook) = self.hook.as_ref() {
            hook(sector, buf, true)?;
        }
        self.device.write(sector, buf)
    }
}

/// A RAM-backed block device.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    /// Create a zero-filled device with `sector_count` sectors.
    pub fn new(sector_count: usize) -> Arc<Self> {
        info!("MemDisk: creating device with {} sectors", sector_count);
        Arc::new(Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors
            .get(sector.into_usize())
            .ok_or(KernelError::IOError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors
            .get_mut(sector.into_usize())
            .ok_or(KernelError::IOError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sector_codec_round_trip() {
        assert_eq!(Sector::decode(SECTOR_NONE), None);
        assert_eq!(Sector::decode(7), Some(Sector(7)));
        assert_eq!(Sector::encode(None), SECTOR_NONE);
        assert_eq!(Sector::encode(Some(Sector(7))), 7);
        assert_eq!(Sector(3).into_offset(), 3 * SECTOR_SIZE);
    }

    #[test]
    fn mem_disk_read_write() {
        let dev = MemDisk::new(8);
        let disk = Disk::new(dev, DiskRole::FileSys);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xa5;
        buf[511] = 0x5a;
        disk.write(Sector(3), &buf).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(Sector(3), &mut out).unwrap();
        assert_eq!(buf, out);

        assert_eq!(disk.read(Sector(8), &mut out), Err(KernelError::IOError));
    }

    #[test]
    fn read_only_disk_rejects_writes() {
        let dev = MemDisk::new(2);
        let disk = Disk::new(dev, DiskRole::FileSys).ro();
        let buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.write(Sector(0), &buf),
            Err(KernelError::NotSupportedOperation)
        );
    }

    #[test]
    fn hooks_observe_transfers() {
        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let (r, w) = (reads.clone(), writes.clone());

        let dev = MemDisk::new(4);
        let disk = Disk::new(dev, DiskRole::Swap).hook(Arc::new(move |_, _, is_write| {
            if is_write {
                w.fetch_add(1, Ordering::SeqCst);
            } else {
                r.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));

        let mut buf = [0u8; SECTOR_SIZE];
        disk.write(Sector(1), &buf).unwrap();
        disk.write(Sector(2), &buf).unwrap();
        disk.read(Sector(1), &mut buf).unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }
}
