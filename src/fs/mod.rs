//! Filesystem core.
//!
//! Layering, bottom up: a [`Disk`] provides sectors; the [`BufferCache`]
//! fronts it with write-behind and a background [`Flusher`]; the
//! [`FreeMap`] allocates sectors; the [`Inode`] engine builds sparse files
//! on top; [`Directory`] stores name-to-inode entries in directory inodes;
//! [`FileSys`] ties them together and resolves paths.
//!
//! Two sectors have fixed roles: sector 0 persists the free map, sector 1
//! holds the root directory inode. Both are pinned in the cache.
//!
//! [`FileSys`] is the single init/shutdown point: [`FileSys::format`] or
//! [`FileSys::mount`] brings every layer up (including the flusher task);
//! [`FileSys::shutdown`] -- or dropping the value -- stops the flusher and
//! sweeps every dirty cache entry to the device.

pub mod cache;
pub mod dir;
pub mod free_map;
pub mod inode;

pub use cache::{BufferCache, Flusher, CACHE_SIZE, T_FLUSH};
pub use dir::Directory;
pub use free_map::FreeMap;
pub use inode::Inode;

use crate::dev::{Disk, DiskRole, Sector};
use crate::KernelError;
use std::sync::{Arc, Mutex, Weak};

/// Sector persisting the free-map bitmap. Pinned in the cache.
pub const FREE_MAP_SECTOR: Sector = Sector(0);
/// Sector holding the root directory inode. Pinned in the cache.
pub const ROOT_DIR_SECTOR: Sector = Sector(1);

/// Shared state of a mounted filesystem: the cache, the allocator, and the
/// open-inode table that coalesces inode handles.
pub(crate) struct FsCore {
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) free_map: FreeMap,
    pub(crate) open_inodes: Mutex<Vec<(u32, Weak<Inode>)>>,
}

/// A mounted filesystem.
pub struct FileSys {
    core: Arc<FsCore>,
    flusher: Option<Flusher>,
}

/// Split a path into components. `/` and `\` both separate; empty
/// components (from doubled or trailing separators) are dropped.
fn components(path: &str) -> Vec<&str> {
    path.split(|c| c == '/' || c == '\\')
        .filter(|s| !s.is_empty())
        .collect()
}

impl FileSys {
    /// Create a fresh filesystem on `disk` and mount it.
    pub fn format(disk: Disk, cache_entries: usize) -> Result<FileSys, KernelError> {
        if disk.role() != DiskRole::FileSys {
            return Err(KernelError::InvalidArgument);
        }
        let sector_count = disk.sector_count();
        info!("filesys: formatting {} sectors", sector_count);
        let cache = Arc::new(BufferCache::new(disk, cache_entries));
        let free_map = FreeMap::create(cache.clone(), sector_count)?;
        let core = Arc::new(FsCore {
            cache,
            free_map,
            open_inodes: Mutex::new(Vec::new()),
        });
        Directory::create(&core, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR)?;
        Ok(Self::bring_up(core))
    }

    /// Mount the filesystem persisted on `disk`.
    pub fn mount(disk: Disk, cache_entries: usize) -> Result<FileSys, KernelError> {
        if disk.role() != DiskRole::FileSys {
            return Err(KernelError::InvalidArgument);
        }
        let sector_count = disk.sector_count();
        let cache = Arc::new(BufferCache::new(disk, cache_entries));
        let free_map = FreeMap::load(cache.clone(), sector_count)?;
        let core = Arc::new(FsCore {
            cache,
            free_map,
            open_inodes: Mutex::new(Vec::new()),
        });
        // The root inode must parse; this is the mount-time sanity check.
        let root = Inode::open(&core, ROOT_DIR_SECTOR)?;
        if !root.is_dir() {
            return Err(KernelError::FilesystemCorrupted("root is not a directory"));
        }
        info!("filesys: mounted, {} sectors free", core.free_map.free_sectors());
        Ok(Self::bring_up(core))
    }

    fn bring_up(core: Arc<FsCore>) -> FileSys {
        let flusher = Flusher::spawn(core.cache.clone());
        FileSys {
            core,
            flusher: Some(flusher),
        }
    }

    /// The root directory.
    pub fn root(&self) -> Result<Directory, KernelError> {
        Directory::new(Inode::open(&self.core, ROOT_DIR_SECTOR)?)
    }

    /// The buffer cache backing this filesystem.
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.core.cache
    }

    /// Number of free sectors.
    pub fn free_sectors(&self) -> usize {
        self.core.free_map.free_sectors()
    }

    /// Resolve all but the last component of `path`.
    ///
    /// Returns the containing directory and the last component's name.
    /// `/` (and any all-separator path) resolves to the root directory with
    /// an empty name; the empty path is an error.
    pub fn open_path(&self, path: &str) -> Result<(Directory, String), KernelError> {
        if path.is_empty() {
            return Err(KernelError::NoSuchEntry);
        }
        let comps = components(path);
        let Some((last, parents)) = comps.split_last() else {
            return Ok((self.root()?, String::new()));
        };
        let mut dir = self.root()?;
        for part in parents {
            let sector = dir.lookup(part)?.ok_or(KernelError::NoSuchEntry)?;
            dir = Directory::new(Inode::open(&self.core, sector)?)?;
        }
        Ok((dir, last.to_string()))
    }

    /// Open the inode at `path`.
    pub fn open(&self, path: &str) -> Result<Arc<Inode>, KernelError> {
        let (dir, last) = self.open_path(path)?;
        if last.is_empty() {
            return Ok(dir.inode().clone());
        }
        let sector = dir.lookup(&last)?.ok_or(KernelError::NoSuchEntry)?;
        Inode::open(&self.core, sector)
    }

    fn create_at(&self, path: &str, length: usize, is_dir: bool) -> Result<Arc<Inode>, KernelError> {
        let (dir, last) = self.open_path(path)?;
        if last.is_empty() {
            return Err(KernelError::FileExist);
        }
        let sector = self.core.free_map.allocate(1)?;
        let created = if is_dir {
            Directory::create(&self.core, sector, dir.inode().sector())
                .map(|d| d.inode().clone())
        } else {
            Inode::create(&self.core, sector, length, false)
                .and_then(|()| Inode::open(&self.core, sector))
        };
        let inode = match created {
            Ok(inode) => inode,
            Err(e) => {
                let _ = self.core.free_map.release(sector, 1);
                return Err(e);
            }
        };
        if let Err(e) = dir.add_entry(&last, sector) {
            // Roll the inode back; marking it removed releases the sector
            // when the handle drops.
            let _ = inode.remove();
            return Err(e);
        }
        Ok(inode)
    }

    /// Create a regular file of `length` zero bytes at `path`.
    pub fn create_file(&self, path: &str, length: usize) -> Result<Arc<Inode>, KernelError> {
        self.create_at(path, length, false)
    }

    /// Create a directory at `path`.
    pub fn create_dir(&self, path: &str) -> Result<Directory, KernelError> {
        self.create_at(path, 0, true).and_then(Directory::new)
    }

    /// Remove the file or directory at `path`.
    ///
    /// Directories must be empty. The inode's storage is reclaimed when the
    /// last open handle drops; removing `/` is refused.
    pub fn remove(&self, path: &str) -> Result<(), KernelError> {
        let (dir, last) = self.open_path(path)?;
        if last.is_empty() {
            return Err(KernelError::OperationNotPermitted);
        }
        let sector = dir.lookup(&last)?.ok_or(KernelError::NoSuchEntry)?;
        let inode = Inode::open(&self.core, sector)?;
        if inode.is_dir() {
            let victim = Directory::new(inode.clone())?;
            if !victim.is_empty()? {
                return Err(KernelError::DirectoryNotEmpty);
            }
        }
        inode.remove()?;
        dir.remove_entry(&last)
    }

    /// Unmount: stop the flusher and write every dirty entry back.
    pub fn shutdown(mut self) {
        self.do_shutdown();
    }

    fn do_shutdown(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            info!("filesys: shutting down");
            flusher.stop();
        }
    }
}

impl Drop for FileSys {
    fn drop(&mut self) {
        self.do_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{MemDisk, SECTOR_SIZE};

    fn fresh_fs(sectors: usize) -> FileSys {
        let disk = Disk::new(MemDisk::new(sectors), DiskRole::FileSys);
        FileSys::format(disk, 16).unwrap()
    }

    #[test]
    fn format_then_create_open_read() {
        let fs = fresh_fs(512);
        let file = fs.create_file("/hello.txt", 0).unwrap();
        file.write_at(b"hello filesystem", 0).unwrap();

        let again = fs.open("/hello.txt").unwrap();
        assert!(Arc::ptr_eq(&file, &again), "open must coalesce");
        let mut out = [0u8; 16];
        again.read_at(&mut out, 0).unwrap();
        assert_eq!(&out, b"hello filesystem");
    }

    #[test]
    fn nested_directories_and_both_separators() {
        let fs = fresh_fs(512);
        fs.create_dir("/a").unwrap();
        fs.create_dir("/a/b").unwrap();
        fs.create_file("/a/b/c.txt", 0).unwrap();

        // Backslashes are accepted as separators.
        let inode = fs.open("\\a\\b\\c.txt").unwrap();
        assert!(!inode.is_dir());

        // Dot components resolve through the recorded entries.
        let inode = fs.open("/a/b/./../b/c.txt").unwrap();
        assert!(!inode.is_dir());

        assert_eq!(fs.open("/a/missing").unwrap_err(), KernelError::NoSuchEntry);
        assert_eq!(
            fs.open("/a/b/c.txt/d").unwrap_err(),
            KernelError::NotDirectory
        );
    }

    #[test]
    fn open_path_returns_containing_dir_and_name() {
        let fs = fresh_fs(512);
        fs.create_dir("/sub").unwrap();
        let (dir, last) = fs.open_path("/sub/name.txt").unwrap();
        assert_eq!(last, "name.txt");
        assert_eq!(dir.inode().sector(), fs.open("/sub").unwrap().sector());

        let (root, empty) = fs.open_path("/").unwrap();
        assert_eq!(root.inode().sector(), ROOT_DIR_SECTOR);
        assert_eq!(empty, "");

        assert_eq!(fs.open_path("").unwrap_err(), KernelError::NoSuchEntry);
    }

    #[test]
    fn duplicate_create_fails() {
        let fs = fresh_fs(512);
        fs.create_file("/dup", 0).unwrap();
        assert_eq!(fs.create_file("/dup", 0).unwrap_err(), KernelError::FileExist);
    }

    #[test]
    fn remove_semantics() {
        let fs = fresh_fs(512);
        fs.create_file("/f", 0).unwrap();
        fs.create_dir("/d").unwrap();
        fs.create_file("/d/inner", 0).unwrap();

        assert_eq!(fs.remove("/"), Err(KernelError::OperationNotPermitted));
        assert_eq!(fs.remove("/d"), Err(KernelError::DirectoryNotEmpty));

        fs.remove("/d/inner").unwrap();
        fs.remove("/d").unwrap();
        fs.remove("/f").unwrap();
        assert_eq!(fs.open("/f").unwrap_err(), KernelError::NoSuchEntry);
    }

    #[test]
    fn removal_reclaims_sectors_after_last_close() {
        let fs = fresh_fs(512);
        let before = fs.free_sectors();
        {
            let file = fs.create_file("/big", 0).unwrap();
            file.write_at(&vec![1u8; 16 * SECTOR_SIZE], 0).unwrap();
            fs.remove("/big").unwrap();
            // Still open: storage not yet reclaimed.
            assert!(fs.free_sectors() < before);
        }
        assert_eq!(fs.free_sectors(), before);
    }

    #[test]
    fn contents_survive_remount() {
        let device = MemDisk::new(512);
        {
            let fs =
                FileSys::format(Disk::new(device.clone(), DiskRole::FileSys), 16).unwrap();
            fs.create_dir("/persist").unwrap();
            let f = fs.create_file("/persist/data", 0).unwrap();
            f.write_at(b"across the reboot", 0).unwrap();
            fs.shutdown();
        }
        let fs = FileSys::mount(Disk::new(device, DiskRole::FileSys), 16).unwrap();
        let f = fs.open("/persist/data").unwrap();
        let mut out = [0u8; 17];
        f.read_at(&mut out, 0).unwrap();
        assert_eq!(&out, b"across the reboot");
    }
}
