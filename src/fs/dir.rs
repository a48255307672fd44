//! Directory entries.
//!
//! A directory is an inode whose data is an array of fixed-size entries,
//! 16 per sector. An entry holds the target inode's sector number and a
//! short name; the sector field doubles as the occupancy marker, with the
//! hole sentinel meaning "unused slot". Every directory carries `"."` and
//! `".."` entries, written when it is created.
//!
//! Entry mutations serialize on the owning inode's directory lock; reads
//! go through the ordinary inode read path and need no extra locking.

use super::inode::Inode;
use super::FsCore;
use crate::dev::{Sector, SECTOR_NONE, SECTOR_SIZE};
use crate::KernelError;
use static_assertions::const_assert;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Longest representable entry name.
pub const NAME_MAX: usize = 27;

/// On-disk directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
struct RawEntry {
    /// Sector of the entry's inode; [`SECTOR_NONE`] marks an unused slot.
    inode_sector: u32,
    name_len: u8,
    name: [u8; NAME_MAX],
}
const_assert!(core::mem::size_of::<RawEntry>() == 32);
const_assert!(SECTOR_SIZE % core::mem::size_of::<RawEntry>() == 0);

const ENTRY_SIZE: usize = core::mem::size_of::<RawEntry>();

impl RawEntry {
    fn unused() -> Self {
        Self {
            inode_sector: SECTOR_NONE,
            name_len: 0,
            name: [0; NAME_MAX],
        }
    }

    fn new(name: &str, sector: Sector) -> Result<Self, KernelError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if bytes.len() > NAME_MAX {
            return Err(KernelError::NameTooLong);
        }
        let mut entry = Self::unused();
        entry.inode_sector = sector.0;
        entry.name_len = bytes.len() as u8;
        entry.name[..bytes.len()].copy_from_slice(bytes);
        Ok(entry)
    }

    fn sector(&self) -> Option<Sector> {
        Sector::decode(self.inode_sector)
    }

    fn name(&self) -> Option<&str> {
        if self.inode_sector == SECTOR_NONE {
            return None;
        }
        core::str::from_utf8(&self.name[..self.name_len as usize]).ok()
    }
}

/// A handle over a directory inode.
#[derive(Clone)]
pub struct Directory {
    inode: Arc<Inode>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory").field("inode", &self.inode).finish()
    }
}

impl Directory {
    /// Wrap a directory inode; fails on a regular file.
    pub fn new(inode: Arc<Inode>) -> Result<Self, KernelError> {
        if !inode.is_dir() {
            return Err(KernelError::NotDirectory);
        }
        Ok(Self { inode })
    }

    /// The underlying inode.
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Create a directory inode at `sector` with `.` and `..` entries.
    pub(crate) fn create(
        core: &Arc<FsCore>,
        sector: Sector,
        parent: Sector,
    ) -> Result<Directory, KernelError> {
        Inode::create(core, sector, 0, true)?;
        let dir = Directory::new(Inode::open(core, sector)?)?;
        dir.add_entry(".", sector)?;
        dir.add_entry("..", parent)?;
        Ok(dir)
    }

    fn entry_at(&self, index: usize) -> Result<Option<RawEntry>, KernelError> {
        let mut buf = [0u8; ENTRY_SIZE];
        let n = self.inode.read_at(&mut buf, index * ENTRY_SIZE)?;
        if n < ENTRY_SIZE {
            return Ok(None);
        }
        Ok(Some(RawEntry::read_from(&buf[..]).unwrap()))
    }

    fn write_entry(&self, index: usize, entry: &RawEntry) -> Result<(), KernelError> {
        let written = self.inode.write_at(entry.as_bytes(), index * ENTRY_SIZE)?;
        if written != ENTRY_SIZE {
            return Err(KernelError::NoSpace);
        }
        Ok(())
    }

    fn entry_count(&self) -> usize {
        self.inode.length() / ENTRY_SIZE
    }

    fn find(&self, name: &str) -> Result<Option<(usize, RawEntry)>, KernelError> {
        for index in 0..self.entry_count() {
            if let Some(entry) = self.entry_at(index)? {
                if entry.name() == Some(name) {
                    return Ok(Some((index, entry)));
                }
            }
        }
        Ok(None)
    }

    /// Look a name up, returning the inode sector it refers to.
    pub fn lookup(&self, name: &str) -> Result<Option<Sector>, KernelError> {
        Ok(self.find(name)?.and_then(|(_, e)| e.sector()))
    }

    /// Add an entry mapping `name` to `sector`.
    ///
    /// Fails with [`KernelError::FileExist`] when the name is taken. Unused
    /// slots are reused before the directory grows.
    pub fn add_entry(&self, name: &str, sector: Sector) -> Result<(), KernelError> {
        let entry = RawEntry::new(name, sector)?;
        let _guard = self.inode.dir_lock.lock().unwrap();
        if self.find(name)?.is_some() {
            return Err(KernelError::FileExist);
        }
        let mut slot = self.entry_count();
        for index in 0..self.entry_count() {
            match self.entry_at(index)? {
                Some(e) if e.sector().is_none() => {
                    slot = index;
                    break;
                }
                _ => {}
            }
        }
        self.write_entry(slot, &entry)
    }

    /// Remove the entry for `name`. `.` and `..` are not removable.
    pub fn remove_entry(&self, name: &str) -> Result<(), KernelError> {
        if name == "." || name == ".." {
            return Err(KernelError::InvalidArgument);
        }
        let _guard = self.inode.dir_lock.lock().unwrap();
        let (index, _) = self.find(name)?.ok_or(KernelError::NoSuchEntry)?;
        self.write_entry(index, &RawEntry::unused())
    }

    /// List the directory's names, excluding `.` and `..`.
    pub fn read_dir(&self) -> Result<Vec<(u32, String)>, KernelError> {
        let mut out = Vec::new();
        for index in 0..self.entry_count() {
            if let Some(entry) = self.entry_at(index)? {
                if let (Some(name), Some(sector)) = (entry.name(), entry.sector()) {
                    if name != "." && name != ".." {
                        out.push((sector.0, name.to_string()));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Whether the directory holds nothing besides `.` and `..`.
    pub fn is_empty(&self) -> Result<bool, KernelError> {
        Ok(self.read_dir()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::{Disk, DiskRole, MemDisk};
    use crate::fs::cache::BufferCache;
    use crate::fs::free_map::FreeMap;
    use crate::fs::ROOT_DIR_SECTOR;
    use std::sync::Mutex;

    fn test_core(sectors: usize) -> Arc<FsCore> {
        let cache = Arc::new(BufferCache::new(
            Disk::new(MemDisk::new(sectors), DiskRole::FileSys),
            16,
        ));
        let free_map = FreeMap::create(cache.clone(), sectors).unwrap();
        Arc::new(FsCore {
            cache,
            free_map,
            open_inodes: Mutex::new(Vec::new()),
        })
    }

    fn root(core: &Arc<FsCore>) -> Directory {
        Directory::create(core, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR).unwrap()
    }

    #[test]
    fn dot_entries_exist_at_creation() {
        let core = test_core(256);
        let dir = root(&core);
        assert_eq!(dir.lookup(".").unwrap(), Some(ROOT_DIR_SECTOR));
        assert_eq!(dir.lookup("..").unwrap(), Some(ROOT_DIR_SECTOR));
        assert!(dir.is_empty().unwrap());
    }

    #[test]
    fn add_lookup_remove() {
        let core = test_core(256);
        let dir = root(&core);
        dir.add_entry("alpha", Sector(9)).unwrap();
        dir.add_entry("beta", Sector(10)).unwrap();

        assert_eq!(dir.lookup("alpha").unwrap(), Some(Sector(9)));
        assert_eq!(dir.lookup("beta").unwrap(), Some(Sector(10)));
        assert_eq!(dir.lookup("gamma").unwrap(), None);

        assert_eq!(dir.add_entry("alpha", Sector(11)), Err(KernelError::FileExist));

        dir.remove_entry("alpha").unwrap();
        assert_eq!(dir.lookup("alpha").unwrap(), None);
        assert_eq!(dir.remove_entry("alpha"), Err(KernelError::NoSuchEntry));
    }

    #[test]
    fn removed_slots_are_reused() {
        let core = test_core(256);
        let dir = root(&core);
        dir.add_entry("one", Sector(5)).unwrap();
        let len = dir.inode().length();
        dir.remove_entry("one").unwrap();
        dir.add_entry("two", Sector(6)).unwrap();
        assert_eq!(dir.inode().length(), len, "slot reuse must not grow the directory");
    }

    #[test]
    fn dot_entries_are_protected() {
        let core = test_core(256);
        let dir = root(&core);
        assert_eq!(dir.remove_entry("."), Err(KernelError::InvalidArgument));
        assert_eq!(dir.remove_entry(".."), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn long_names_are_rejected() {
        let core = test_core(256);
        let dir = root(&core);
        let long = "x".repeat(NAME_MAX + 1);
        assert_eq!(
            dir.add_entry(&long, Sector(9)),
            Err(KernelError::NameTooLong)
        );
        let fits = "y".repeat(NAME_MAX);
        dir.add_entry(&fits, Sector(9)).unwrap();
        assert_eq!(dir.lookup(&fits).unwrap(), Some(Sector(9)));
    }

    #[test]
    fn read_dir_lists_live_entries() {
        let core = test_core(256);
        let dir = root(&core);
        dir.add_entry("a", Sector(3)).unwrap();
        dir.add_entry("b", Sector(4)).unwrap();
        dir.remove_entry("a").unwrap();

        let names: Vec<String> = dir.read_dir().unwrap().into_iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }

    #[test]
    fn non_directory_is_refused() {
        let core = test_core(256);
        let sector = core.free_map.allocate(1).unwrap();
        Inode::create(&core, sector, 0, false).unwrap();
        let file = Inode::open(&core, sector).unwrap();
        assert!(matches!(
            Directory::new(file),
            Err(KernelError::NotDirectory)
        ));
    }
}
