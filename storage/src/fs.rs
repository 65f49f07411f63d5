//! Filesystem Facade (component J, §4.J): composes the free-map, buffer
//! cache, inode engine, and directory layer into `create`/`open`/
//! `remove`/`chdir`, and owns filesystem-wide bootstrap.
//!
//! Grounded in `filesys.c`'s `filesys_init`/`filesys_create`/
//! `filesys_open`/`filesys_remove`/`filesys_chdir`/`do_format`.

use crate::cache::BufferCache;
use crate::dir::{self, Directory};
use crate::error::{Result, StorageError};
use crate::freemap::FreeMap;
use crate::inode::{Inode, InodeTable};
use crate::layout::{ROOT_DIR_SECTOR, ROOT_DIR_INITIAL_ENTRIES, DIR_ENTRY_SIZE};
use alloc::sync::Arc;
use keos::fs::{Disk, Sector};

/// The reserved sector backing the free-map bookkeeping. Its contents are
/// not itself persisted (see `DESIGN.md`): the free-map is rebuilt fresh
/// at every mount, so this sector only needs to stay marked "in use".
const FREE_MAP_SECTOR: Sector = Sector(0);

/// An open, mounted filesystem.
pub struct Filesystem {
    free_map: Arc<FreeMap>,
    cache: Arc<BufferCache>,
    inodes: Arc<InodeTable>,
    root: Sector,
}

impl Filesystem {
    /// Formats a fresh filesystem over `total_sectors` sectors of `disk`
    /// and mounts it.
    pub fn format(disk: Disk, total_sectors: usize) -> Result<Self> {
        let fs = Self::bootstrap(disk, total_sectors);
        fs.free_map.mark_used(FREE_MAP_SECTOR, 1);
        fs.free_map.mark_used(ROOT_DIR_SECTOR, 1);
        fs.inodes
            .create(ROOT_DIR_SECTOR, ROOT_DIR_INITIAL_ENTRIES * DIR_ENTRY_SIZE, true, ROOT_DIR_SECTOR)?;
        Ok(fs)
    }

    /// Mounts an already-formatted filesystem.
    ///
    /// The free-map is rebuilt empty rather than read back from disk (see
    /// `FREE_MAP_SECTOR`'s doc comment), so this just reserves the two
    /// well-known bootstrap sectors before handing control to callers.
    pub fn open(disk: Disk, total_sectors: usize) -> Self {
        let fs = Self::bootstrap(disk, total_sectors);
        fs.free_map.mark_used(FREE_MAP_SECTOR, 1);
        fs.free_map.mark_used(ROOT_DIR_SECTOR, 1);
        fs
    }

    fn bootstrap(disk: Disk, total_sectors: usize) -> Self {
        let cache = BufferCache::new(disk);
        let free_map = Arc::new(FreeMap::new(Sector(0), total_sectors));
        let inodes = Arc::new(InodeTable::new(cache.clone(), free_map.clone()));
        Self {
            free_map,
            cache,
            inodes,
            root: ROOT_DIR_SECTOR,
        }
    }

    pub fn root(&self) -> Sector {
        self.root
    }

    /// Flushes the buffer cache and empties it, for a clean shutdown.
    pub fn shutdown(&self) {
        self.cache.write_back_all(true);
    }

    /// Creates `name` (relative to `cwd`, or the root if `None`) as a new
    /// file or directory of `initial_size` bytes, returning its inode
    /// sector.
    pub fn create(&self, cwd: Option<Sector>, path: &str, initial_size: usize, is_dir: bool) -> Result<Sector> {
        let resolved = dir::resolve(&self.inodes, self.root, cwd, path)?;
        if resolved.leaf.is_empty() || resolved.leaf == "." || resolved.leaf == ".." {
            return Err(StorageError::InvalidArgument);
        }
        let sector = self.free_map.allocate()?;
        let result = self
            .inodes
            .create(sector, initial_size, is_dir, resolved.dir.sector())
            .and_then(|()| resolved.dir.add_entry(&resolved.leaf, sector));
        if result.is_err() {
            self.free_map.release(sector);
        }
        result.map(|()| sector)
    }

    /// Opens `path` (relative to `cwd`, or the root if `None`), returning
    /// its inode. `.` and an empty basename on an otherwise-nonempty path
    /// (e.g. a trailing `/`) return the directory itself; `..` returns the
    /// parent, or fails at the root. A wholly empty `path` always fails.
    pub fn open_path(&self, cwd: Option<Sector>, path: &str) -> Result<Arc<Inode>> {
        if path.is_empty() {
            return Err(StorageError::NotFound);
        }
        let resolved = dir::resolve(&self.inodes, self.root, cwd, path)?;
        if resolved.leaf.is_empty() || resolved.leaf == "." {
            return Ok(resolved.dir.inode().clone());
        }
        if resolved.leaf == ".." {
            if resolved.dir.sector() == self.root {
                return Err(StorageError::NotFound);
            }
            return self.inodes.open(resolved.dir.inode().parent());
        }
        let sector = resolved.dir.lookup(&resolved.leaf).ok_or(StorageError::NotFound)?;
        self.inodes.open(sector)
    }

    /// Opens `path` and returns it as a [`Directory`], failing if it
    /// names a regular file.
    pub fn open_dir(&self, cwd: Option<Sector>, path: &str) -> Result<Directory> {
        let inode = self.open_path(cwd, path)?;
        if !inode.is_dir() {
            return Err(StorageError::NotDirectory);
        }
        Ok(Directory::new(inode))
    }

    /// Removes `path`. A non-empty directory cannot be removed.
    pub fn remove(&self, cwd: Option<Sector>, path: &str) -> Result<()> {
        let resolved = dir::resolve(&self.inodes, self.root, cwd, path)?;
        if resolved.leaf.is_empty() || resolved.leaf == "." || resolved.leaf == ".." {
            return Err(StorageError::InvalidArgument);
        }
        let sector = resolved.dir.lookup(&resolved.leaf).ok_or(StorageError::NotFound)?;
        let inode = self.inodes.open(sector)?;
        if inode.is_dir() {
            let victim = Directory::new(inode.clone());
            if !victim.is_empty() {
                return Err(StorageError::NotEmpty);
            }
        }
        resolved.dir.remove_entry(&resolved.leaf)?;
        inode.mark_removed();
        Ok(())
    }

    /// Resolves `path` (relative to `cwd`, or the root if `None`) to the
    /// directory a caller's working directory should become.
    pub fn chdir(&self, cwd: Option<Sector>, path: &str) -> Result<Sector> {
        let inode = self.open_path(cwd, path)?;
        if !inode.is_dir() {
            return Err(StorageError::NotDirectory);
        }
        Ok(inode.sector())
    }
}
