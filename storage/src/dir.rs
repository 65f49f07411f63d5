//! Directory Layer (component F, §4.F): fixed-size directory entries
//! stored as regular file data, plus iterative path resolution.
//!
//! Grounded in `filesys.c`'s `get_dir`/`get_filename` tokenizer (the shape
//! of [`resolve`]) and in the `.`/`..` handling there: neither is a stored
//! entry, `.` is simply "this directory" and `..` comes from the inode's
//! own `parent` field (`dir_get_parent` → `inode_get_parent`).

use crate::error::{Result, StorageError};
use crate::inode::{Inode, InodeTable};
use crate::layout::{DIR_ENTRY_SIZE, RawDirEntry};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::fs::Sector;

/// A directory: an inode known to hold a packed array of [`RawDirEntry`]
/// records as its file data.
pub struct Directory {
    inode: Arc<Inode>,
}

impl Directory {
    pub fn new(inode: Arc<Inode>) -> Self {
        Self { inode }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn sector(&self) -> Sector {
        self.inode.sector()
    }

    fn entry_count(&self) -> usize {
        self.inode.length() / DIR_ENTRY_SIZE
    }

    fn read_entry(&self, index: usize) -> Result<RawDirEntry> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        self.inode.read_at(index * DIR_ENTRY_SIZE, &mut buf)?;
        Ok(RawDirEntry::from_bytes(buf))
    }

    fn write_entry(&self, index: usize, entry: RawDirEntry) -> Result<()> {
        self.inode.write_at(index * DIR_ENTRY_SIZE, &entry.to_bytes())?;
        Ok(())
    }

    /// Looks up `name` among this directory's entries.
    pub fn lookup(&self, name: &str) -> Option<Sector> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i).ok()?;
            if entry.in_use != 0 && entry.name().as_deref() == Some(name) {
                return Some(Sector(entry.inode_sector as usize));
            }
        }
        None
    }

    /// Adds `name -> sector` as a new entry, reusing a freed slot if one
    /// exists, appending otherwise.
    pub fn add_entry(&self, name: &str, sector: Sector) -> Result<()> {
        if self.lookup(name).is_some() {
            return Err(StorageError::AlreadyExists);
        }
        let entry = RawDirEntry::occupied(sector, name).ok_or(StorageError::NameTooLong)?;
        let count = self.entry_count();
        for i in 0..count {
            if self.read_entry(i)?.in_use == 0 {
                return self.write_entry(i, entry);
            }
        }
        self.write_entry(count, entry)
    }

    /// Removes the entry named `name`.
    pub fn remove_entry(&self, name: &str) -> Result<()> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i)?;
            if entry.in_use != 0 && entry.name().as_deref() == Some(name) {
                return self.write_entry(i, RawDirEntry::EMPTY);
            }
        }
        Err(StorageError::NotFound)
    }

    /// True if every entry slot is free (besides the implicit `.`/`..`,
    /// which are never stored as entries here).
    pub fn is_empty(&self) -> bool {
        (0..self.entry_count()).all(|i| self.read_entry(i).map(|e| e.in_use == 0).unwrap_or(true))
    }

    /// Lists every live `(sector, name)` pair.
    pub fn read_dir(&self) -> Result<Vec<(Sector, String)>> {
        let mut out = Vec::new();
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i)?;
            if entry.in_use != 0 {
                if let Some(name) = entry.name() {
                    out.push((Sector(entry.inode_sector as usize), name));
                }
            }
        }
        Ok(out)
    }
}

/// The result of splitting a path into the directory that should contain
/// the leaf and the leaf component's name.
pub struct Resolved {
    pub dir: Directory,
    pub leaf: String,
}

/// Walks `path` component by component starting from `cwd` (or the root,
/// for an absolute path or when `cwd` is `None`), stopping one component
/// short of the leaf.
///
/// `.` is skipped; `..` steps to the parent via the inode's `parent`
/// field. An intermediate component that names a regular file is an
/// error (`NotDirectory`); one that does not exist at all is `NotFound`.
pub fn resolve(inodes: &InodeTable, root: Sector, cwd: Option<Sector>, path: &str) -> Result<Resolved> {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let leaf = components.pop().map(ToString::to_string).unwrap_or_default();

    let start = if path.starts_with('/') || cwd.is_none() {
        root
    } else {
        cwd.unwrap()
    };
    let mut dir = Directory::new(inodes.open(start)?);

    for component in components {
        let next = if component == "." {
            continue;
        } else if component == ".." {
            dir.inode().parent()
        } else {
            dir.lookup(component).ok_or(StorageError::NotFound)?
        };
        let inode = inodes.open(next)?;
        if !inode.is_dir() {
            return Err(StorageError::NotDirectory);
        }
        dir = Directory::new(inode);
    }

    Ok(Resolved { dir, leaf })
}
