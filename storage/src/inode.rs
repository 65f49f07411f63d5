//! Inode Engine (component E, §4.E): UNIX-style indexed inodes with one
//! direct, one singly-indirect, and one doubly-indirect block of sector
//! pointers, grown on demand and cached through the buffer cache.
//!
//! Grounded in `inode.c`'s `byte_to_sector`/`inode_grow`/`inode_free`. The
//! open-inode table there is a manually refcounted linked list
//! (`open_cnt`, `list_remove` on last close); here it is an
//! `Arc`/`Weak`-keyed map, so the "last closer runs cleanup" rule is just
//! `Inode`'s [`Drop`] impl rather than a hand-rolled counter.

use crate::cache::BufferCache;
use crate::error::{Result, StorageError};
use crate::freemap::FreeMap;
use crate::layout::{MAX_FILE_SIZE, OnDiskInode, PTRS_PER_INDIRECT, SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::collections::btree_map::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use keos::fs::Sector;

fn bytes_to_sectors(size: usize) -> usize {
    size.div_ceil(SECTOR_SIZE)
}

/// The three allocation-root pointers an inode header carries.
#[derive(Default)]
struct BlockPtrs {
    direct: u32,
    indirect: u32,
    doubly_indirect: u32,
}

fn indirect_block(cache: &BufferCache, sector: u32) -> Result<[u32; PTRS_PER_INDIRECT]> {
    let line = cache.get_cache_line(Sector(sector as usize), false)?;
    Ok(line.with_block(|b| {
        let mut out = [0u32; PTRS_PER_INDIRECT];
        for (i, chunk) in b.chunks_exact(4).enumerate() {
            out[i] = u32::from_ne_bytes(chunk.try_into().unwrap());
        }
        out
    }))
}

fn write_indirect_block(cache: &BufferCache, sector: u32, ptrs: &[u32; PTRS_PER_INDIRECT]) -> Result<()> {
    let line = cache.get_cache_line(Sector(sector as usize), true)?;
    line.with_block(|b| {
        for (i, p) in ptrs.iter().enumerate() {
            b[i * 4..i * 4 + 4].copy_from_slice(&p.to_ne_bytes());
        }
    });
    Ok(())
}

/// Extends `ptrs` to cover `new_length` bytes, given it currently covers
/// `old_length`, allocating direct, indirect, and doubly-indirect sectors
/// as needed. Shared by inode creation (growing a fresh, all-zero pointer
/// set) and by [`Inode::grow`] (growing an already-populated one).
fn grow_pointers(cache: &BufferCache, free_map: &FreeMap, ptrs: &mut BlockPtrs, old_length: usize, new_length: usize) -> Result<()> {
    let zeros = [0u8; SECTOR_SIZE];
    let mut old_sectors = bytes_to_sectors(old_length);
    let target_sectors = bytes_to_sectors(new_length);
    if target_sectors <= old_sectors {
        return Ok(());
    }

    if old_sectors == 0 {
        let s = free_map.allocate()?;
        cache.get_cache_line(s, true)?.with_block(|b| *b = zeros);
        ptrs.direct = s.into_usize() as u32;
        old_sectors += 1;
        if old_sectors == target_sectors {
            return Ok(());
        }
    }

    if old_sectors < 129 {
        if old_sectors == 1 {
            ptrs.indirect = free_map.allocate()?.into_usize() as u32;
        }
        let mut block = indirect_block(cache, ptrs.indirect).unwrap_or([0; PTRS_PER_INDIRECT]);
        while old_sectors < 129 {
            let idx = old_sectors - 1;
            let s = free_map.allocate()?;
            cache.get_cache_line(s, true)?.with_block(|b| *b = zeros);
            block[idx] = s.into_usize() as u32;
            old_sectors += 1;
            if old_sectors == target_sectors {
                write_indirect_block(cache, ptrs.indirect, &block)?;
                return Ok(());
            }
        }
        write_indirect_block(cache, ptrs.indirect, &block)?;
    }

    debug_assert!(old_sectors <= 1 + PTRS_PER_INDIRECT + PTRS_PER_INDIRECT * PTRS_PER_INDIRECT);

    if old_sectors == 129 {
        ptrs.doubly_indirect = free_map.allocate()?.into_usize() as u32;
    }
    let mut outer = indirect_block(cache, ptrs.doubly_indirect).unwrap_or([0; PTRS_PER_INDIRECT]);
    loop {
        let outer_idx = (old_sectors - 129) / PTRS_PER_INDIRECT;
        if (old_sectors - 129) % PTRS_PER_INDIRECT == 0 {
            outer[outer_idx] = free_map.allocate()?.into_usize() as u32;
        }
        let inner_sector = outer[outer_idx];
        let mut inner = indirect_block(cache, inner_sector).unwrap_or([0; PTRS_PER_INDIRECT]);
        while old_sectors < 129 + (outer_idx + 1) * PTRS_PER_INDIRECT {
            let inner_idx = (old_sectors - 129) % PTRS_PER_INDIRECT;
            let s = free_map.allocate()?;
            cache.get_cache_line(s, true)?.with_block(|b| *b = zeros);
            inner[inner_idx] = s.into_usize() as u32;
            old_sectors += 1;
            if old_sectors == target_sectors {
                write_indirect_block(cache, inner_sector, &inner)?;
                write_indirect_block(cache, ptrs.doubly_indirect, &outer)?;
                return Ok(());
            }
        }
        write_indirect_block(cache, inner_sector, &inner)?;
    }
}

/// Releases every data, indirect, and doubly-indirect sector covering
/// `length` bytes under `ptrs`.
///
/// The original counts sectors down from the high index with an unsigned
/// loop variable and a `< 0` continuation test, so the loop body never
/// runs and every indirect/doubly-indirect sector leaks. This walks the
/// same ranges but counts down correctly.
fn free_pointers(cache: &BufferCache, free_map: &FreeMap, ptrs: &BlockPtrs, length: usize) -> Result<()> {
    let sectors = bytes_to_sectors(length);

    if sectors > 0 {
        free_map.release(Sector(ptrs.direct as usize));
    }

    if sectors > 1 {
        let block = indirect_block(cache, ptrs.indirect)?;
        let live = (sectors - 1).min(PTRS_PER_INDIRECT);
        for i in 0..live {
            free_map.release(Sector(block[i] as usize));
        }
        free_map.release(Sector(ptrs.indirect as usize));
    }

    if sectors > 129 {
        let outer = indirect_block(cache, ptrs.doubly_indirect)?;
        let live_outer = (sectors - 129).div_ceil(PTRS_PER_INDIRECT);
        for o in 0..live_outer {
            let inner = indirect_block(cache, outer[o])?;
            let remaining = sectors - 129 - o * PTRS_PER_INDIRECT;
            let live_inner = remaining.min(PTRS_PER_INDIRECT);
            for i in 0..live_inner {
                free_map.release(Sector(inner[i] as usize));
            }
            free_map.release(Sector(outer[o] as usize));
        }
        free_map.release(Sector(ptrs.doubly_indirect as usize));
    }

    Ok(())
}

/// Shared table of open inodes, keyed by sector, so that opening the same
/// inode twice yields the same in-memory object.
pub struct InodeTable {
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    open: Arc<Mutex<BTreeMap<usize, Weak<Inode>>>>,
}

impl InodeTable {
    pub fn new(cache: Arc<BufferCache>, free_map: Arc<FreeMap>) -> Self {
        Self {
            cache,
            free_map,
            open: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Writes a fresh inode header to `sector`, growing it to `length`
    /// bytes of allocated (zeroed) storage.
    pub fn create(&self, sector: Sector, length: usize, is_dir: bool, parent: Sector) -> Result<()> {
        let length = length.min(MAX_FILE_SIZE);
        let mut ptrs = BlockPtrs::default();
        grow_pointers(&self.cache, &self.free_map, &mut ptrs, 0, length)?;
        let header = OnDiskInode {
            is_dir: is_dir as u32,
            parent: parent.into_usize() as u32,
            direct: ptrs.direct,
            indirect: ptrs.indirect,
            doubly_indirect: ptrs.doubly_indirect,
            length: length as u32,
            magic: crate::layout::INODE_MAGIC,
            _reserved: [0; 121],
        };
        let line = self.cache.get_cache_line(sector, true)?;
        line.with_block(|b| *b = header.to_bytes());
        Ok(())
    }

    /// Opens the inode at `sector`, returning the shared in-memory object.
    pub fn open(&self, sector: Sector) -> Result<Arc<Inode>> {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&sector.into_usize()).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let line = self.cache.get_cache_line(sector, false)?;
        let header = line.with_block(|b| OnDiskInode::from_bytes(b));
        if header.magic != crate::layout::INODE_MAGIC {
            return Err(StorageError::IoError);
        }
        let inode = Arc::new(Inode {
            sector,
            is_dir: header.is_dir != 0,
            parent: AtomicU32::new(header.parent),
            direct: AtomicU32::new(header.direct),
            indirect: AtomicU32::new(header.indirect),
            doubly_indirect: AtomicU32::new(header.doubly_indirect),
            length: AtomicU32::new(header.length),
            read_length: AtomicU32::new(header.length),
            grow_lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            deny_write_count: AtomicUsize::new(0),
            cache: self.cache.clone(),
            free_map: self.free_map.clone(),
            open: self.open.clone(),
        });
        open.insert(sector.into_usize(), Arc::downgrade(&inode));
        Ok(inode)
    }
}

/// An open inode: cached header fields plus the locks and collaborators
/// needed to serve reads, writes, and growth.
pub struct Inode {
    sector: Sector,
    is_dir: bool,
    parent: AtomicU32,
    direct: AtomicU32,
    indirect: AtomicU32,
    doubly_indirect: AtomicU32,
    /// Committed length; only mutated under `grow_lock`.
    length: AtomicU32,
    /// Length visible to readers. Published after a write completes, so
    /// the read path never needs `grow_lock` (§4.E: reads are lock-free at
    /// the inode level).
    read_length: AtomicU32,
    grow_lock: Mutex<()>,
    removed: AtomicBool,
    deny_write_count: AtomicUsize,
    cache: Arc<BufferCache>,
    free_map: Arc<FreeMap>,
    open: Arc<Mutex<BTreeMap<usize, Weak<Inode>>>>,
}

impl Inode {
    pub fn sector(&self) -> Sector {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn parent(&self) -> Sector {
        Sector(self.parent.load(Ordering::Acquire) as usize)
    }

    pub fn set_parent(&self, parent: Sector) {
        self.parent.store(parent.into_usize() as u32, Ordering::Release);
    }

    pub fn length(&self) -> usize {
        self.length.load(Ordering::Acquire) as usize
    }

    /// Marks the inode to be freed once the last opener closes it.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn deny_write(&self) {
        self.deny_write_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "allow_write without matching deny_write");
    }

    /// Acquires the inode's own lock, used by the directory layer to
    /// serialize entry add/remove against this inode's data.
    pub fn lock(&self) -> crate::sync::MutexGuard<'_, ()> {
        self.grow_lock.lock()
    }

    /// Maps a byte offset to the data sector that holds it, given the
    /// length an in-flight reader or writer is bound by.
    fn byte_to_sector(&self, pos: usize, length: usize) -> Option<Sector> {
        if pos >= length {
            return None;
        }
        if pos < SECTOR_SIZE {
            return Some(Sector(self.direct.load(Ordering::Acquire) as usize));
        }
        if pos < SECTOR_SIZE * 129 {
            let idx = (pos - SECTOR_SIZE) / SECTOR_SIZE;
            let block = indirect_block(&self.cache, self.indirect.load(Ordering::Acquire)).ok()?;
            return Some(Sector(block[idx] as usize));
        }
        let pos = pos - SECTOR_SIZE * 129;
        let outer_idx = pos / (SECTOR_SIZE * PTRS_PER_INDIRECT);
        let outer = indirect_block(&self.cache, self.doubly_indirect.load(Ordering::Acquire)).ok()?;
        let inner = indirect_block(&self.cache, outer[outer_idx]).ok()?;
        let inner_idx = (pos % (SECTOR_SIZE * PTRS_PER_INDIRECT)) / SECTOR_SIZE;
        Some(Sector(inner[inner_idx] as usize))
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let read_length = self.read_length.load(Ordering::Acquire) as usize;
        if offset >= read_length {
            return Ok(0);
        }
        let mut done = 0;
        let mut offset = offset;
        let mut remaining = buf.len();
        while remaining > 0 {
            let Some(sector) = self.byte_to_sector(offset, read_length) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = read_length - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            if let Some(next) = self.byte_to_sector(offset + chunk, read_length) {
                self.cache.read_ahead_put(next);
            }
            let line = self.cache.get_cache_line(sector, false)?;
            line.with_block(|b| buf[done..done + chunk].copy_from_slice(&b[sector_ofs..sector_ofs + chunk]));
            offset += chunk;
            remaining -= chunk;
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at `offset`, growing the inode first if this write
    /// extends past the current length.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        if self.deny_write_count.load(Ordering::Acquire) > 0 {
            return Ok(0);
        }
        let want_end = (offset + buf.len()).min(MAX_FILE_SIZE);
        if want_end > self.length() {
            self.grow(want_end)?;
        }
        let length = self.length();
        let mut done = 0;
        let mut offset = offset;
        let mut remaining = buf.len();
        while remaining > 0 {
            let Some(sector) = self.byte_to_sector(offset, length) else {
                break;
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let inode_left = length - offset;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = remaining.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let line = self.cache.get_cache_line(sector, true)?;
            line.with_block(|b| b[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]));
            offset += chunk;
            remaining -= chunk;
            done += chunk;
        }
        self.read_length.store(length as u32, Ordering::Release);
        Ok(done)
    }

    /// Extends allocated storage to cover `new_length` bytes, in three
    /// phases: the direct sector, then the indirect block (up to 128
    /// sectors), then the doubly-indirect tree (up to 128*128 sectors).
    fn grow(&self, new_length: usize) -> Result<()> {
        let _guard = self.grow_lock.lock();
        let old_length = self.length();
        let mut ptrs = BlockPtrs {
            direct: self.direct.load(Ordering::Acquire),
            indirect: self.indirect.load(Ordering::Acquire),
            doubly_indirect: self.doubly_indirect.load(Ordering::Acquire),
        };
        grow_pointers(&self.cache, &self.free_map, &mut ptrs, old_length, new_length)?;
        self.direct.store(ptrs.direct, Ordering::Release);
        self.indirect.store(ptrs.indirect, Ordering::Release);
        self.doubly_indirect.store(ptrs.doubly_indirect, Ordering::Release);
        self.length.store(new_length as u32, Ordering::Release);
        Ok(())
    }

    /// Releases every data, indirect, and doubly-indirect sector this
    /// inode owns.
    fn free_blocks(&self) -> Result<()> {
        let ptrs = BlockPtrs {
            direct: self.direct.load(Ordering::Acquire),
            indirect: self.indirect.load(Ordering::Acquire),
            doubly_indirect: self.doubly_indirect.load(Ordering::Acquire),
        };
        free_pointers(&self.cache, &self.free_map, &ptrs, self.length())
    }

    fn writeback_header(&self) -> Result<()> {
        let header = OnDiskInode {
            is_dir: self.is_dir as u32,
            parent: self.parent.load(Ordering::Acquire),
            direct: self.direct.load(Ordering::Acquire),
            indirect: self.indirect.load(Ordering::Acquire),
            doubly_indirect: self.doubly_indirect.load(Ordering::Acquire),
            length: self.length.load(Ordering::Acquire),
            magic: crate::layout::INODE_MAGIC,
            _reserved: [0; 121],
        };
        let line = self.cache.get_cache_line(self.sector, true)?;
        line.with_block(|b| *b = header.to_bytes());
        Ok(())
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let mut open = self.open.lock();
        open.remove(&self.sector.into_usize());
        drop(open);
        if self.removed.load(Ordering::Acquire) {
            self.free_map.release(self.sector);
            let _ = self.free_blocks();
        } else {
            let _ = self.writeback_header();
        }
    }
}
