//! Buffer Cache (component C, §4.C): a fixed-capacity, write-back sector
//! cache with second-chance eviction, periodic flushing, and asynchronous
//! read-ahead.
//!
//! Each resident sector is an `Arc<SpinLock<[u8; 512]>>`, the same
//! reference-counted-buffer-behind-a-lock idiom `ffs/mod.rs` uses for its own
//! block cache (there: an LRU keyed on logical block address). The
//! replacement policy here is second-chance/clock rather than LRU, per this
//! component's design: cheap to scan, and what the original cache
//! implements.

use crate::error::{Result, StorageError};
use crate::sync::{ConditionVariable, Mutex};
use alloc::{collections::vec_deque::VecDeque, sync::Arc, vec::Vec};
use keos::fs::{Disk, Sector};
use keos::sync::SpinLock;
use keos::thread::{ThreadBuilder, scheduler};

/// Capacity of the buffer cache, in 512-byte lines.
pub const NUM_CACHE_LINES: usize = 64;
/// Period, in scheduler quanta, between automatic write-backs.
///
/// There is no timer-tick primitive exposed to crates outside the kernel
/// proper, so a "tick" here is one voluntary reschedule, the same unit the
/// cooperative `Scheduler` trait already counts time in.
pub const WRITE_BACK_PERIOD_TICKS: u64 = 500;

/// Yields the CPU `ticks` times in a row.
fn sleep_ticks(ticks: u64) {
    for _ in 0..ticks {
        scheduler().reschedule();
    }
}

/// One resident sector: its contents plus clock-eviction bookkeeping.
pub struct CacheLine {
    sector: SpinLock<Sector>,
    accessed: SpinLock<bool>,
    dirty: SpinLock<bool>,
    block: SpinLock<[u8; 512]>,
}

impl CacheLine {
    /// Locks the line's contents for direct read/write access at `ofs`.
    ///
    /// The caller is expected to hold this only as long as needed to
    /// memcpy in or out, matching the coarse "cache-line access is a coarse
    /// critical section" policy in the concurrency model.
    pub fn with_block<R>(&self, f: impl FnOnce(&mut [u8; 512]) -> R) -> R {
        let mut guard = self.block.lock();
        let r = f(&mut guard);
        guard.unlock();
        r
    }
}

struct CacheInner {
    lines: Vec<Arc<CacheLine>>,
}

impl CacheInner {
    fn find(&self, sector: Sector) -> Option<Arc<CacheLine>> {
        self.lines.iter().find_map(|l| {
            let s = l.sector.lock();
            let hit = *s == sector;
            s.unlock();
            hit.then(|| l.clone())
        })
    }
}

/// A FIFO queue of sectors to pull into the cache in the background.
struct ReadAhead {
    queue: Mutex<VecDeque<Sector>>,
    not_empty: ConditionVariable,
}

/// The 64-line, second-chance, write-back buffer cache.
pub struct BufferCache {
    disk: Disk,
    inner: Mutex<CacheInner>,
    read_ahead: Arc<ReadAhead>,
}

impl BufferCache {
    /// Creates the cache and spawns its periodic write-back and read-ahead
    /// background threads.
    pub fn new(disk: Disk) -> Arc<Self> {
        let this = Arc::new(Self {
            disk,
            inner: Mutex::new(CacheInner { lines: Vec::new() }),
            read_ahead: Arc::new(ReadAhead {
                queue: Mutex::new(VecDeque::new()),
                not_empty: ConditionVariable::new(),
            }),
        });

        let writer = this.clone();
        ThreadBuilder::new("periodical_writer").spawn(move || loop {
            sleep_ticks(WRITE_BACK_PERIOD_TICKS);
            writer.write_back_all(false);
        });

        let reader = this.clone();
        ThreadBuilder::new("read-aheader").spawn(move || {
            loop {
                let mut guard = reader
                    .read_ahead
                    .not_empty
                    .wait_while(&reader.read_ahead.queue, |q| q.is_empty());
                let sector = guard.pop_front();
                drop(guard);
                if let Some(sector) = sector {
                    // A miss here just performs the same add as a foreground
                    // access would; a hit is a cheap no-op.
                    let _ = reader.get_cache_line(sector, false);
                }
            }
        });

        this
    }

    /// Returns the cache line holding `sector`, loading or evicting as
    /// needed. Sets `accessed`; if `dirty_hint`, also sets `dirty`.
    pub fn get_cache_line(&self, sector: Sector, dirty_hint: bool) -> Result<Arc<CacheLine>> {
        let mut inner = self.inner.lock();
        let line = if let Some(line) = inner.find(sector) {
            if dirty_hint {
                let mut d = line.dirty.lock();
                *d = true;
                d.unlock();
            }
            line
        } else {
            let line = if inner.lines.len() < NUM_CACHE_LINES {
                let line = Arc::new(CacheLine {
                    sector: SpinLock::new(sector),
                    accessed: SpinLock::new(false),
                    dirty: SpinLock::new(dirty_hint),
                    block: SpinLock::new([0u8; 512]),
                });
                inner.lines.push(line.clone());
                line
            } else {
                self.evict_locked(&mut inner)?
            };
            let mut s = line.sector.lock();
            *s = sector;
            s.unlock();
            let mut d = line.dirty.lock();
            *d = dirty_hint;
            d.unlock();
            let mut buf = [0u8; 512];
            self.disk.read(sector, &mut buf).map_err(StorageError::from)?;
            line.with_block(|b| *b = buf);
            line
        };
        let mut a = line.accessed.lock();
        *a = true;
        a.unlock();
        Ok(line)
    }

    /// Second-chance eviction. Restarts the clock hand at the head of the
    /// line list on every call (a teaching-grade approximation, per §4.C).
    fn evict_locked(&self, inner: &mut CacheInner) -> Result<Arc<CacheLine>> {
        let n = inner.lines.len();
        if n == 0 {
            panic!("buffer cache: no space to evict from");
        }
        let mut idx = 0;
        loop {
            let line = inner.lines[idx % n].clone();
            let mut accessed = line.accessed.lock();
            if *accessed {
                *accessed = false;
                accessed.unlock();
                idx += 1;
                continue;
            }
            accessed.unlock();
            let mut dirty = line.dirty.lock();
            if *dirty {
                let sector = {
                    let s = line.sector.lock();
                    let v = *s;
                    s.unlock();
                    v
                };
                line.with_block(|b| {
                    let _ = self.disk.write(sector, b);
                });
                *dirty = false;
            }
            dirty.unlock();
            return Ok(line);
        }
    }

    /// Flushes every dirty line. If `drain`, also empties the cache
    /// entirely (used at filesystem shutdown).
    pub fn write_back_all(&self, drain: bool) {
        let mut inner = self.inner.lock();
        for line in inner.lines.iter() {
            let mut dirty = line.dirty.lock();
            if *dirty {
                let sector = {
                    let s = line.sector.lock();
                    let v = *s;
                    s.unlock();
                    v
                };
                line.with_block(|b| {
                    let _ = self.disk.write(sector, b);
                });
                *dirty = false;
            }
            dirty.unlock();
        }
        if drain {
            inner.lines.clear();
        }
    }

    /// Asynchronously requests that `sector` be made resident.
    pub fn read_ahead_put(&self, sector: Sector) {
        let mut queue = self.read_ahead.queue.lock();
        queue.push_back(sector);
        drop(queue);
        self.read_ahead.not_empty.signal();
    }
}
