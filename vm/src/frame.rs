//! The frame table: tracks every physical page currently backing a resident
//! user mapping, and runs second-chance (clock) eviction when the frame
//! budget is exhausted.
//!
//! The table itself never holds the [`Page`]s it tracks — the page table
//! reachable through each entry's `owner` is the actual Rust-level owner, the
//! same way [`crate::page_table::PageTable`] owns every page it maps. An
//! entry is just `(owner, page_vaddr)`: enough to find the mapping again on
//! eviction. This is how the cyclic FTE/SPT back-reference in the design
//! notes is avoided without `Weak`: the frame table never needs to hand a
//! page back out, only to ask its owner to reclaim one.
//!
//! `keos::mm::Page::new()` has no fallible form — it panics on physical
//! OOM — so there is no "try to allocate, evict on failure" path to take.
//! Instead [`FrameTable::alloc`] evicts *before* calling `Page::new()`
//! whenever the tracked frame count has already reached `capacity`. This is
//! a deliberate departure from a literal eviction-on-failure reading: the
//! observable behavior (bounded resident set, second-chance eviction under
//! pressure) is the same, but it is driven by a count we track ourselves
//! rather than by a recoverable allocation error this API cannot produce.

use alloc::sync::Arc;
use alloc::vec::Vec;
use keos::addressing::Va;
use keos::mm::Page;
use keos::sync::atomic::AtomicUsize;

use crate::spt::SupplementalPageTable;
use crate::swap::SwapArea;

/// One resident mapping: which page table owns it and at what address.
struct Fte {
    owner: Arc<SupplementalPageTable>,
    page_vaddr: Va,
}

/// The system-wide table of resident frames.
///
/// Entries are scanned circularly by [`Self::evict_locked`]; `clock`
/// persists the scan position across calls so each pass resumes where the
/// last left off instead of always restarting at index 0.
pub struct FrameTable {
    entries: storage::sync::Mutex<Vec<Fte>>,
    clock: AtomicUsize,
    capacity: usize,
}

impl FrameTable {
    /// Creates a frame table that holds at most `capacity` resident frames
    /// before eviction kicks in.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: storage::sync::Mutex::new(Vec::new()),
            clock: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Allocates a fresh physical page, evicting a victim first if the
    /// table is already at `capacity`. The caller is responsible for
    /// mapping the page and then calling [`Self::register`].
    pub fn alloc(&self, swap: &SwapArea) -> Page {
        if self.entries.lock().len() >= self.capacity {
            self.evict_locked(swap);
        }
        Page::new()
    }

    /// Records that `owner`'s mapping at `page_vaddr` is now resident.
    pub fn register(&self, owner: Arc<SupplementalPageTable>, page_vaddr: Va) {
        self.entries.lock().push(Fte { owner, page_vaddr });
    }

    /// Drops the bookkeeping for a mapping that is being torn down outside
    /// of eviction (`munmap`, process exit). A no-op if the mapping was
    /// never resident (e.g. it was already swapped out).
    pub fn unregister(&self, owner: &Arc<SupplementalPageTable>, page_vaddr: Va) {
        let mut entries = self.entries.lock();
        if let Some(i) = entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.owner, owner) && e.page_vaddr == page_vaddr)
        {
            entries.remove(i);
        }
    }

    /// Runs one second-chance pass: skip pinned entries, clear and spare
    /// accessed entries, evict the first clean unaccessed entry found.
    ///
    /// Fixes the classic infinite-loop bug where an already-clean,
    /// unaccessed, read-only file-backed entry is never reached because the
    /// scan only advances on a *set* accessed bit: here the clock hand
    /// always advances by one entry per iteration regardless of what it
    /// found at the current one.
    fn evict_locked(&self, swap: &SwapArea) {
        loop {
            let victim = {
                let mut entries = self.entries.lock();
                let len = entries.len();
                if len == 0 {
                    panic!("frame table eviction found no victim: no resident frames to reclaim");
                }
                let start = self.clock.load() % len;
                let mut i = start;
                let mut found = None;
                loop {
                    let pinned = entries[i].owner.is_accessing(entries[i].page_vaddr);
                    if !pinned {
                        if entries[i].owner.page_table_accessed(entries[i].page_vaddr) {
                            entries[i].owner.page_table_clear_accessed(entries[i].page_vaddr);
                        } else {
                            found = Some(i);
                            break;
                        }
                    }
                    i = (i + 1) % len;
                    if i == start {
                        break;
                    }
                }
                match found {
                    Some(i) => {
                        self.clock.store(i);
                        Some(entries.remove(i))
                    }
                    None => {
                        self.clock.store((start + 1) % len);
                        None
                    }
                }
            };
            if let Some(victim) = victim {
                victim.owner.evict(victim.page_vaddr, swap);
                return;
            }
            // Every entry was either pinned or just had its accessed bit
            // cleared this pass; loop again so cleared entries become
            // evictable on the next.
        }
    }
}
