//! Supplemental Page Table (component H, §4.H): per-process virtual-page
//! metadata, page-fault service, and heuristic stack growth.
//!
//! Generalizes the `todo!()`-stubbed `LazyPager`/`VmAreaStruct`/`MmLoader`
//! shape from `keos-project3/src/lazy_pager.rs` into a complete
//! implementation: `MmLoader::load` there is split here into the two
//! concrete paths (`PageState::OnFile`, `PageState::OnSwap`) the spec names,
//! and `VmAreaStruct`'s one-loader-per-region model becomes one [`SptEntry`]
//! per page, matching the SPT's per-page granularity.

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use keos::addressing::Va;
use keos::mm::page_table::Permission;
use keos::mm::Page;
use storage::inode::Inode;

use crate::error::{Result, VmError};
use crate::frame::FrameTable;
use crate::page_table::PageTable;
use crate::swap::SwapArea;

const PAGE_SIZE: usize = 4096;

/// Lowest address a user mapping may occupy, per §6 (`mmap`'s own
/// precondition, reused here as the general "is this a user page" floor).
pub const USER_BASE: usize = 0x0804_8000;
/// One past the highest canonical lower-half address; anything at or above
/// this is never a user page regardless of `USER_BASE`.
pub const USER_TOP: usize = 0x0000_8000_0000_0000;
/// Maximum distance the stack is allowed to grow below the boundary between
/// the user and kernel halves of the address space (§4.H).
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;
/// A stack-growth fault may appear up to this many bytes below `esp` (the
/// `PUSHA`/`PUSH` instructions that can fault before adjusting the stack
/// pointer).
const STACK_FAULT_SLACK: usize = 32;

/// Where an [`SptEntry`]'s data currently lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Backed by a live frame, mapped in the page table.
    Resident,
    /// Not resident; reload by reading from `file` at `offset`.
    OnFile,
    /// Not resident; reload by reading swap slot `swap_index`.
    OnSwap,
}

/// Per-page virtual-memory metadata (§3, "SPT entry").
struct SptEntryInner {
    state: PageState,
    file: Option<Arc<Inode>>,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
    from_mmap: bool,
    swap_index: Option<usize>,
    /// Pinned against eviction while a syscall is mid-copy into/out of this
    /// page (§4.H, "`accessing` pin").
    accessing: bool,
}

/// A single page's worth of SPT bookkeeping, guarded by its own lock so the
/// frame table's second-chance scan can inspect one entry without blocking
/// on another.
pub struct SptEntry {
    page_vaddr: Va,
    inner: storage::sync::Mutex<SptEntryInner>,
}

impl SptEntry {
    fn new(
        page_vaddr: Va,
        state: PageState,
        file: Option<Arc<Inode>>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        from_mmap: bool,
    ) -> Self {
        Self {
            page_vaddr,
            inner: storage::sync::Mutex::new(SptEntryInner {
                state,
                file,
                offset,
                read_bytes,
                zero_bytes,
                writable,
                from_mmap,
                swap_index: None,
                accessing: false,
            }),
        }
    }

    pub fn page_vaddr(&self) -> Va {
        self.page_vaddr
    }

    pub fn state(&self) -> PageState {
        self.inner.lock().state
    }
}

/// A process's supplemental page table: the page table itself plus one
/// [`SptEntry`] per page the process has ever faulted in or mapped.
///
/// Entries are never removed on eviction (only their `state` changes); they
/// are removed only when the owning mapping is torn down (`munmap`) or the
/// process exits.
pub struct SupplementalPageTable {
    page_table: storage::sync::Mutex<PageTable>,
    entries: storage::sync::Mutex<BTreeMap<usize, Arc<SptEntry>>>,
    /// Top of this process's user stack; stack-growth faults are measured
    /// downward from here (§4.H allows growth to `stack_top - STACK_LIMIT`).
    stack_top: Va,
}

impl SupplementalPageTable {
    pub fn new(page_table: PageTable, stack_top: Va) -> Arc<Self> {
        Arc::new(Self {
            page_table: storage::sync::Mutex::new(page_table),
            entries: storage::sync::Mutex::new(BTreeMap::new()),
            stack_top,
        })
    }

    fn key(va: Va) -> usize {
        va.page_down().into_usize()
    }

    fn get(&self, va: Va) -> Option<Arc<SptEntry>> {
        self.entries.lock().get(&Self::key(va)).cloned()
    }

    pub fn contains(&self, va: Va) -> bool {
        self.entries.lock().contains_key(&Self::key(va))
    }

    /// Records a not-yet-resident, file-backed page (used by `mmap` and by
    /// the executable loader for its read-only/executable segments).
    ///
    /// Fails with [`VmError::AlreadyMapped`] if the page already has an
    /// entry.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_file_backed(
        &self,
        page_vaddr: Va,
        file: Arc<Inode>,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        from_mmap: bool,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        let key = Self::key(page_vaddr);
        if entries.contains_key(&key) {
            return Err(VmError::AlreadyMapped);
        }
        entries.insert(
            key,
            Arc::new(SptEntry::new(
                page_vaddr,
                PageState::OnFile,
                Some(file),
                offset,
                read_bytes,
                zero_bytes,
                writable,
                from_mmap,
            )),
        );
        Ok(())
    }

    /// Removes the entry at `page_vaddr`, if any, without touching any
    /// frame or page-table mapping it may still own. Used by `mmap`
    /// rollback and by `munmap` once a page has already been handled.
    pub fn remove(&self, page_vaddr: Va) -> Option<Arc<SptEntry>> {
        self.entries.lock().remove(&Self::key(page_vaddr))
    }

    /// True if `va`'s page is currently pinned against eviction.
    pub fn is_accessing(&self, va: Va) -> bool {
        self.get(va).map(|e| e.inner.lock().accessing).unwrap_or(false)
    }

    /// Sets or clears the `accessing` pin on `va`'s page. System calls that
    /// dereference a user pointer must pin the page before touching the
    /// frame and unpin it afterward (§4.H).
    pub fn set_accessing(&self, va: Va, accessing: bool) {
        if let Some(e) = self.get(va) {
            e.inner.lock().accessing = accessing;
        }
    }

    pub fn page_table_accessed(&self, va: Va) -> bool {
        self.page_table.lock().accessed(va)
    }

    pub fn page_table_clear_accessed(&self, va: Va) {
        self.page_table.lock().clear_accessed(va);
    }

    /// Runs with exclusive access to the underlying [`PageTable`], e.g. to
    /// install the initial executable image or tear the address space down
    /// at process exit.
    pub fn with_page_table<R>(&self, f: impl FnOnce(&mut PageTable) -> R) -> R {
        f(&mut self.page_table.lock())
    }

    /// Address of the physical page table root, for loading into `cr3`.
    pub fn pa(&self) -> keos::addressing::Pa {
        self.page_table.lock().pa()
    }

    /// True if `addr` falls within the downward stack-growth region: no
    /// more than [`STACK_FAULT_SLACK`] bytes below `esp`, and the resulting
    /// page would keep the stack within [`STACK_LIMIT`] bytes of its top.
    fn is_stack_growth(&self, addr: Va, esp: Va) -> bool {
        let addr = addr.into_usize();
        let esp = esp.into_usize();
        if addr + STACK_FAULT_SLACK < esp {
            return false;
        }
        let top = self.stack_top.into_usize();
        if addr >= top {
            return false;
        }
        top - addr.page_down() <= STACK_LIMIT
    }

    /// Services a page fault at `fault_addr`, given the faulting thread's
    /// current stack pointer `esp` (needed for the stack-growth heuristic).
    ///
    /// On success the faulting page is resident and mapped; the caller may
    /// simply retry the faulting instruction. On failure the caller is
    /// expected to kill the offending process with status -1 (§4.H), never
    /// to panic: a user-triggered fault is never a kernel invariant
    /// violation.
    pub fn page_fault(
        self: &Arc<Self>,
        fault_addr: Va,
        esp: Va,
        frames: &FrameTable,
        swap: &SwapArea,
    ) -> Result<()> {
        let page_vaddr = fault_addr.page_down();
        if let Some(entry) = self.get(page_vaddr) {
            let (state, file, offset, read_bytes, zero_bytes, writable, swap_index) = {
                let inner = entry.inner.lock();
                (
                    inner.state,
                    inner.file.clone(),
                    inner.offset,
                    inner.read_bytes,
                    inner.zero_bytes,
                    inner.writable,
                    inner.swap_index,
                )
            };
            match state {
                PageState::Resident => Ok(()),
                PageState::OnFile => {
                    let mut page = frames.alloc(swap);
                    if let Some(file) = file {
                        let mut buf = [0u8; PAGE_SIZE];
                        let got = file.read_at(offset, &mut buf[..read_bytes])?;
                        buf[got..read_bytes].fill(0);
                        buf[read_bytes..read_bytes + zero_bytes].fill(0);
                        page.inner_mut().copy_from_slice(&buf);
                    } else {
                        page.inner_mut().fill(0);
                    }
                    self.install(&entry, page, page_vaddr, writable, frames)
                }
                PageState::OnSwap => {
                    let mut page = frames.alloc(swap);
                    let index = swap_index.ok_or(VmError::InvalidArgument)?;
                    swap.swap_in(&mut page, index);
                    self.install(&entry, page, page_vaddr, writable, frames)
                }
            }
        } else if self.is_stack_growth(fault_addr, esp) {
            let entry = Arc::new(SptEntry::new(
                page_vaddr,
                PageState::OnFile,
                None,
                0,
                0,
                PAGE_SIZE,
                true,
                false,
            ));
            self.entries.lock().insert(Self::key(page_vaddr), entry.clone());
            let page = frames.alloc(swap);
            self.install(&entry, page, page_vaddr, true, frames)
        } else {
            Err(VmError::InvalidArgument)
        }
    }

    fn install(
        self: &Arc<Self>,
        entry: &Arc<SptEntry>,
        page: Page,
        page_vaddr: Va,
        writable: bool,
        frames: &FrameTable,
    ) -> Result<()> {
        let mut perm = Permission::READ | Permission::USER;
        if writable {
            perm |= Permission::WRITE;
        }
        {
            let mut pt = self.page_table.lock();
            pt.map(page_vaddr, page, perm).map_err(|_| VmError::AlreadyMapped)?;
        }
        entry.inner.lock().state = PageState::Resident;
        frames.register(self.clone(), page_vaddr);
        Ok(())
    }

    /// Called by [`FrameTable::evict_locked`] to reclaim the frame backing
    /// `page_vaddr` (§4.G's second-chance victim handling).
    pub fn evict(&self, page_vaddr: Va, swap: &SwapArea) {
        let entry = self.get(page_vaddr).expect("evict of an untracked page");
        let mut inner = entry.inner.lock();
        let mut pt = self.page_table.lock();
        let dirty = pt.dirty(page_vaddr);
        let page = pt.unmap(page_vaddr).expect("evict: page not resident");
        drop(pt);

        if inner.from_mmap {
            if dirty {
                if let Some(file) = &inner.file {
                    let _ = file.write_at(inner.offset, &page.inner()[..inner.read_bytes]);
                }
            }
            inner.state = PageState::OnFile;
        } else if inner.writable {
            let index = swap.swap_out(&page);
            inner.swap_index = Some(index);
            inner.state = PageState::OnSwap;
        } else {
            inner.state = PageState::OnFile;
        }
    }
}
