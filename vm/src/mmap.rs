//! Memory-Map Registry (component I, §4.I): per-process list of active
//! file mappings, and the `mmap`/`munmap` operations over it.
//!
//! Generalizes `keos-project2/src/mm_struct.rs`'s `MmStruct::mmap`/`munmap`
//! (there, argument-parsing wrappers around a `todo!()` pager) into a
//! complete implementation sitting on top of [`SupplementalPageTable`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use keos::addressing::Va;
use storage::inode::Inode;

use crate::error::{Result, VmError};
use crate::frame::FrameTable;
use crate::spt::{SupplementalPageTable, USER_BASE, USER_TOP};

const PAGE_SIZE: usize = 4096;

/// One active `mmap` region (§3, "Mmap descriptor").
pub struct MmapDescriptor {
    pub mapping_id: usize,
    pub base_vaddr: Va,
    pub page_count: usize,
    file: Arc<Inode>,
}

/// A process's table of active `mmap` regions.
pub struct MmapRegistry {
    spt: Arc<SupplementalPageTable>,
    frames: Arc<FrameTable>,
    mappings: storage::sync::Mutex<Vec<MmapDescriptor>>,
    next_id: AtomicUsize,
}

impl MmapRegistry {
    pub fn new(spt: Arc<SupplementalPageTable>, frames: Arc<FrameTable>) -> Self {
        Self {
            spt,
            frames,
            mappings: storage::sync::Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Maps `file` at `addr`, per the preconditions in §4.I: `addr` must be
    /// non-zero, page-aligned, at or above [`USER_BASE`], the file must be
    /// non-empty, and no page in the resulting range may already carry an
    /// SPT entry.
    ///
    /// On success, one `ON_FILE`, writable, `from_mmap` SPT entry is
    /// installed per page; on any precondition failure, every entry added
    /// so far by this call is rolled back.
    pub fn mmap(&self, file: Arc<Inode>, addr: Va) -> Result<usize> {
        let length = file.length();
        if addr.into_usize() == 0 || addr.into_usize() < USER_BASE {
            return Err(VmError::InvalidArgument);
        }
        if addr.into_usize() % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        let end = addr.into_usize() + page_count * PAGE_SIZE;
        if end > USER_TOP {
            return Err(VmError::InvalidArgument);
        }

        let mut installed = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let page_vaddr = addr + i * PAGE_SIZE;
            let offset = i * PAGE_SIZE;
            let remaining = length - offset;
            let read_bytes = remaining.min(PAGE_SIZE);
            let zero_bytes = PAGE_SIZE - read_bytes;
            let result = self.spt.insert_file_backed(
                page_vaddr,
                file.clone(),
                offset,
                read_bytes,
                zero_bytes,
                true,
                true,
            );
            match result {
                Ok(()) => installed.push(page_vaddr),
                Err(e) => {
                    for va in installed {
                        self.spt.remove(va);
                    }
                    return Err(e);
                }
            }
        }

        let mapping_id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.mappings.lock().push(MmapDescriptor {
            mapping_id,
            base_vaddr: addr,
            page_count,
            file,
        });
        Ok(mapping_id)
    }

    /// Tears down the mapping named by `mapping_id`: for each page still
    /// resident, writes it back to the file if the MMU dirty bit is set,
    /// then releases its frame and SPT entry. Pages never faulted in are
    /// simply dropped from the SPT.
    pub fn munmap(&self, mapping_id: usize) -> Result<()> {
        let descriptor = {
            let mut mappings = self.mappings.lock();
            let idx = mappings
                .iter()
                .position(|m| m.mapping_id == mapping_id)
                .ok_or(VmError::NotMapped)?;
            mappings.remove(idx)
        };

        for i in 0..descriptor.page_count {
            let page_vaddr = descriptor.base_vaddr + i * PAGE_SIZE;
            if let Some(entry) = self.spt.remove(page_vaddr) {
                if entry.state() == crate::spt::PageState::Resident {
                    self.spt.with_page_table(|pt| {
                        let dirty = pt.dirty(page_vaddr);
                        if let Ok(page) = pt.unmap(page_vaddr) {
                            if dirty {
                                let offset = i * PAGE_SIZE;
                                let remaining = descriptor.file.length().saturating_sub(offset);
                                let read_bytes = remaining.min(PAGE_SIZE);
                                let _ = descriptor.file.write_at(offset, &page.inner()[..read_bytes]);
                            }
                        }
                    });
                    self.frames.unregister(&self.spt, page_vaddr);
                }
            }
        }
        // `descriptor.file` is the registry's own reopened handle; dropping
        // it here releases that reference (the underlying inode stays open
        // as long as anyone else holds it).
        drop(descriptor.file);
        Ok(())
    }
}
