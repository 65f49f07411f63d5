//! A process's four-level x86_64 page table.
//!
//! Generalizes the `PageTable`/`PtIndices`/`Walked` shape from
//! `keos-project2/src/page_table.rs` (there, a student exercise left as
//! `todo!()`) into a complete implementation: walking, mapping, unmapping,
//! and the accessed/dirty-bit queries the frame table's second-chance scan
//! needs.

use abyss::x86_64::Cr3;
use alloc::boxed::Box;
use core::ops::Deref;
use keos::addressing::{Pa, Va};
use keos::mm::page_table::{
    PageTableMappingError, PageTableRoot, PdeFlags, PdpeFlags, Permission, Pml4eFlags, Pte,
    PteFlags, StaleTLBEntry,
};
use keos::mm::Page;
use keos::mm::tlb::TlbIpi;

/// A virtual address decomposed into its four page-table indices.
pub struct PtIndices {
    pub va: Va,
    pub pml4ei: usize,
    pub pdptei: usize,
    pub pdei: usize,
    pub ptei: usize,
}

impl PtIndices {
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if va.into_usize() & 0xfff != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let n = va.into_usize();
        Ok(Self {
            va,
            pml4ei: (n >> 39) & 0x1ff,
            pdptei: (n >> 30) & 0x1ff,
            pdei: (n >> 21) & 0x1ff,
            ptei: (n >> 12) & 0x1ff,
        })
    }
}

/// Issues an `invlpg` for `va` on this CPU and shoots it down on every other
/// one, without consuming a [`Page`] the way [`StaleTLBEntry`] does. Used
/// when a mapping's flags change in place (e.g. clearing the accessed bit)
/// rather than being torn down.
fn invalidate_va(pt: &PageTableRoot, va: Va) {
    unsafe {
        core::arch::asm!("invlpg [{0}]", in(reg) va.into_usize(), options(nostack));
    }
    TlbIpi::send(Cr3(pt.pa().into_usize() as u64), Some(va));
}

/// A process's page table: the root PML4 plus every table it owns below
/// [`PageTableRoot::KBASE`].
pub struct PageTable(Box<PageTableRoot>);

impl PageTable {
    /// Creates an empty page table that still maps every kernel address.
    pub fn new() -> Self {
        Self(PageTableRoot::new_boxed_with_kernel_addr())
    }

    pub fn pa(&self) -> Pa {
        self.0.pa()
    }

    /// Maps `va` to `page` with `perm`, allocating intermediate tables as
    /// needed. Fails with [`PageTableMappingError::Duplicated`] if `va` is
    /// already mapped.
    pub fn map(&mut self, va: Va, page: Page, perm: Permission) -> Result<(), PageTableMappingError> {
        let pa = page.into_raw();
        unsafe {
            self.do_map(va, pa, perm).inspect_err(|_| {
                // Give the page back to its allocator on failure.
                drop(unsafe { Page::from_pa(pa) });
            })
        }
    }

    /// # Safety
    /// `pa` must be a valid, currently-owned physical page; ownership
    /// transfers into the page table on success.
    pub unsafe fn do_map(&mut self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;

        let pml4e = &mut self.0[indices.pml4ei];
        if pml4e.pa().is_none() {
            let table = Page::new();
            pml4e.set_pa(table.into_raw())?;
            pml4e.set_flags(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US);
        }
        let pdpe = &mut pml4e.into_pdp_mut()?[indices.pdptei];
        if pdpe.pa().is_none() {
            let table = Page::new();
            pdpe.set_pa(table.into_raw())?;
            pdpe.set_flags(PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US);
        }
        let pde = &mut pdpe.into_pd_mut()?[indices.pdei];
        if pde.pa().is_none() {
            let table = Page::new();
            pde.set_pa(table.into_raw())?;
            pde.set_flags(PdeFlags::P | PdeFlags::RW | PdeFlags::US);
        }
        let pte = &mut pde.into_pt_mut()?[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::Duplicated);
        }

        let mut flags = PteFlags::P | PteFlags::US;
        if perm.contains(Permission::WRITE) {
            flags |= PteFlags::RW;
        }
        if !perm.contains(Permission::USER) {
            flags.remove(PteFlags::US);
        }
        if !perm.contains(Permission::EXECUTABLE) {
            flags |= PteFlags::XD;
        }
        unsafe {
            pte.set_pa(pa)?.set_flags(flags);
        }
        Ok(())
    }

    /// Removes the mapping at `va`, returning the physical page that was
    /// mapped there.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let mut walked = self.walk_mut(va)?;
        walked.clear().ok_or(PageTableMappingError::NotExist).map(StaleTLBEntry::invalidate)
    }

    /// Finds the page table entry for `va`, failing if any level of the
    /// walk is absent or the leaf itself is not present.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp()?;
        let pd = pdp[indices.pdptei].into_pd()?;
        let pt = pd[indices.pdei].into_pt()?;
        let pte = &pt[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            Ok(pte)
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Like [`Self::walk`] but returns a handle that can clear the mapping.
    pub fn walk_mut(&mut self, va: Va) -> Result<Walked<'_>, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp_mut()?;
        let pd = pdp[indices.pdptei].into_pd_mut()?;
        let pt = pd[indices.pdei].into_pt_mut()?;
        let pte = &mut pt[indices.ptei];
        if !pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::NotExist);
        }
        Ok(Walked { addr: va, pte })
    }

    /// True if the MMU has set the accessed bit on `va`'s mapping.
    pub fn accessed(&self, va: Va) -> bool {
        self.walk(va).map(|pte| pte.flags().contains(PteFlags::A)).unwrap_or(false)
    }

    /// True if the MMU has set the dirty bit on `va`'s mapping.
    pub fn dirty(&self, va: Va) -> bool {
        self.walk(va).map(|pte| pte.flags().contains(PteFlags::D)).unwrap_or(false)
    }

    /// Clears the accessed bit on `va`'s mapping in place (§4.G's
    /// second-chance scan gives a set entry one reprieve per pass).
    pub fn clear_accessed(&mut self, va: Va) {
        let root: *const PageTableRoot = self.0.as_ref();
        if let Ok(mut walked) = self.walk_mut(va) {
            let flags = walked.flags() & !PteFlags::A;
            unsafe {
                walked.pte.set_flags(flags);
            }
            invalidate_va(unsafe { &*root }, va);
        }
    }

    /// Tears down every user mapping below [`PageTableRoot::KBASE`] and
    /// frees the intermediate tables. Kernel pages (the shared upper half)
    /// are never touched. Called from [`Drop`].
    fn clear(&mut self) {
        for pml4ei in 0..PageTableRoot::KBASE {
            let Some(pdp_pa) = self.0[pml4ei].pa() else { continue };
            if let Ok(pdp) = self.0[pml4ei].into_pdp_mut() {
                for pdpe in pdp.iter_mut() {
                    let Some(pd_pa) = pdpe.pa() else { continue };
                    if let Ok(pd) = pdpe.into_pd_mut() {
                        for pde in pd.iter_mut() {
                            let Some(pt_pa) = pde.pa() else { continue };
                            if let Ok(pt) = pde.into_pt_mut() {
                                for pte in pt.iter_mut() {
                                    if let Some(pa) = unsafe { pte.clear() } {
                                        drop(unsafe { Page::from_pa(pa) });
                                    }
                                }
                            }
                            pde.clear();
                            drop(unsafe { Page::from_pa(pt_pa) });
                        }
                    }
                    pdpe.clear();
                    drop(unsafe { Page::from_pa(pd_pa) });
                }
            }
            self.0[pml4ei].clear();
            drop(unsafe { Page::from_pa(pdp_pa) });
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        assert_ne!(
            keos::mm::page_table::get_current_pt_pa(),
            self.pa(),
            "Trying to drop activated page table."
        );
        self.clear();
    }
}

/// A mutable handle onto an existing page-table entry.
pub struct Walked<'a> {
    addr: Va,
    pte: &'a mut Pte,
}

impl Walked<'_> {
    /// Clears the mapping, returning a [`StaleTLBEntry`] the caller must
    /// invalidate (or drop into, via [`StaleTLBEntry::invalidate`]).
    pub fn clear(&mut self) -> Option<StaleTLBEntry> {
        unsafe { self.pte.clear().map(|pa| StaleTLBEntry::new(self.addr, Page::from_pa(pa))) }
    }
}

impl Deref for Walked<'_> {
    type Target = Pte;
    fn deref(&self) -> &Self::Target {
        self.pte
    }
}
