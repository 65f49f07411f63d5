//! Swap area: a bitmap-indexed slab of swap slots on a dedicated disk.
//!
//! `storage::sync::Mutex` guards the bitmap *and* the disk I/O together, so
//! a `swap_out`/`swap_in` is atomic with respect to other swap traffic —
//! feasible only because the mutex parks rather than spins across the
//! suspension point. Grounded on `storage::freemap` for the bitmap-over-disk
//! shape and on `keos::fs::Disk` for the raw 512-byte sector API.

use alloc::vec;
use alloc::vec::Vec;
use keos::fs::{Disk, Sector};
use keos::mm::Page;

/// Sectors needed to hold one 4096-byte page.
const SECTORS_PER_SLOT: usize = 8;

struct SwapInner {
    bits: Vec<u64>,
    slots: usize,
}

impl SwapInner {
    fn is_set(&self, index: usize) -> bool {
        self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bits[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.bits[index / 64] &= !(1 << (index % 64));
    }

    fn find_free(&self) -> Option<usize> {
        (0..self.slots).find(|&i| !self.is_set(i))
    }
}

/// A dedicated disk used exclusively to hold evicted anonymous pages.
pub struct SwapArea {
    disk: Disk,
    inner: storage::sync::Mutex<SwapInner>,
}

impl SwapArea {
    /// Opens the swap area backed by `disk`, which spans `total_sectors`
    /// 512-byte sectors (so `total_sectors / SECTORS_PER_SLOT` pages' worth
    /// of swap capacity).
    pub fn new(disk: Disk, total_sectors: usize) -> Self {
        let slots = total_sectors / SECTORS_PER_SLOT;
        let words = slots.div_ceil(64);
        Self {
            disk,
            inner: storage::sync::Mutex::new(SwapInner {
                bits: vec![0u64; words],
                slots,
            }),
        }
    }

    /// Writes `page` to a free slot and returns its index. Holds the swap
    /// lock across both the bitmap update and the write, so a concurrent
    /// `swap_in`/`swap_out` never observes a half-written slot.
    ///
    /// Swap exhaustion is a kernel panic: there is no fallback once physical
    /// memory's last valve is full.
    pub fn swap_out(&self, page: &Page) -> usize {
        let mut inner = self.inner.lock();
        let index = inner.find_free().expect("swap area exhausted");
        inner.set(index);
        let data = page.inner();
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            buf.copy_from_slice(&data[i * 512..(i + 1) * 512]);
            self.disk
                .write(Sector(index * SECTORS_PER_SLOT + i), &buf)
                .expect("swap disk write failed");
        }
        index
    }

    /// Reads slot `index` back into `page` and frees the slot.
    pub fn swap_in(&self, page: &mut Page, index: usize) {
        let mut inner = self.inner.lock();
        assert!(inner.is_set(index), "swap_in of an unallocated slot");
        inner.clear(index);
        let data = page.inner_mut();
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            self.disk
                .read(Sector(index * SECTORS_PER_SLOT + i), &mut buf)
                .expect("swap disk read failed");
            data[i * 512..(i + 1) * 512].copy_from_slice(&buf);
        }
    }
}
