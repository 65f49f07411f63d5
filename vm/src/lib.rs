//! Virtual Memory Engine: frame table, supplemental page table, memory-map
//! registry, and the swap area its eviction path falls back to.
//!
//! Built on the same ambient `keos`/`abyss` primitives as the `storage`
//! crate, and on `storage` itself for the `Inode` handles that back
//! file-mapped pages. Component B (Swap Area) lives here rather than in
//! `storage` because its only callers are frame-table eviction and the
//! page-fault service, matching `vm/swap.c`'s placement in the source this
//! is distilled from.
#![no_std]

extern crate alloc;

pub mod error;
pub mod frame;
pub mod mmap;
pub mod page_table;
pub mod spt;
pub mod swap;

pub use error::{Result, VmError};
pub use frame::FrameTable;
pub use mmap::MmapRegistry;
pub use page_table::PageTable;
pub use spt::{PageState, SptEntry, SupplementalPageTable};
pub use swap::SwapArea;
