//! # Virtual Memory Support
//!
//! x86-64 paging primitives for the kernel's memory manager.
//!
//! ## What you get
//! - [`PageEntry`], [`TableLevel`] and the 4 KiB-aligned [`PageTableNode`].
//! - A bitmap-tracked [`TableArena`] that supplies page-table levels before
//!   any general allocator exists.
//! - An [`AddressSpace`] walker that maps, unmaps and translates through one
//!   translation tree.
//! - The [`identity_map`] builder that maps all RAM with 2 MiB leaves.
//! - The seams to the outside world: [`FrameAlloc`], [`PhysMapper`] and the
//!   [`Mmu`] platform trait.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as indices into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:------------|:-----------|:-------------|
//! | 1 | **PML4** | **PML4E** | Top-level table; one per address space, referenced by CR3. |
//! | 2 | **PDPT** | **PDPTE** | Points to a PD, or maps a 1 GiB page with `PS=1`. |
//! | 3 | **PD**   | **PDE**   | Points to a PT, or maps a 2 MiB page with `PS=1`. |
//! | 4 | **PT**   | **PTE**   | Maps a 4 KiB page (always a leaf). |
//!
//! ## Kernel half
//!
//! PML4 entries `256..512` describe the kernel half. Every address space
//! created by the memory manager starts with a copy of those entries, so the
//! kernel stays mapped across CR3 switches.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
pub mod identity_map;
pub mod page_table;
pub mod platform;
pub mod table_arena;

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crate::address_space::{
    AddressSpace, EntryLocation, MapError, RootTable, TranslationError, Walk, WalkStep,
};
pub use crate::identity_map::{IdentityMap, IdentityMapError};
pub use crate::page_table::{PageEntry, PageTableNode, TableIndex, TableLevel};
pub use crate::platform::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::platform::X86_64Mmu;
pub use crate::table_arena::{ArenaError, TableArena};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of physical 4 KiB frames.
///
/// The implementation decides where frames come from (the table arena, the
/// physical range allocator, a test pool). Returns `None` when empty.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// Converts physical addresses to usable references in the current virtual
/// address space.
///
/// - **Boot**: firmware tables are identity mapped, so `pa` is used as is.
/// - **Kernel**: the identity map at `IDENTITY_MAP_OFFSET` covers all RAM.
pub trait PhysMapper {
    /// # Safety
    /// - `pa` must be mapped writable in the current page tables.
    /// - The mapping must remain valid for `'a`.
    /// - `T` must match the bytes at `pa`, and no other live reference may
    ///   alias them.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}
