//! # Address Space (x86-64, PML4-rooted)
//!
//! [`AddressSpace`] is a view of one translation tree through a
//! [`PhysMapper`]. It walks, builds and edits the tree but owns neither the
//! tables nor the data frames; those come from the caller's allocators.
//!
//! ## Walks
//!
//! - [`map_page`](AddressSpace::map_page) creates missing levels on the way
//!   down and writes a 4 KiB leaf.
//! - [`translate`](AddressSpace::translate) and
//!   [`leaf_entry`](AddressSpace::leaf_entry) are read-only and stop with
//!   [`TranslationError::NotPresent`] at the first missing level.
//! - [`walk`](AddressSpace::walk) records every entry it passes, for
//!   diagnostics.
//!
//! Non-leaf entries are created present + writable, and user-accessible when
//! the leaf below them is. Existing parents are widened the same way, since
//! the CPU intersects permissions along the walk.
//!
//! ## Safety
//!
//! Editing the active tree requires TLB maintenance by the caller.

use crate::page_table::{ENTRIES_PER_TABLE, PageEntry, PageTableNode, TableIndex, TableLevel};
use crate::table_arena::{ArenaError, TableArena};
use crate::{FrameAlloc, PhysMapper};
use kernel_info::memory::KERNEL_SPACE_PML4_INDEX;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use log::{debug, trace};

/// The PML4 frame of an address space.
pub type RootTable = PhysicalPage<Size4K>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum TranslationError {
    #[error("{level} entry for {va} is not present")]
    NotPresent { level: TableLevel, va: VirtualAddress },
    #[error("{va} is mapped by a huge {level} leaf, not a 4K page")]
    HugePage { level: TableLevel, va: VirtualAddress },
}

impl TranslationError {
    /// The level at which the walk stopped.
    #[must_use]
    pub const fn level(&self) -> TableLevel {
        match *self {
            Self::NotPresent { level, .. } | Self::HugePage { level, .. } => level,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no table slot left for a new {level}")]
    TableExhausted { level: TableLevel },
    #[error("{va} lies inside a huge {level} mapping")]
    HugePageConflict { level: TableLevel, va: VirtualAddress },
}

/// Where the entry that maps a virtual address lives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EntryLocation {
    pub level: TableLevel,
    pub table: PhysicalPage<Size4K>,
    pub index: TableIndex,
    pub entry: PageEntry,
}

impl EntryLocation {
    /// Physical address of the 8-byte entry itself.
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.table.join(self.index.byte_offset())
    }
}

/// One entry visited by [`AddressSpace::walk`].
#[derive(Debug, Copy, Clone)]
pub struct WalkStep {
    pub level: TableLevel,
    pub table: PhysicalPage<Size4K>,
    pub index: TableIndex,
    pub entry: PageEntry,
}

/// The entries visited on the way to a virtual address, root first.
#[derive(Debug, Clone, Default)]
pub struct Walk {
    steps: [Option<WalkStep>; 4],
}

impl Walk {
    pub fn steps(&self) -> impl Iterator<Item = &WalkStep> {
        self.steps.iter().flatten()
    }

    /// The last entry visited.
    #[must_use]
    pub fn last(&self) -> Option<&WalkStep> {
        self.steps().last()
    }
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootTable,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M, root: RootTable) -> Self {
        Self { root, mapper }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootTable {
        self.root
    }

    #[inline]
    pub(crate) fn node(&self, page: PhysicalPage<Size4K>) -> &'m mut PageTableNode {
        // SAFETY: every page handed in comes from a present table entry, the
        // root, or a freshly allocated slot; the mapper yields a writable view.
        unsafe { self.mapper.phys_to_mut::<PageTableNode>(page.base()) }
    }

    /// Overwrite the root table with zeroes.
    pub fn clear_root(&self) {
        *self.node(self.root) = PageTableNode::zero();
    }

    /// Copy the kernel-half root entries (PML4 256..512) from `source`.
    ///
    /// The copy is a snapshot: entries added to `source` later are not seen
    /// here, although tables below already-shared entries are.
    pub fn copy_kernel_half_from<N: PhysMapper>(&self, source: &AddressSpace<'_, N>) {
        let src = source.node(source.root);
        let dst = self.node(self.root);
        for i in KERNEL_SPACE_PML4_INDEX..ENTRIES_PER_TABLE {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            dst.set_entry(idx, src.entry(idx));
        }
    }

    /// Map the 4 KiB page containing `va` to `frame`.
    ///
    /// Missing PDPT/PD/PT levels are taken from `tables` and zeroed. Remapping
    /// overwrites the leaf and reuses the existing chain. Returns the previous
    /// leaf entry.
    ///
    /// Parent entries in the kernel half never gain the user bit, since they
    /// are shared with every address space.
    ///
    /// # Errors
    /// - [`MapError::TableExhausted`] if a level is missing and `tables` is empty.
    /// - [`MapError::HugePageConflict`] if a 1 GiB or 2 MiB leaf covers `va`.
    pub fn map_page<A: FrameAlloc + ?Sized>(
        &self,
        tables: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntry,
    ) -> Result<PageEntry, MapError> {
        let user_path = flags.user() && !in_kernel_half(va);
        let mut node = self.node(self.root);
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            node = self.descend_or_create(tables, node, level, va, flags.writable(), user_path)?;
        }

        let idx = TableLevel::Pt.index_of(va);
        let previous = node.entry(idx);
        node.set_entry(idx, PageEntry::leaf(frame, flags));
        trace!("map {va} -> {frame} ({:#x})", flags.flags().into_bits());
        Ok(previous)
    }

    fn descend_or_create<A: FrameAlloc + ?Sized>(
        &self,
        tables: &mut A,
        parent: &mut PageTableNode,
        level: TableLevel,
        va: VirtualAddress,
        writable: bool,
        user: bool,
    ) -> Result<&'m mut PageTableNode, MapError> {
        let idx = level.index_of(va);
        let entry = parent.entry(idx);

        if entry.present() {
            if level.allows_huge_leaf() && entry.huge_page() {
                return Err(MapError::HugePageConflict { level, va });
            }
            let widened = entry
                .with_writable(entry.writable() || writable)
                .with_user(entry.user() || user);
            if widened.into_bits() != entry.into_bits() {
                parent.set_entry(idx, widened);
            }
            return Ok(self.node(entry.frame_page()));
        }

        let child = level.child().unwrap_or(TableLevel::Pt);
        let page = tables
            .alloc_4k()
            .ok_or(MapError::TableExhausted { level: child })?;
        let node = self.node(page);
        *node = PageTableNode::zero();
        parent.set_entry(idx, PageEntry::table(page, user));
        debug!("new {child} at {page} for {va}");
        Ok(node)
    }

    /// Clear the present bit of the 4 KiB leaf for `va`; returns the old entry.
    ///
    /// Intermediate tables stay in place even if they become empty.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] if `va` is not mapped, or
    /// [`TranslationError::HugePage`] if it is covered by a huge leaf.
    pub fn unmap_page(&self, va: VirtualAddress) -> Result<PageEntry, TranslationError> {
        let loc = self.leaf_entry(va)?;
        if loc.level != TableLevel::Pt {
            return Err(TranslationError::HugePage {
                level: loc.level,
                va,
            });
        }
        if !loc.entry.present() {
            return Err(TranslationError::NotPresent {
                level: TableLevel::Pt,
                va,
            });
        }
        self.node(loc.table)
            .set_entry(loc.index, loc.entry.with_present(false));
        trace!("unmap {va}");
        Ok(loc.entry)
    }

    /// Locate the entry that terminates the walk for `va`.
    ///
    /// This is the PT entry for 4 KiB mappings, or the PDPT/PD entry of a huge
    /// leaf. The returned entry may itself be non-present at the PT level.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the first missing upper level.
    pub fn leaf_entry(&self, va: VirtualAddress) -> Result<EntryLocation, TranslationError> {
        let mut table = self.root;
        for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
            let index = level.index_of(va);
            let entry = self.node(table).entry(index);
            if !entry.present() {
                return Err(TranslationError::NotPresent { level, va });
            }
            if level.allows_huge_leaf() && entry.huge_page() {
                return Ok(EntryLocation {
                    level,
                    table,
                    index,
                    entry,
                });
            }
            table = entry.frame_page();
        }

        let index = TableLevel::Pt.index_of(va);
        Ok(EntryLocation {
            level: TableLevel::Pt,
            table,
            index,
            entry: self.node(table).entry(index),
        })
    }

    /// Translate `va` to a physical address, preserving the page offset.
    ///
    /// Handles 1 GiB, 2 MiB and 4 KiB leaves.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the level that is missing.
    pub fn translate(&self, va: VirtualAddress) -> Result<PhysicalAddress, TranslationError> {
        let loc = self.leaf_entry(va)?;
        if !loc.entry.present() {
            return Err(TranslationError::NotPresent {
                level: loc.level,
                va,
            });
        }
        let base = loc.entry.address().as_u64();
        let pa = match loc.level {
            TableLevel::Pdpt => (base & !(Size1G::SIZE - 1)) | va.offset::<Size1G>(),
            TableLevel::Pd => (base & !(Size2M::SIZE - 1)) | va.offset::<Size2M>(),
            _ => base | va.offset::<Size4K>(),
        };
        Ok(PhysicalAddress::new(pa))
    }

    /// Record the entries visited on the way to `va`, stopping at the first
    /// non-present entry or leaf.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Walk {
        let mut walk = Walk::default();
        let mut table = self.root;
        for (slot, level) in TableLevel::ALL.into_iter().enumerate() {
            let index = level.index_of(va);
            let entry = self.node(table).entry(index);
            walk.steps[slot] = Some(WalkStep {
                level,
                table,
                index,
                entry,
            });
            if !entry.is_table_at(level) {
                break;
            }
            table = entry.frame_page();
        }
        walk
    }

    /// Return every lower-half table level (PML4 0..256) of this space to
    /// `arena`, then clear those root entries.
    ///
    /// Tables that do not belong to the arena are left alone. Leaf frames are
    /// not touched. Returns the number of slots released.
    ///
    /// # Errors
    /// Propagates [`ArenaError`] if a slot is found twice.
    pub fn release_lower_half(&self, arena: &mut TableArena) -> Result<usize, ArenaError> {
        let root = self.node(self.root);
        let mut released = 0;
        for i in 0..KERNEL_SPACE_PML4_INDEX {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            let entry = root.entry(idx);
            if entry.is_table_at(TableLevel::Pml4) {
                released += self.release_subtree(arena, entry.frame_page(), TableLevel::Pdpt)?;
            }
            root.set_entry(idx, PageEntry::new());
        }
        Ok(released)
    }

    fn release_subtree(
        &self,
        arena: &mut TableArena,
        table: PhysicalPage<Size4K>,
        level: TableLevel,
    ) -> Result<usize, ArenaError> {
        let mut released = 0;
        if let Some(child) = level.child() {
            for entry in self.node(table).entries() {
                if entry.is_table_at(level) {
                    released += self.release_subtree(arena, entry.frame_page(), child)?;
                }
            }
        }
        if arena.contains(table.base()) {
            arena.free_table_level(table.base())?;
            released += 1;
        }
        Ok(released)
    }
}

/// Whether `va` falls under one of the shared PML4 slots.
const fn in_kernel_half(va: VirtualAddress) -> bool {
    TableLevel::Pml4.index_of(va).as_usize() >= KERNEL_SPACE_PML4_INDEX
}
