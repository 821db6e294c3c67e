//! # Page-Table Levels, Entries and Nodes
//!
//! - [`TableLevel`]: one of the four translation levels and the VA slice it indexes.
//! - [`TableIndex`]: a checked index into a 512-entry node.
//! - [`PageEntry`]: the 64-bit entry layout shared by all levels.
//! - [`PageTableNode`]: a 4 KiB-aligned table of 512 entries.
//!
//! The same [`PageEntry`] layout doubles as the flag set callers pass to the
//! mapping operations; the frame field is ignored there and filled in by the
//! mapper.
//!
//! ## Invariants
//!
//! - `present` is checked before the frame field is trusted.
//! - `huge_page` (PS, bit 7) is only meaningful at the PDPT and PD levels; in a
//!   PT entry the same bit selects the PAT and is left clear here.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Number of entries in every page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One level of the 4-level translation tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TableLevel {
    /// Root table, indexed by VA bits 47..39.
    Pml4,
    /// Directory-pointer table, VA bits 38..30. PS=1 maps 1 GiB.
    Pdpt,
    /// Directory, VA bits 29..21. PS=1 maps 2 MiB.
    Pd,
    /// Table, VA bits 20..12. Always a 4 KiB leaf.
    Pt,
}

impl TableLevel {
    /// Walk order from the root down.
    pub const ALL: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Bit offset of this level's 9-bit slice of the virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level an entry of this level points to.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Whether an entry at this level may terminate the walk with PS=1.
    #[inline]
    #[must_use]
    pub const fn allows_huge_leaf(self) -> bool {
        matches!(self, Self::Pdpt | Self::Pd)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index into a page-table node, `0..512`.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of the entry inside its node.
    #[inline]
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.0 as u64 * size_of::<PageEntry>() as u64
    }
}

impl fmt::Display for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page-table entry at any level.
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0     | present |
/// | 1     | writable |
/// | 2     | user |
/// | 3     | write-through |
/// | 4     | cache-disable |
/// | 5     | accessed |
/// | 6     | dirty (leaf only) |
/// | 7     | PS, huge leaf (PDPT/PD only) |
/// | 8     | global (leaf only) |
/// | 9–11  | available to software |
/// | 12–51 | frame number |
/// | 52–62 | available to software |
/// | 63    | no-execute |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Entry is valid; when clear every other bit is ignored by the CPU.
    pub present: bool,
    /// Writes are permitted (subject to CR0.WP for supervisor access).
    pub writable: bool,
    /// Accessible from CPL3.
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    /// Set by the CPU on first access.
    pub accessed: bool,
    /// Set by the CPU on first write to a leaf.
    pub dirty: bool,
    /// PS: the entry maps a 1 GiB (PDPT) or 2 MiB (PD) page directly.
    pub huge_page: bool,
    /// Not flushed from the TLB on CR3 reload.
    pub global: bool,
    #[bits(3)]
    pub available_low: u8,
    /// Physical frame number (address >> 12).
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    pub available_high: u16,
    /// Instruction fetches fault (requires EFER.NXE).
    pub no_execute: bool,
}

impl PageEntry {
    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, read-only, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_present(true).with_writable(true).with_user(true)
    }

    /// Present, read-only, user-accessible.
    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::new().with_present(true).with_user(true)
    }

    /// A non-leaf entry pointing at the child table `page`.
    #[inline]
    #[must_use]
    pub const fn table(page: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(page.number())
    }

    /// A 4 KiB leaf mapping `frame` with the permission bits of `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, flags: Self) -> Self {
        flags
            .with_huge_page(false)
            .with_present(true)
            .with_frame(frame.number())
    }

    /// A 2 MiB PD leaf for `base`, present and writable (as used by the identity map).
    #[inline]
    #[must_use]
    pub const fn large_2m(base: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_huge_page(true)
            .with_frame(base.as_u64() >> 12)
    }

    /// Physical address stored in the frame field.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// The frame field as a 4 KiB page (table pointer or 4 KiB leaf).
    #[inline]
    #[must_use]
    pub const fn frame_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame())
    }

    /// The entry with its frame field cleared, i.e. just the flags.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        self.with_frame(0)
    }

    /// Whether this entry points at a child table when found at `level`.
    #[inline]
    #[must_use]
    pub const fn is_table_at(self, level: TableLevel) -> bool {
        self.present()
            && level.child().is_some()
            && !(level.allows_huge_leaf() && self.huge_page())
    }
}

/// A page-table node: 512 entries, 4 KiB aligned.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTableNode {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTableNode {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            entries: [PageEntry::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn entry(&self, i: TableIndex) -> PageEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set_entry(&mut self, i: TableIndex, e: PageEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[PageEntry; ENTRIES_PER_TABLE] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_is_one_aligned_page() {
        assert_eq!(size_of::<PageTableNode>(), 4096);
        assert_eq!(align_of::<PageTableNode>(), 4096);
        assert_eq!(size_of::<PageEntry>(), 8);
    }

    #[test]
    fn indices_follow_nine_bit_slices() {
        // PML4=0x111, PDPT=0x004, PD=0x009, PT=0x034
        let va = VirtualAddress::new(0xFFFF_8881_0123_4567);
        assert_eq!(TableLevel::Pml4.index_of(va).as_usize(), 0x111);
        assert_eq!(TableLevel::Pdpt.index_of(va).as_usize(), 0x004);
        assert_eq!(TableLevel::Pd.index_of(va).as_usize(), 0x009);
        assert_eq!(TableLevel::Pt.index_of(va).as_usize(), 0x034);
    }

    #[test]
    fn entry_bit_positions() {
        let e = PageEntry::kernel_rw()
            .with_huge_page(true)
            .with_no_execute(true)
            .with_frame(0xA_BCDE);
        assert_eq!(e.into_bits(), (1 << 63) | 0xABCD_E000 | 0b1000_0011);
        assert_eq!(e.address().as_u64(), 0xABCD_E000);
        assert_eq!(e.flags().into_bits(), (1 << 63) | 0b1000_0011);
    }

    #[test]
    fn leaf_forces_present_and_clears_ps() {
        let frame = PhysicalPage::<Size4K>::from_number(0x42);
        let e = PageEntry::leaf(frame, PageEntry::new().with_writable(true).with_huge_page(true));
        assert!(e.present());
        assert!(!e.huge_page());
        assert_eq!(e.frame_page(), frame);
    }

    #[test]
    fn identity_leaf_matches_raw_encoding() {
        let e = PageEntry::large_2m(PhysicalAddress::new(0x20_0000));
        assert_eq!(e.into_bits(), 0x20_0000 | 0b1000_0011);
        assert!(!e.is_table_at(TableLevel::Pd));
        assert!(PageEntry::table(PhysicalPage::from_number(1), false).is_table_at(TableLevel::Pd));
        assert!(!PageEntry::kernel_rw().is_table_at(TableLevel::Pt));
    }

    #[test]
    fn entry_offsets() {
        assert_eq!(TableIndex::new(3).byte_offset(), 24);
        let mut node = PageTableNode::zero();
        node.set_entry(TableIndex::new(511), PageEntry::kernel_ro());
        assert_eq!(node.entries().iter().filter(|e| e.present()).count(), 1);
        assert!(node.entry(TableIndex::new(511)).present());
    }
}
