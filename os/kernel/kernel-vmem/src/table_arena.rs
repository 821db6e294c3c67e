//! # Table-Level Arena
//!
//! Intermediate page tables are needed before any general allocator exists,
//! so they come from a fixed pool of physically contiguous, page-aligned
//! slots reserved in the kernel image. Slot `i` lives at `base + i * 4096`;
//! a bitmap records which slots are handed out.
//!
//! ```text
//! base                                            base + slots * 4 KiB
//! ├────────┬────────┬────────┬────────┬─────┬────────┤
//! │ slot 0 │ slot 1 │ slot 2 │ slot 3 │ ... │ slot n │
//! └────────┴────────┴────────┴────────┴─────┴────────┘
//! bitmap:     1        1        0        1    ...  0
//! ```
//!
//! The arena only does bookkeeping; callers zero a slot before using it as a
//! table (see [`AddressSpace`](crate::AddressSpace)).

use crate::FrameAlloc;
use kernel_info::memory::TABLE_ARENA_SLOTS;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use log::debug;

const WORDS: usize = TABLE_ARENA_SLOTS / u64::BITS as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArenaError {
    #[error("table arena exhausted: all {capacity} slots in use")]
    Exhausted { capacity: usize },
    #[error("{0} is not a slot of the table arena")]
    InvalidPointer(PhysicalAddress),
    #[error("table arena slot {0} is not in use")]
    NotInUse(PhysicalAddress),
    #[error("table arena self-check failed: freed slot {expected} was not reused (got {got})")]
    SelfCheck {
        expected: PhysicalAddress,
        got: PhysicalAddress,
    },
}

/// Bitmap-tracked pool of page-table slots.
pub struct TableArena {
    base: PhysicalPage<Size4K>,
    slots: usize,
    /// Bit `i` set: slot `i` is allocated. Bits at and above `slots` stay set.
    bitmap: [u64; WORDS],
    in_use: usize,
}

impl TableArena {
    /// An arena of `slots` tables starting at `base`.
    ///
    /// `slots` is clamped to [`TABLE_ARENA_SLOTS`].
    #[must_use]
    pub const fn new(base: PhysicalPage<Size4K>, slots: usize) -> Self {
        let slots = if slots > TABLE_ARENA_SLOTS {
            TABLE_ARENA_SLOTS
        } else {
            slots
        };
        let mut bitmap = [0u64; WORDS];
        let mut i = slots;
        while i < TABLE_ARENA_SLOTS {
            bitmap[i / 64] |= 1 << (i % 64);
            i += 1;
        }
        Self {
            base,
            slots,
            bitmap,
            in_use: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalPage<Size4K> {
        self.base
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots
    }

    #[must_use]
    pub const fn in_use(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub const fn available(&self) -> usize {
        self.slots - self.in_use
    }

    /// Whether `pa` lies inside the pool (not necessarily at a slot boundary).
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        let start = self.base.base().as_u64();
        let pa = pa.as_u64();
        pa >= start && pa - start < (self.slots as u64) * 4096
    }

    /// Hand out the lowest free slot.
    ///
    /// # Errors
    /// [`ArenaError::Exhausted`] when every slot is in use.
    pub fn allocate_table_level(&mut self) -> Result<PhysicalPage<Size4K>, ArenaError> {
        let Some((word, bits)) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
        else {
            return Err(ArenaError::Exhausted {
                capacity: self.slots,
            });
        };

        let bit = bits.trailing_ones() as usize;
        *bits |= 1 << bit;
        self.in_use += 1;

        let slot = word * 64 + bit;
        let page = self.slot_page(slot);
        debug!("table arena: slot {slot} -> {page}");
        Ok(page)
    }

    /// Return a slot to the pool.
    ///
    /// # Errors
    /// - [`ArenaError::InvalidPointer`] if `pa` is outside the pool or not slot-aligned.
    /// - [`ArenaError::NotInUse`] if the slot is already free.
    pub fn free_table_level(&mut self, pa: PhysicalAddress) -> Result<(), ArenaError> {
        let slot = self.slot_of(pa).ok_or(ArenaError::InvalidPointer(pa))?;
        let (word, mask) = (slot / 64, 1u64 << (slot % 64));
        if self.bitmap[word] & mask == 0 {
            return Err(ArenaError::NotInUse(pa));
        }
        self.bitmap[word] &= !mask;
        self.in_use -= 1;
        Ok(())
    }

    /// Allocate three slots, free the middle one and check it is handed out again.
    ///
    /// Leaves the arena as it found it.
    ///
    /// # Errors
    /// [`ArenaError::Exhausted`] with fewer than three free slots, or
    /// [`ArenaError::SelfCheck`] if first-fit reuse is broken.
    pub fn self_check(&mut self) -> Result<(), ArenaError> {
        if self.available() < 3 {
            return Err(ArenaError::Exhausted {
                capacity: self.slots,
            });
        }
        let a = self.allocate_table_level()?;
        let b = self.allocate_table_level()?;
        let c = self.allocate_table_level()?;
        self.free_table_level(b.base())?;
        let again = self.allocate_table_level()?;
        for page in [a, again, c] {
            self.free_table_level(page.base())?;
        }
        if again == b {
            Ok(())
        } else {
            Err(ArenaError::SelfCheck {
                expected: b.base(),
                got: again.base(),
            })
        }
    }

    const fn slot_page(&self, slot: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.base.number() + slot as u64)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn slot_of(&self, pa: PhysicalAddress) -> Option<usize> {
        if !self.contains(pa) || !pa.is_aligned::<Size4K>() {
            return None;
        }
        Some(((pa.as_u64() - self.base.base().as_u64()) / 4096) as usize)
    }
}

impl FrameAlloc for TableArena {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_table_level().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(slots: usize) -> TableArena {
        TableArena::new(PhysicalPage::from_number(0x100), slots)
    }

    #[test]
    fn first_fit_in_slot_order() {
        let mut a = arena(8);
        let p0 = a.allocate_table_level().unwrap();
        let p1 = a.allocate_table_level().unwrap();
        assert_eq!(p0.base().as_u64(), 0x10_0000);
        assert_eq!(p1.base().as_u64(), 0x10_1000);
        assert_eq!(a.in_use(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut a = arena(2);
        a.allocate_table_level().unwrap();
        a.allocate_table_level().unwrap();
        assert_eq!(
            a.allocate_table_level(),
            Err(ArenaError::Exhausted { capacity: 2 })
        );
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let mut a = arena(8);
        let _p0 = a.allocate_table_level().unwrap();
        let p1 = a.allocate_table_level().unwrap();
        let _p2 = a.allocate_table_level().unwrap();
        a.free_table_level(p1.base()).unwrap();
        assert_eq!(a.allocate_table_level().unwrap(), p1);
    }

    #[test]
    fn free_rejects_foreign_and_unused_slots() {
        let mut a = arena(4);
        let p0 = a.allocate_table_level().unwrap();

        let outside = PhysicalAddress::new(0x10_4000);
        assert_eq!(a.free_table_level(outside), Err(ArenaError::InvalidPointer(outside)));
        let inside = p0.base() + 8;
        assert_eq!(a.free_table_level(inside), Err(ArenaError::InvalidPointer(inside)));
        let unused = PhysicalAddress::new(0x10_2000);
        assert_eq!(a.free_table_level(unused), Err(ArenaError::NotInUse(unused)));

        a.free_table_level(p0.base()).unwrap();
        assert_eq!(a.free_table_level(p0.base()), Err(ArenaError::NotInUse(p0.base())));
    }

    #[test]
    fn slots_past_capacity_are_never_handed_out() {
        let mut a = arena(65);
        for _ in 0..65 {
            let page = a.allocate_table_level().unwrap();
            assert!(a.contains(page.base()));
        }
        assert!(a.allocate_table_level().is_err());
        assert_eq!(a.available(), 0);
    }

    #[test]
    fn self_check_leaves_arena_untouched() {
        let mut a = arena(8);
        let held = a.allocate_table_level().unwrap();
        a.self_check().unwrap();
        assert_eq!(a.in_use(), 1);
        assert_ne!(a.allocate_table_level().unwrap(), held);
    }

    #[test]
    fn self_check_needs_three_slots() {
        let mut a = arena(2);
        assert!(matches!(a.self_check(), Err(ArenaError::Exhausted { .. })));
    }
}
