//! # Physical Range Allocator
//!
//! Turns the firmware memory map into a list of range descriptors and carves
//! page-granular extents out of the free ones.
//!
//! Descriptors live in a fixed arena and are chained through `u16` indices,
//! so the allocator needs no memory of its own:
//!
//! ```text
//! head ─► [0] 0x0000_0000 +0x9F000  free
//!          │
//!          ▼
//!         [1] 0x0009_F000 +0x61000  reserved (used)
//!          │
//!          ▼
//!         [2] 0x0010_0000 +0x4000   allocated
//!          │
//!          ▼
//!         [5] 0x0010_4000 +0x7EFC000 free      ◄─ split remainder, unused slot
//! ```
//!
//! ## Invariants
//! - Descriptors reachable from `head` never overlap.
//! - Free descriptors are page aligned at both ends; sub-page slivers of the
//!   firmware entries are dropped.
//! - Allocation only ever splits a free descriptor into an allocated head and
//!   a free tail. Nothing is merged or returned.

use kernel_info::boot::{MemoryMapEntry, MemoryType};
use kernel_info::memory::RANGE_DESCRIPTOR_CAPACITY;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;
use log::{debug, info, warn};

/// End-of-list marker for descriptor links.
pub const NIL: u16 = u16::MAX;

/// What a range descriptor describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeStatus {
    /// Slot not in the list.
    Unused,
    /// Usable RAM, not handed out.
    Free,
    /// Handed out by [`RangeAllocator::allocate_range`].
    Allocated,
    /// Not usable, tagged with the firmware's classification.
    Reserved(MemoryType),
}

/// One extent of physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RangeDescriptor {
    pub base: PhysicalAddress,
    pub size: u64,
    pub status: RangeStatus,
    next: u16,
}

impl RangeDescriptor {
    const UNUSED: Self = Self {
        base: PhysicalAddress::ZERO,
        size: 0,
        status: RangeStatus::Unused,
        next: NIL,
    };

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.size
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RangeAllocError {
    #[error("cannot allocate an empty range")]
    InvalidSize,
    #[error("no free physical range of {requested:#x} bytes")]
    OutOfMemory { requested: u64 },
    #[error("memory map does not fit into {capacity} range descriptors")]
    TooManyEntries { capacity: usize },
    #[error("range allocator is already initialized")]
    AlreadyInitialized,
}

/// First-fit allocator over physical ranges.
pub struct RangeAllocator {
    slots: [RangeDescriptor; RANGE_DESCRIPTOR_CAPACITY],
    head: u16,
    initialized: bool,
    total_usable: u64,
    free_bytes: u64,
    highest: u64,
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [RangeDescriptor::UNUSED; RANGE_DESCRIPTOR_CAPACITY],
            head: NIL,
            initialized: false,
            total_usable: 0,
            free_bytes: 0,
            highest: 0,
        }
    }

    /// Record every non-empty firmware entry, in firmware order.
    ///
    /// Usable entries are shrunk inward to page boundaries and dropped if
    /// nothing is left; all others are kept as reserved.
    ///
    /// # Errors
    /// - [`RangeAllocError::AlreadyInitialized`] on a second call.
    /// - [`RangeAllocError::TooManyEntries`] if the map needs more descriptors
    ///   than there are. The allocator is left untouched.
    pub fn initialize(&mut self, entries: &[MemoryMapEntry]) -> Result<(), RangeAllocError> {
        if self.initialized {
            return Err(RangeAllocError::AlreadyInitialized);
        }

        let needed = entries.iter().filter_map(classify).count();
        if needed > RANGE_DESCRIPTOR_CAPACITY {
            return Err(RangeAllocError::TooManyEntries {
                capacity: RANGE_DESCRIPTOR_CAPACITY,
            });
        }

        let mut tail = NIL;
        for (slot, desc) in entries.iter().filter_map(classify).enumerate() {
            debug!(
                "range {slot}: {} +{:#x} {:?}",
                desc.base, desc.size, desc.status
            );
            if desc.status == RangeStatus::Free {
                self.total_usable += desc.size;
            }
            self.slots[slot] = desc;
            #[allow(clippy::cast_possible_truncation)]
            let index = slot as u16;
            if tail == NIL {
                self.head = index;
            } else {
                self.slots[usize::from(tail)].next = index;
            }
            tail = index;
        }

        self.highest = kernel_info::boot::highest_address(entries);
        self.free_bytes = self.total_usable;
        self.initialized = true;
        info!(
            "physical memory: {} KiB usable in {needed} ranges, top at {:#x}",
            self.total_usable / 1024,
            self.highest
        );
        Ok(())
    }

    /// Hand out `size` bytes, rounded up to whole pages, from the first free
    /// range that is large enough.
    ///
    /// If no unused descriptor is left to hold the remainder, the whole range
    /// is handed out.
    ///
    /// # Errors
    /// - [`RangeAllocError::InvalidSize`] if `size` is zero.
    /// - [`RangeAllocError::OutOfMemory`] if no free range fits.
    pub fn allocate_range(&mut self, size: u64) -> Result<PhysicalAddress, RangeAllocError> {
        if size == 0 {
            return Err(RangeAllocError::InvalidSize);
        }
        let requested = size
            .checked_next_multiple_of(Size4K::SIZE)
            .ok_or(RangeAllocError::OutOfMemory { requested: size })?;

        let mut cursor = self.head;
        while cursor != NIL {
            let i = usize::from(cursor);
            let desc = self.slots[i];
            if desc.status == RangeStatus::Free && desc.size >= requested {
                return Ok(self.carve(i, requested));
            }
            cursor = desc.next;
        }

        Err(RangeAllocError::OutOfMemory { requested })
    }

    fn carve(&mut self, i: usize, requested: u64) -> PhysicalAddress {
        let desc = self.slots[i];
        if desc.size > requested {
            if let Some(spare) = self.unused_slot() {
                self.slots[spare] = RangeDescriptor {
                    base: desc.base + requested,
                    size: desc.size - requested,
                    status: RangeStatus::Free,
                    next: desc.next,
                };
                #[allow(clippy::cast_possible_truncation)]
                let spare = spare as u16;
                self.slots[i].next = spare;
                self.slots[i].size = requested;
            } else {
                warn!(
                    "no spare range descriptor: handing out {:#x} bytes for a {requested:#x} byte request",
                    desc.size
                );
            }
        }

        self.slots[i].status = RangeStatus::Allocated;
        self.free_bytes -= self.slots[i].size;
        debug!("allocated {} +{:#x}", desc.base, self.slots[i].size);
        desc.base
    }

    fn unused_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|d| d.status == RangeStatus::Unused)
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Usable bytes reported by the firmware after page trimming.
    #[must_use]
    pub const fn total_usable(&self) -> u64 {
        self.total_usable
    }

    /// Usable bytes not yet handed out.
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// End of the highest firmware entry.
    #[must_use]
    pub const fn highest_address(&self) -> u64 {
        self.highest
    }

    /// The descriptor list in order.
    pub fn descriptors(&self) -> impl Iterator<Item = &RangeDescriptor> {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let desc = &self.slots[usize::from(cursor)];
            cursor = desc.next;
            Some(desc)
        })
    }
}

/// The descriptor a firmware entry turns into, if any.
fn classify(entry: &MemoryMapEntry) -> Option<RangeDescriptor> {
    if entry.is_empty() {
        return None;
    }
    match entry.memory_type() {
        MemoryType::Free => {
            let start = entry.base().checked_align_up::<Size4K>()?;
            let end = PhysicalAddress::new(entry.end()).align_down::<Size4K>();
            (end > start).then(|| RangeDescriptor {
                base: start,
                size: end - start,
                status: RangeStatus::Free,
                next: NIL,
            })
        }
        other => Some(RangeDescriptor {
            base: entry.base(),
            size: entry.len(),
            status: RangeStatus::Reserved(other),
            next: NIL,
        }),
    }
}

impl FrameAlloc for RangeAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_range(Size4K::SIZE)
            .ok()
            .map(PhysicalPage::containing_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> [MemoryMapEntry; 4] {
        [
            MemoryMapEntry::new(0x0, 0x9_F000, MemoryType::Free),
            MemoryMapEntry::new(0x9_F000, 0x6_1000, MemoryType::Used),
            MemoryMapEntry::new(0x10_0010, 0x10_0000, MemoryType::Free),
            MemoryMapEntry::new(0xFEC0_0000, 0x1000, MemoryType::Mmio),
        ]
    }

    fn ready() -> RangeAllocator {
        let mut ranges = RangeAllocator::new();
        ranges.initialize(&map()).unwrap();
        ranges
    }

    #[test]
    fn free_entries_are_trimmed_to_pages() {
        let ranges = ready();
        let third = ranges.descriptors().nth(2).unwrap();
        assert_eq!(third.base.as_u64(), 0x10_1000);
        assert_eq!(third.end(), 0x20_0000);
        assert_eq!(ranges.total_usable(), 0x9_F000 + 0xF_F000);
        assert_eq!(ranges.highest_address(), 0xFEC0_1000);
    }

    #[test]
    fn reserved_entries_keep_their_type() {
        let ranges = ready();
        let statuses: Vec<_> = ranges.descriptors().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            [
                RangeStatus::Free,
                RangeStatus::Reserved(MemoryType::Used),
                RangeStatus::Free,
                RangeStatus::Reserved(MemoryType::Mmio),
            ]
        );
    }

    #[test]
    fn sub_page_free_entries_are_dropped() {
        let mut ranges = RangeAllocator::new();
        ranges
            .initialize(&[
                MemoryMapEntry::new(0x1010, 0xF00, MemoryType::Free),
                MemoryMapEntry::new(0x5000, 0, MemoryType::Free),
            ])
            .unwrap();
        assert_eq!(ranges.descriptors().count(), 0);
        assert_eq!(ranges.allocate_range(1), Err(RangeAllocError::OutOfMemory { requested: 0x1000 }));
    }

    #[test]
    fn allocation_splits_first_fit() {
        let mut ranges = ready();
        assert_eq!(ranges.allocate_range(0x1800).unwrap().as_u64(), 0);
        assert_eq!(ranges.allocate_range(0x1000).unwrap().as_u64(), 0x2000);
        // too big for the low range, lands in the second free range
        assert_eq!(ranges.allocate_range(0xA_0000).unwrap().as_u64(), 0x10_1000);
        assert_eq!(ranges.free_bytes(), ranges.total_usable() - 0x3000 - 0xA_0000);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let mut ranges = ready();
        assert_eq!(ranges.allocate_range(0), Err(RangeAllocError::InvalidSize));
        assert!(matches!(
            ranges.allocate_range(0x1000_0000),
            Err(RangeAllocError::OutOfMemory { .. })
        ));
        assert!(matches!(
            ranges.allocate_range(u64::MAX),
            Err(RangeAllocError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn second_initialize_is_refused() {
        let mut ranges = ready();
        assert_eq!(ranges.initialize(&map()), Err(RangeAllocError::AlreadyInitialized));
    }

    #[test]
    fn oversized_memory_map_is_refused() {
        let entries: Vec<_> = (0..=RANGE_DESCRIPTOR_CAPACITY as u64)
            .map(|i| MemoryMapEntry::new(i * 0x2000, 0x1000, MemoryType::Free))
            .collect();
        let mut ranges = RangeAllocator::new();
        assert_eq!(
            ranges.initialize(&entries),
            Err(RangeAllocError::TooManyEntries {
                capacity: RANGE_DESCRIPTOR_CAPACITY
            })
        );
        assert!(!ranges.is_initialized());
    }

    #[test]
    fn full_arena_hands_out_whole_ranges() {
        let entries: Vec<_> = (0..RANGE_DESCRIPTOR_CAPACITY as u64)
            .map(|i| MemoryMapEntry::new(i * 0x1_0000, 0x4000, MemoryType::Free))
            .collect();
        let mut ranges = RangeAllocator::new();
        ranges.initialize(&entries).unwrap();

        let pa = ranges.allocate_range(0x1000).unwrap();
        assert_eq!(pa.as_u64(), 0);
        let first = ranges.descriptors().next().unwrap();
        assert_eq!(first.size, 0x4000);
        assert_eq!(first.status, RangeStatus::Allocated);
        assert_eq!(ranges.allocate_range(0x1000).unwrap().as_u64(), 0x1_0000);
    }

    #[test]
    fn frames_come_from_free_ranges() {
        let mut ranges = ready();
        let a = ranges.alloc_4k().unwrap();
        let b = ranges.alloc_4k().unwrap();
        assert_eq!(a.base().as_u64(), 0);
        assert_eq!(b.base().as_u64(), 0x1000);
    }
}
