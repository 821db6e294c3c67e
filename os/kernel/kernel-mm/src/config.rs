//! Runtime knobs for memory bring-up.

use kernel_info::boot::{MemoryMapEntry, highest_ram_address};
use kernel_info::memory::{INITIAL_HEAP_BYTES, KERNEL_HEAP_BASE};
use kernel_memory_addresses::{PageSize, Size1G, VirtualAddress};

/// Where the heap goes and how much physical memory to identity map.
///
/// [`MemoryConfig::new`] yields the compiled-in layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryConfig {
    /// First byte of the heap; must be page aligned.
    pub heap_base: VirtualAddress,
    /// Bytes backed when the heap is created, rounded down to pages.
    pub initial_heap_bytes: usize,
    /// Identity-map span to use instead of the one derived from the memory map.
    pub identity_span: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfig {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            initial_heap_bytes: INITIAL_HEAP_BYTES as usize,
            identity_span: None,
        }
    }

    #[must_use]
    pub const fn with_heap_base(mut self, base: VirtualAddress) -> Self {
        self.heap_base = base;
        self
    }

    #[must_use]
    pub const fn with_initial_heap_bytes(mut self, bytes: usize) -> Self {
        self.initial_heap_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_identity_span(mut self, span: u64) -> Self {
        self.identity_span = Some(span);
        self
    }

    /// Bytes of physical memory to identity map for `memory_map`: the end of
    /// the highest RAM entry rounded up to 1 GiB, and at least 1 GiB. Device
    /// windows above RAM are not covered.
    #[must_use]
    pub fn identity_span(&self, memory_map: &[MemoryMapEntry]) -> u64 {
        let wanted = self
            .identity_span
            .unwrap_or_else(|| highest_ram_address(memory_map));
        wanted
            .checked_next_multiple_of(Size1G::SIZE)
            .unwrap_or(u64::MAX)
            .max(Size1G::SIZE)
    }
}
