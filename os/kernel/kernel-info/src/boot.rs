//! # Kernel Boot Information
//!
//! The firmware hands the kernel a flat array of [`MemoryMapEntry`] values.
//! The low four bits of each entry's size field carry the entry type; the
//! remaining bits are the size in bytes, so sizes have 16-byte granularity.

use kernel_memory_addresses::PhysicalAddress;

/// Mask of the type bits in [`MemoryMapEntry::size`].
pub const MEMORY_TYPE_MASK: u64 = 0xF;

/// One firmware memory-map entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical base address of the region.
    pub ptr: u64,
    /// Size in bytes, with the type code in the low four bits.
    pub size: u64,
}

impl MemoryMapEntry {
    /// Builds an entry from its parts; `size` is truncated to 16-byte granularity.
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: MemoryType) -> Self {
        Self {
            ptr: base,
            size: (size & !MEMORY_TYPE_MASK) | kind.code() as u64,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.ptr)
    }

    /// Size in bytes with the type bits masked off.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.size & !MEMORY_TYPE_MASK
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.ptr.saturating_add(self.len())
    }

    /// Raw four-bit type code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn type_code(&self) -> u8 {
        (self.size & MEMORY_TYPE_MASK) as u8
    }

    #[must_use]
    pub const fn memory_type(&self) -> MemoryType {
        MemoryType::from_code(self.type_code())
    }
}

/// Classification of a firmware memory-map entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryType {
    /// Type 0: in use by firmware or the loaded kernel image.
    Used,
    /// Type 1: usable RAM.
    Free,
    /// Type 2: ACPI tables and NVS.
    Acpi,
    /// Type 3: memory-mapped I/O.
    Mmio,
    /// Any other code; kept so it can still be told apart.
    Other(u8),
}

impl MemoryType {
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Used,
            1 => Self::Free,
            2 => Self::Acpi,
            3 => Self::Mmio,
            other => Self::Other(other),
        }
    }

    /// Whether the entry describes RAM, as opposed to device windows or
    /// unknown firmware ranges.
    #[must_use]
    pub const fn is_ram(self) -> bool {
        matches!(self, Self::Used | Self::Free | Self::Acpi)
    }

    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Used => 0,
            Self::Free => 1,
            Self::Acpi => 2,
            Self::Mmio => 3,
            Self::Other(code) => code & MEMORY_TYPE_MASK as u8,
        }
    }
}

/// End of the highest non-empty entry, i.e. the span an identity map must cover.
#[must_use]
pub fn highest_address(entries: &[MemoryMapEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| !e.is_empty())
        .map(MemoryMapEntry::end)
        .max()
        .unwrap_or(0)
}

/// End of the highest non-empty RAM entry. MMIO windows are left out since
/// they may sit far above the last byte of memory.
#[must_use]
pub fn highest_ram_address(entries: &[MemoryMapEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| !e.is_empty() && e.memory_type().is_ram())
        .map(MemoryMapEntry::end)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_are_masked_from_size() {
        let e = MemoryMapEntry {
            ptr: 0x10_0000,
            size: 0x7FF_0000 | 1,
        };
        assert_eq!(e.len(), 0x7FF_0000);
        assert_eq!(e.memory_type(), MemoryType::Free);
        assert_eq!(e.end(), 0x10_0000 + 0x7FF_0000);
    }

    #[test]
    fn unknown_codes_are_preserved() {
        let e = MemoryMapEntry::new(0xFEC0_0000, 0x1000, MemoryType::Other(9));
        assert_eq!(e.type_code(), 9);
        assert_eq!(e.memory_type(), MemoryType::Other(9));
        assert_eq!(MemoryType::from_code(3), MemoryType::Mmio);
    }

    #[test]
    fn highest_address_ignores_empty_entries() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryType::Free),
            MemoryMapEntry::new(0x4000_0000_0000, 0, MemoryType::Mmio),
            MemoryMapEntry::new(0x10_0000, 0x3FF0_0000, MemoryType::Free),
        ];
        assert_eq!(highest_address(&map), 0x4000_0000);
        assert_eq!(highest_address(&[]), 0);
    }

    #[test]
    fn highest_ram_address_skips_device_windows() {
        let map = [
            MemoryMapEntry::new(0x10_0000, 0x3FF0_0000, MemoryType::Free),
            MemoryMapEntry::new(0x7FF0_0000, 0x10_0000, MemoryType::Acpi),
            MemoryMapEntry::new(0xFD_0000_0000, 0x3_0000_0000, MemoryType::Mmio),
        ];
        assert_eq!(highest_ram_address(&map), 0x8000_0000);
        assert_eq!(highest_address(&map), 0x100_0000_0000);
    }
}
