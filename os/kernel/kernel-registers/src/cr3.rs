use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3, the page-map level-4 base register (PCID disabled).
///
/// Bits 12..52 hold the frame number of the active PML4. Writing CR3 switches
/// the translation root and flushes all non-global TLB entries.
#[bitfield(u64)]
pub struct Cr3 {
    #[bits(3)]
    __reserved_low: u8,

    /// Bit 3, PWT: write-through caching for PML4 accesses.
    pub write_through: bool,

    /// Bit 4, PCD: cache-disable for PML4 accesses.
    pub cache_disable: bool,

    #[bits(7)]
    __reserved_mid: u8,

    /// Bits 12..52: PML4 frame number.
    #[bits(40)]
    root_frame: u64,

    #[bits(12)]
    __reserved_high: u16,
}

impl Cr3 {
    /// A CR3 value selecting `root` with write-back caching.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.number())
    }

    /// The PML4 frame this value selects.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.root_frame())
    }

    /// Physical address of the PML4.
    #[must_use]
    pub const fn root_address(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let raw = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) raw, options(nostack, preserves_flags));
        }
    }
}
