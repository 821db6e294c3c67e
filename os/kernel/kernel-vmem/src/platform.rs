//! Privileged translation state: CR3 and the TLB.

use crate::RootTable;
use kernel_memory_addresses::VirtualAddress;

/// Access to the translation root register and the TLB.
///
/// The memory manager never touches registers directly; it goes through this
/// trait so that the same code runs on hardware and under test.
pub trait Mmu {
    /// The root currently loaded in CR3.
    fn active_root(&self) -> RootTable;

    /// Switch translation to `root`.
    ///
    /// # Safety
    /// `root` must be a valid PML4 that maps the running code, its stack and
    /// every structure the caller touches next.
    unsafe fn load_root(&mut self, root: RootTable);

    /// Drop any cached translation of the page containing `va`.
    fn invalidate_page(&mut self, va: VirtualAddress);

    /// Drop all non-global cached translations.
    fn flush_all(&mut self);
}

/// The real MMU, driven through `kernel-registers`.
#[cfg(target_arch = "x86_64")]
pub struct X86_64Mmu {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl X86_64Mmu {
    /// # Safety
    /// Must run at CPL0 with paging enabled; only one instance should exist.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl Mmu for X86_64Mmu {
    fn active_root(&self) -> RootTable {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        // SAFETY: constructing `X86_64Mmu` asserts CPL0.
        unsafe { Cr3::load_unsafe() }.root()
    }

    unsafe fn load_root(&mut self, root: RootTable) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        unsafe { Cr3::from_root(root).store_unsafe() }
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        // SAFETY: CPL0, see `new`.
        unsafe { kernel_registers::tlb::invalidate_page(va) }
    }

    fn flush_all(&mut self) {
        // SAFETY: CPL0, see `new`.
        unsafe { kernel_registers::tlb::flush_all() }
    }
}
