//! # Physical Mappers
//!
//! Two ways of turning a physical address into a pointer:
//!
//! - [`BootPhysMapper`] before the identity map exists. The firmware maps low
//!   memory one to one, and the table arena lives in the kernel image at a
//!   known virtual address.
//! - [`IdentityMapPhysMapper`] afterwards: every physical address is reachable
//!   at `IDENTITY_MAP_OFFSET + pa`.

use kernel_info::memory::IDENTITY_MAP_OFFSET;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] through the kernel's identity map.
///
/// # Safety
/// The identity map must be present in the active address space and cover
/// every physical address handed in.
#[derive(Copy, Clone, Debug)]
pub struct IdentityMapPhysMapper {
    offset: u64,
}

impl Default for IdentityMapPhysMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityMapPhysMapper {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_offset(IDENTITY_MAP_OFFSET)
    }

    /// An identity mapper with a non-standard offset.
    #[must_use]
    pub const fn with_offset(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl PhysMapper for IdentityMapPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the caller guarantees the identity map covers `pa`.
        unsafe { &mut *self.virt(pa).as_mut_ptr::<T>() }
    }
}

/// [`PhysMapper`] for the boot phase.
///
/// Addresses inside the arena window are redirected to where the kernel image
/// placed it; everything else is assumed to be identity mapped by the firmware.
#[derive(Copy, Clone, Debug)]
pub struct BootPhysMapper {
    window_phys: PhysicalAddress,
    window_virt: VirtualAddress,
    window_len: u64,
}

impl BootPhysMapper {
    /// `len` bytes at physical `phys` are reachable at virtual `virt`.
    #[must_use]
    pub const fn new(phys: PhysicalAddress, virt: VirtualAddress, len: u64) -> Self {
        Self {
            window_phys: phys,
            window_virt: virt,
            window_len: len,
        }
    }

    /// Plain firmware identity mapping, no window.
    #[must_use]
    pub const fn identity() -> Self {
        Self::new(PhysicalAddress::ZERO, VirtualAddress::ZERO, 0)
    }

    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        let start = self.window_phys.as_u64();
        let pa = pa.as_u64();
        if pa >= start && pa - start < self.window_len {
            VirtualAddress::new(self.window_virt.as_u64() + (pa - start))
        } else {
            VirtualAddress::new(pa)
        }
    }
}

impl PhysMapper for BootPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: the caller guarantees `pa` is reachable in the boot mapping.
        unsafe { &mut *self.virt(pa).as_mut_ptr::<T>() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapper_adds_the_offset() {
        let m = IdentityMapPhysMapper::new();
        assert_eq!(
            m.virt(PhysicalAddress::new(0x1234_5000)).as_u64(),
            0xffff_8880_1234_5000
        );
    }

    #[test]
    fn boot_mapper_redirects_the_window_only() {
        let m = BootPhysMapper::new(
            PhysicalAddress::new(0x20_0000),
            VirtualAddress::new(0xffff_ffff_8040_0000),
            0x2000,
        );
        assert_eq!(m.virt(PhysicalAddress::new(0x20_1008)).as_u64(), 0xffff_ffff_8040_1008);
        assert_eq!(m.virt(PhysicalAddress::new(0x20_2000)).as_u64(), 0x20_2000);
        assert_eq!(m.virt(PhysicalAddress::new(0x1000)).as_u64(), 0x1000);
        assert_eq!(BootPhysMapper::identity().virt(PhysicalAddress::new(0x20_1000)).as_u64(), 0x20_1000);
    }

    #[test]
    fn identity_mapper_reaches_host_memory() {
        #[repr(C, align(4096))]
        struct Page([u64; 512]);
        let mut page = Page([0; 512]);
        page.0[3] = 0xdead_beef;

        let m = IdentityMapPhysMapper::with_offset(page.0.as_mut_ptr() as u64);
        let v: &mut u64 = unsafe { m.phys_to_mut(PhysicalAddress::new(24)) };
        assert_eq!(*v, 0xdead_beef);
    }
}
