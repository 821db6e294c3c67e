//! Translation lookaside buffer maintenance.

#[cfg(feature = "asm")]
use kernel_memory_addresses::VirtualAddress;

/// Drop the cached translation for the page containing `va` on this CPU.
///
/// # Safety
/// Must run at CPL0.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Drop every non-global cached translation on this CPU by reloading CR3.
///
/// # Safety
/// Must run at CPL0.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}
