//! The debug console port.

use core::fmt;

/// QEMU's `debugcon` I/O port.
pub const QEMU_DEBUG_PORT: u16 = 0x402;

/// [`fmt::Write`] sink for the debug console. Unbuffered.
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugCon;

impl fmt::Write for DebugCon {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            putc(b);
        }
        Ok(())
    }
}

#[cfg(all(feature = "enabled", target_arch = "x86_64", not(test)))]
#[allow(clippy::inline_always)]
#[inline(always)]
fn putc(byte: u8) {
    // SAFETY: writing to the debugcon port has no side effects beyond output;
    // without QEMU the byte is dropped by the chipset.
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") QEMU_DEBUG_PORT,
            in("al") byte,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(not(all(feature = "enabled", target_arch = "x86_64", not(test))))]
#[inline]
const fn putc(_byte: u8) {}

/// Backend of [`qemu_trace!`](crate::qemu_trace).
#[doc(hidden)]
pub fn write_fmt(args: fmt::Arguments<'_>) {
    // Best effort.
    let _ = fmt::write(&mut DebugCon, args);
}
