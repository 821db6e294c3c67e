//! # Kernel Memory Bring-Up
//!
//! Wires the allocators of `kernel-alloc` into one [`KernelMemory`] and
//! brings them up in dependency order:
//!
//! ```text
//! table arena self-check
//!         │
//!         ▼
//! identity map into the firmware root ── boot mapper
//!         │
//!         ▼
//! switch to the identity-map mapper
//!         │
//!         ▼
//! physical ranges from the memory map
//!         │
//!         ▼
//! initial kernel heap
//! ```
//!
//! A failure at any stage is fatal; [`halt`] logs the error chain and stops
//! the CPU.
//!
//! ```rust,ignore
//! kernel_mm::init_logging(LevelFilter::Info).ok();
//! let memory = unsafe {
//!     KernelMemory::bootstrap(map, boot, IdentityMapPhysMapper::new(), X86_64Mmu::new(), arena, &MemoryConfig::new())
//! }
//! .unwrap_or_else(|e| kernel_mm::halt(&e));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod boot;
pub mod config;

pub use boot::{BootError, KernelMemory};
pub use config::MemoryConfig;

use core::error::Error;
use log::{LevelFilter, SetLoggerError, error};

/// Install the QEMU debug-console logger.
///
/// # Errors
/// If a logger is already installed.
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    kernel_qemu::QemuLogger::init(level)
}

/// `err` followed by its sources, outermost first.
pub fn error_chain<'a>(
    err: &'a (dyn Error + 'static),
) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    core::iter::successors(Some(err), |&e| e.source())
}

/// Log `err` with every cause and stop this CPU for good.
///
/// Before [`init_logging`] the chain goes straight to the debug console.
pub fn halt(err: &(dyn Error + 'static)) -> ! {
    let logging = log::max_level() != LevelFilter::Off;
    for (depth, cause) in error_chain(err).enumerate() {
        let label = if depth == 0 { "fatal" } else { "  caused by" };
        if logging {
            error!("{label}: {cause}");
        } else {
            kernel_qemu::qemu_trace!("{label}: {cause}\n");
        }
    }
    loop {
        stop();
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn stop() {
    // SAFETY: masks interrupts and idles; nothing runs afterwards.
    unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
}

#[cfg(not(all(target_arch = "x86_64", not(test))))]
fn stop() {
    core::hint::spin_loop();
}
