//! # QEMU Debug Console
//!
//! Log output for kernels running under QEMU. Every byte written to I/O port
//! `0x402` shows up on the host when QEMU runs with `-debugcon`:
//!
//! ```bash
//! qemu-system-x86_64 ... -debugcon stdio
//! qemu-system-x86_64 ... -debugcon file:debug.log
//! ```
//!
//! [`QemuLogger`] routes the `log` facade to the port; [`qemu_trace!`] writes
//! to it directly, bypassing level filtering. Neither allocates.
//!
//! Without the `enabled` feature (and in host-side test builds) the port
//! write compiles to nothing, so formatting still runs but nothing leaves the
//! machine.
//!
//! ```rust,no_run
//! use log::{LevelFilter, info};
//!
//! kernel_qemu::QemuLogger::init(LevelFilter::Debug).ok();
//! info!("memory manager online");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;
pub mod port;

pub use logger::{QemuLogger, format_record};
pub use port::DebugCon;

/// `print!`-style output straight to the debug console.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::port::write_fmt(core::format_args!($($arg)*));
    }};
}
