//! # Kernel Memory Configuration and Boot Interface
//!
//! The authoritative source for the constants and ABI types shared by the
//! memory-management crates: where the identity map and the kernel heap live,
//! how large the fixed-capacity bootstrap structures are, and what the
//! firmware memory map looks like when it is handed to the kernel.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! Compile-time layout of the kernel half of every address space:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Process-owned lower half      │
//!                       │   (user pages, per process)     │
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │   non-canonical hole            │
//! 0xFFFF_8000_0000_0000 ├─────────────────────────────────┤ PML4[256], kernel half starts
//!                       │                                 │
//! IDENTITY_MAP_OFFSET   ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Identity map of all RAM       │
//!                       │   (2 MiB leaves)                │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │   Kernel heap (grows upward)    │
//!                       │                                 │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! Every PML4 entry from [`KERNEL_SPACE_PML4_INDEX`](memory::KERNEL_SPACE_PML4_INDEX)
//! upward is copied into new address spaces, so both regions above stay
//! reachable whichever address space is active.
//!
//! ### Boot Information ([`boot`])
//! The firmware memory map as the kernel receives it: an array of
//! `#[repr(C)]` 16-byte entries whose size field doubles as the type tag.
//!
//! ## Safety
//! This crate contains no unsafe code. Layout invariants are checked by
//! `const` assertions at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
