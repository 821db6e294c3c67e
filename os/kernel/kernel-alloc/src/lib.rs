//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The three allocators the kernel owns after boot, stacked on top of each
//! other:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Kernel Heap (heap)                  │
//! │    • first-fit blocks with inline headers           │
//! │    • grows by backing one page at a time            │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ HeapBacking
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Virtual Memory Manager (vmm)               │
//! │    • kernel root, identity map, address spaces      │
//! │    • map/unmap with TLB invalidation                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │        Physical Range Allocator (range_alloc)       │
//! │    • fixed descriptor array, no heap                │
//! │    • carves frames off free firmware ranges         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Page tables are reached through a [`PhysMapper`](kernel_vmem::PhysMapper):
//! [`BootPhysMapper`](phys_mapper::BootPhysMapper) until the identity map is
//! built, [`IdentityMapPhysMapper`](phys_mapper::IdentityMapPhysMapper) after.
//! [`fault`] decodes page faults against the active address space.
//!
//! None of the types here are internally synchronized; the kernel wraps them
//! in whatever lock fits its execution model.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod fault;
pub mod heap;
pub mod phys_mapper;
pub mod range_alloc;
pub mod vmm;

pub use fault::{FaultReport, PageFault, PageFaultError};
pub use heap::{HeapBacking, HeapBlock, HeapError, KernelBacking, KernelHeap};
pub use phys_mapper::{BootPhysMapper, IdentityMapPhysMapper};
pub use range_alloc::{RangeAllocError, RangeAllocator, RangeDescriptor, RangeStatus};
pub use vmm::{Vmm, VmmError};
