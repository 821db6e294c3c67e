//! The memory subsystem as one owned value.

use crate::config::MemoryConfig;
use core::ptr::NonNull;
use kernel_alloc::fault::{FaultReport, PageFault};
use kernel_alloc::heap::{HeapError, KernelBacking, KernelHeap};
use kernel_alloc::range_alloc::{RangeAllocError, RangeAllocator};
use kernel_alloc::vmm::{Vmm, VmmError};
use kernel_info::boot::MemoryMapEntry;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{ArenaError, Mmu, PageEntry, PhysMapper, RootTable, TableArena};
use log::info;

/// The bring-up stage that failed, with its cause.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("table arena self-check failed")]
    ArenaSelfCheck(#[source] ArenaError),
    #[error("virtual memory manager initialization failed")]
    Vmm(#[source] VmmError),
    #[error("physical range allocator initialization failed")]
    Ranges(#[source] RangeAllocError),
    #[error("kernel heap initialization failed")]
    Heap(#[source] HeapError),
}

/// Physical ranges, page tables and heap, owned together.
///
/// `M` reaches physical memory once the identity map is live; `P` is the
/// platform MMU.
pub struct KernelMemory<M: PhysMapper, P: Mmu> {
    ranges: RangeAllocator,
    vmm: Vmm<M, P>,
    heap: KernelHeap,
}

impl<M: PhysMapper, P: Mmu> KernelMemory<M, P> {
    /// Bring up memory management on top of the firmware's page tables.
    ///
    /// In order: check the table arena, build the identity map through
    /// `boot_mapper`, switch to `runtime_mapper`, take over the memory map
    /// and back the initial heap.
    ///
    /// # Safety
    /// - The root loaded in `mmu` must map the running kernel, and
    ///   `boot_mapper` must reach it and every arena slot.
    /// - `runtime_mapper` must reach all of physical memory once the identity
    ///   map is installed.
    /// - `config.heap_base` and the range above it must be reserved for the heap.
    ///
    /// # Errors
    /// [`BootError`] naming the stage that failed. Nothing is rolled back.
    pub unsafe fn bootstrap<B: PhysMapper>(
        memory_map: &[MemoryMapEntry],
        boot_mapper: B,
        runtime_mapper: M,
        mmu: P,
        mut arena: TableArena,
        config: &MemoryConfig,
    ) -> Result<Self, BootError> {
        arena.self_check().map_err(BootError::ArenaSelfCheck)?;

        let span = config.identity_span(memory_map);
        let mut vmm = Vmm::initialize(boot_mapper, mmu, arena, span)
            .map_err(BootError::Vmm)?
            .with_mapper(runtime_mapper);

        let mut ranges = RangeAllocator::new();
        ranges.initialize(memory_map).map_err(BootError::Ranges)?;

        let mut heap = KernelHeap::new();
        let mut backing = KernelBacking {
            vmm: &mut vmm,
            frames: &mut ranges,
        };
        // SAFETY: the caller reserves the heap range.
        unsafe { heap.initialize(config.heap_base, config.initial_heap_bytes, &mut backing) }
            .map_err(BootError::Heap)?;

        info!(
            "memory online: {} KiB free, heap {} KiB, {} table slots left",
            ranges.free_bytes() / 1024,
            heap.size() / 1024,
            vmm.arena().available()
        );
        Ok(Self { ranges, vmm, heap })
    }

    /// # Errors
    /// See [`KernelHeap::allocate`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.allocate(size)
    }

    /// # Errors
    /// See [`KernelHeap::free`].
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap.free(ptr)
    }

    /// # Errors
    /// See [`KernelHeap::reallocate`].
    pub fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        self.heap.reallocate(ptr, new_size)
    }

    /// Grow the heap to `new_size` bytes with fresh kernel pages.
    ///
    /// # Errors
    /// See [`KernelHeap::expand`].
    pub fn expand_heap(&mut self, new_size: usize) -> Result<(), HeapError> {
        let mut backing = KernelBacking {
            vmm: &mut self.vmm,
            frames: &mut self.ranges,
        };
        self.heap.expand(new_size, &mut backing)
    }

    /// # Errors
    /// See [`Vmm::create_address_space`].
    pub fn create_address_space(&mut self) -> Result<RootTable, VmmError> {
        self.vmm.create_address_space()
    }

    /// # Errors
    /// See [`Vmm::destroy_address_space`].
    pub fn destroy_address_space(&mut self, root: RootTable) -> Result<(), VmmError> {
        self.vmm.destroy_address_space(root)
    }

    /// Back `count` user pages at `start` in `root` with fresh frames.
    ///
    /// # Errors
    /// See [`Vmm::allocate_user_pages`].
    pub fn allocate_user_pages(
        &mut self,
        root: RootTable,
        start: VirtualAddress,
        count: u64,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        self.vmm
            .allocate_user_pages(start, count, flags, root, &mut self.ranges)
    }

    /// Back `count` kernel pages at `start` with fresh frames.
    ///
    /// # Errors
    /// See [`Vmm::allocate_kernel_pages`].
    pub fn allocate_kernel_pages(
        &mut self,
        start: VirtualAddress,
        count: u64,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        self.vmm
            .allocate_kernel_pages(start, count, flags, &mut self.ranges)
    }

    /// Switch to `root`.
    ///
    /// # Safety
    /// See [`Vmm::load_address_space`].
    pub unsafe fn load_address_space(&mut self, root: RootTable) {
        unsafe { self.vmm.load_address_space(root) };
    }

    #[must_use]
    pub fn diagnose_fault(&self, fault: PageFault) -> FaultReport {
        self.vmm.diagnose_fault(fault)
    }

    #[must_use]
    pub const fn vmm(&self) -> &Vmm<M, P> {
        &self.vmm
    }

    pub const fn vmm_mut(&mut self) -> &mut Vmm<M, P> {
        &mut self.vmm
    }

    #[must_use]
    pub const fn ranges(&self) -> &RangeAllocator {
        &self.ranges
    }

    #[must_use]
    pub const fn heap(&self) -> &KernelHeap {
        &self.heap
    }
}
