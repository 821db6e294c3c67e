//! # Kernel Heap
//!
//! A first-fit block allocator over a virtual region that grows one page at a
//! time through a [`HeapBacking`].
//!
//! Every block starts with a 16-byte header; the next header follows the
//! payload directly, so the block chain is walked by address arithmetic:
//!
//! ```text
//! start                                                              end
//! ├────────┬──────────────┬────────┬─────────┬────────┬────────────────┤
//! │ header │ payload      │ header │ payload │ header │ payload        │
//! │ 2048 ● │              │ 1024 ○ │         │ 9000 ○ │                │
//! └────────┴──────────────┴────────┴─────────┴────────┴────────────────┘
//!   ● in use   ○ free
//! ```
//!
//! ## Invariants
//! - Blocks tile `[start, end)` without gaps or overlaps.
//! - Payload sizes and addresses are multiples of [`BLOCK_ALIGN`].
//!
//! Freed blocks are not merged with their neighbours, and a failed
//! allocation does not grow the heap.

use crate::range_alloc::RangeAllocator;
use crate::vmm::{Vmm, VmmError};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PageEntry, PhysMapper};
use log::{debug, info, trace, warn};

/// Alignment of every payload, and granularity of every block size.
pub const BLOCK_ALIGN: usize = 16;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = Size4K::SIZE as usize;

/// Header in front of every heap block.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BlockHeader {
    /// Payload bytes up to the next header.
    size: usize,
    in_use: bool,
}

const HEADER: usize = size_of::<BlockHeader>();

const _: () = assert!(HEADER == BLOCK_ALIGN);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("cannot allocate zero bytes")]
    ZeroSize,
    #[error("no free heap block of {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("{0:#x} lies outside the heap")]
    OutOfRange(usize),
    #[error("{0:#x} is not the payload of a heap block")]
    NotABlock(usize),
    #[error("heap block at {0:#x} is already free")]
    DoubleFree(usize),
    #[error("heap start {0} is not page aligned")]
    Misaligned(VirtualAddress),
    #[error("heap is already initialized")]
    AlreadyInitialized,
    #[error("heap is not initialized")]
    NotInitialized,
    #[error("could not back the heap")]
    Backing(#[from] VmmError),
}

/// Supplies the pages the heap grows into.
///
/// # Safety
/// After `back_page` returns `Ok`, the 4 KiB page at `page` must be mapped
/// writable and must not be used by anything but the heap.
pub unsafe trait HeapBacking {
    fn back_page(&mut self, page: VirtualAddress) -> Result<(), VmmError>;
}

/// Backs heap pages with frames from the range allocator, mapped kernel RW.
pub struct KernelBacking<'a, M: PhysMapper, P: Mmu> {
    pub vmm: &'a mut Vmm<M, P>,
    pub frames: &'a mut RangeAllocator,
}

// SAFETY: `allocate_kernel_pages` maps a fresh frame writable before returning `Ok`.
unsafe impl<M: PhysMapper, P: Mmu> HeapBacking for KernelBacking<'_, M, P> {
    fn back_page(&mut self, page: VirtualAddress) -> Result<(), VmmError> {
        self.vmm
            .allocate_kernel_pages(page, 1, PageEntry::kernel_rw(), self.frames)
    }
}

/// A block as seen by [`KernelHeap::blocks`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HeapBlock {
    /// Address of the payload.
    pub addr: usize,
    pub size: usize,
    pub in_use: bool,
}

/// The kernel heap.
pub struct KernelHeap {
    start: usize,
    end: usize,
    initialized: bool,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start: 0,
            end: 0,
            initialized: false,
        }
    }

    /// Grow the heap at `start` to `initial_size` bytes (rounded down to
    /// pages) and cover it with one free block.
    ///
    /// # Safety
    /// The virtual range from `start` upwards must be reserved for this heap.
    ///
    /// # Errors
    /// - [`HeapError::AlreadyInitialized`] on a second call.
    /// - [`HeapError::Misaligned`] if `start` is not page aligned.
    /// - [`HeapError::ZeroSize`] if `initial_size` is less than a page.
    /// - [`HeapError::Backing`] if backing stopped early. The heap stays
    ///   uninitialized when not a single page was backed.
    pub unsafe fn initialize<B: HeapBacking + ?Sized>(
        &mut self,
        start: VirtualAddress,
        initial_size: usize,
        backing: &mut B,
    ) -> Result<(), HeapError> {
        if self.initialized {
            return Err(HeapError::AlreadyInitialized);
        }
        if !start.is_aligned::<Size4K>() {
            return Err(HeapError::Misaligned(start));
        }
        if initial_size < PAGE {
            return Err(HeapError::ZeroSize);
        }
        let start = usize::try_from(start.as_u64()).map_err(|_| HeapError::Misaligned(start))?;

        self.start = start;
        self.end = start;
        self.initialized = true;
        let grown = self.expand(initial_size, backing);
        if self.end == self.start {
            *self = Self::new();
            return grown;
        }
        info!(
            "kernel heap: {:#x}..{:#x} ({} KiB)",
            self.start,
            self.end,
            self.size() / 1024
        );
        grown
    }

    /// Grow the heap to `new_size` bytes, rounded down to whole pages.
    ///
    /// Pages are backed one at a time above the current end; pages already
    /// backed are never touched again. The new region becomes one free block
    /// of its own. If backing fails part way, whatever was backed is kept.
    ///
    /// # Errors
    /// [`HeapError::NotInitialized`] before [`initialize`](Self::initialize),
    /// or [`HeapError::Backing`] when a page cannot be backed.
    pub fn expand<B: HeapBacking + ?Sized>(
        &mut self,
        new_size: usize,
        backing: &mut B,
    ) -> Result<(), HeapError> {
        if !self.initialized {
            return Err(HeapError::NotInitialized);
        }
        let target = new_size & !(PAGE - 1);
        let old_end = self.end;

        let mut result = Ok(());
        while self.size() < target {
            if let Err(e) = backing.back_page(VirtualAddress::new(self.end as u64)) {
                warn!("heap growth stopped at {:#x}: {e}", self.end);
                result = Err(HeapError::Backing(e));
                break;
            }
            self.end += PAGE;
        }

        if self.end > old_end {
            // SAFETY: `[old_end, end)` was just backed and belongs to the heap.
            unsafe {
                write_header(
                    old_end,
                    BlockHeader {
                        size: self.end - old_end - HEADER,
                        in_use: false,
                    },
                );
            }
            debug!("heap grew by {} pages to {:#x}", (self.end - old_end) / PAGE, self.end);
        }
        result
    }

    /// First-fit allocation of `size` bytes, rounded up to [`BLOCK_ALIGN`].
    ///
    /// A free block is split when more than one header's worth is left over.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] for `size == 0`, [`HeapError::OutOfMemory`]
    /// when no free block is large enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let size = size
            .checked_next_multiple_of(BLOCK_ALIGN)
            .ok_or(HeapError::OutOfMemory { requested: size })?;

        let mut addr = self.start;
        while addr < self.end {
            // SAFETY: `addr` walks the block chain inside the heap.
            let mut header = unsafe { read_header(addr) };
            if !header.in_use && header.size >= size {
                if header.size > size + HEADER {
                    // SAFETY: the tail lies inside this block's payload.
                    unsafe {
                        write_header(
                            addr + HEADER + size,
                            BlockHeader {
                                size: header.size - size - HEADER,
                                in_use: false,
                            },
                        );
                    }
                    header.size = size;
                }
                header.in_use = true;
                // SAFETY: as above.
                unsafe { write_header(addr, header) };
                trace!("heap: allocate {size} at {:#x}", addr + HEADER);
                return NonNull::new((addr + HEADER) as *mut u8)
                    .ok_or(HeapError::OutOfMemory { requested: size });
            }
            addr += HEADER + header.size;
        }

        Err(HeapError::OutOfMemory { requested: size })
    }

    /// Mark the block at `ptr` free.
    ///
    /// # Errors
    /// - [`HeapError::OutOfRange`] if `ptr` is outside the heap.
    /// - [`HeapError::NotABlock`] if `ptr` is inside the heap but not a payload start.
    /// - [`HeapError::DoubleFree`] if the block is already free.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = self.find_block(ptr)?;
        // SAFETY: `find_block` only returns header addresses on the chain.
        let mut header = unsafe { read_header(addr) };
        if !header.in_use {
            warn!("heap: double free of {:#x}", addr + HEADER);
            return Err(HeapError::DoubleFree(addr + HEADER));
        }
        header.in_use = false;
        // SAFETY: as above.
        unsafe { write_header(addr, header) };
        trace!("heap: free {:#x}", addr + HEADER);
        Ok(())
    }

    /// Move the allocation at `ptr` into a fresh block of `new_size` bytes.
    ///
    /// `new_size == 0` frees `ptr` and returns `None`. Otherwise the contents
    /// are copied up to the smaller of both sizes and the old block is freed.
    /// If the new block cannot be allocated the old one stays valid.
    ///
    /// # Errors
    /// Those of [`free`](Self::free) for a bad `ptr`, and those of
    /// [`allocate`](Self::allocate).
    pub fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        if new_size == 0 {
            self.free(ptr)?;
            return Ok(None);
        }

        let old_size = self.block_size(ptr)?;
        let new = self.allocate(new_size)?;
        // SAFETY: both blocks are distinct, in use and at least this large.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(new_size));
        }
        self.free(ptr)?;
        Ok(Some(new))
    }

    /// Payload size of the in-use block at `ptr`.
    ///
    /// # Errors
    /// As for [`free`](Self::free).
    pub fn block_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let addr = self.find_block(ptr)?;
        // SAFETY: header on the chain.
        let header = unsafe { read_header(addr) };
        if header.in_use {
            Ok(header.size)
        } else {
            Err(HeapError::DoubleFree(addr + HEADER))
        }
    }

    /// Header address of the block whose payload starts at `ptr`.
    fn find_block(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let target = ptr.as_ptr() as usize;
        if target < self.start + HEADER || target >= self.end {
            return Err(HeapError::OutOfRange(target));
        }

        let mut addr = self.start;
        while addr + HEADER <= target {
            if addr + HEADER == target {
                return Ok(addr);
            }
            // SAFETY: `addr` walks the block chain inside the heap.
            addr += HEADER + unsafe { read_header(addr) }.size;
        }
        Err(HeapError::NotABlock(target))
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// One past the last backed byte.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Backed bytes, headers included.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Walk the block chain from the start.
    pub fn blocks(&self) -> impl Iterator<Item = HeapBlock> {
        let end = self.end;
        let mut addr = self.start;
        core::iter::from_fn(move || {
            if addr >= end {
                return None;
            }
            // SAFETY: `addr` walks the block chain inside the heap.
            let header = unsafe { read_header(addr) };
            let block = HeapBlock {
                addr: addr + HEADER,
                size: header.size,
                in_use: header.in_use,
            };
            addr += HEADER + header.size;
            Some(block)
        })
    }
}

/// # Safety
/// `addr` must be a backed, 16-byte aligned heap address.
unsafe fn read_header(addr: usize) -> BlockHeader {
    unsafe { ptr::read(addr as *const BlockHeader) }
}

/// # Safety
/// `addr` must be a backed, 16-byte aligned heap address.
unsafe fn write_header(addr: usize, header: BlockHeader) {
    unsafe { ptr::write(addr as *mut BlockHeader, header) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Pages([u8; 4 * 4096]);

    /// Hands out pages of a host buffer, up to `limit`.
    struct HostBacking {
        granted: Vec<VirtualAddress>,
        limit: usize,
    }

    unsafe impl HeapBacking for HostBacking {
        fn back_page(&mut self, page: VirtualAddress) -> Result<(), VmmError> {
            if self.granted.len() == self.limit {
                return Err(VmmError::OutOfFrames {
                    mapped: 0,
                    requested: 1,
                });
            }
            self.granted.push(page);
            Ok(())
        }
    }

    fn heap(pages: &mut Pages, limit: usize, initial: usize) -> (KernelHeap, HostBacking) {
        let mut backing = HostBacking {
            granted: Vec::new(),
            limit,
        };
        let mut heap = KernelHeap::new();
        let start = VirtualAddress::from_ptr(pages.0.as_mut_ptr());
        unsafe { heap.initialize(start, initial, &mut backing).unwrap() };
        (heap, backing)
    }

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(HEADER, 16);
    }

    #[test]
    fn initialize_rounds_down_and_covers_with_one_block() {
        let mut pages = Pages([0; 4 * 4096]);
        let (heap, backing) = heap(&mut pages, 4, 2 * 4096 + 100);
        assert_eq!(backing.granted.len(), 2);
        assert_eq!(heap.size(), 2 * 4096);
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 2 * 4096 - HEADER);
        assert!(!blocks[0].in_use);
    }

    #[test]
    fn sizes_round_up_to_block_alignment() {
        let mut pages = Pages([0; 4 * 4096]);
        let (mut heap, _) = heap(&mut pages, 4, 4096);
        let p = heap.allocate(1).unwrap();
        assert_eq!(heap.block_size(p).unwrap(), 16);
        assert_eq!(p.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(heap.allocate(0), Err(HeapError::ZeroSize));
    }

    #[test]
    fn small_leftover_is_not_split() {
        let mut pages = Pages([0; 4 * 4096]);
        let (mut heap, _) = heap(&mut pages, 4, 4096);
        // leaves exactly one header's worth, which is kept inside the block
        let p = heap.allocate(4096 - 2 * HEADER).unwrap();
        assert_eq!(heap.block_size(p).unwrap(), 4096 - HEADER);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn expand_appends_a_free_block_and_stops_at_the_limit() {
        let mut pages = Pages([0; 4 * 4096]);
        let (mut heap, mut backing) = heap(&mut pages, 3, 4096);
        let err = heap.expand(4 * 4096, &mut backing).unwrap_err();
        assert!(matches!(err, HeapError::Backing(_)));
        assert_eq!(heap.size(), 3 * 4096);

        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].size, 2 * 4096 - HEADER);

        // already backed pages are not requested again
        heap.expand(2 * 4096, &mut backing).unwrap();
        assert_eq!(backing.granted.len(), 3);
    }

    #[test]
    fn failed_initialize_can_be_retried() {
        let mut pages = Pages([0; 4 * 4096]);
        let start = VirtualAddress::from_ptr(pages.0.as_mut_ptr());
        let mut backing = HostBacking {
            granted: Vec::new(),
            limit: 0,
        };
        let mut heap = KernelHeap::new();

        let err = unsafe { heap.initialize(start, 2 * 4096, &mut backing) }.unwrap_err();
        assert!(matches!(err, HeapError::Backing(_)));
        assert_eq!(heap.size(), 0);
        assert!(!heap.is_initialized());
        assert_eq!(heap.expand(4096, &mut backing), Err(HeapError::NotInitialized));

        backing.limit = 2;
        unsafe { heap.initialize(start, 2 * 4096, &mut backing) }.unwrap();
        assert_eq!(heap.size(), 2 * 4096);
        assert_eq!(heap.start(), start.as_u64() as usize);
    }

    #[test]
    fn free_validates_the_pointer() {
        let mut pages = Pages([0; 4 * 4096]);
        let (mut heap, _) = heap(&mut pages, 4, 4096);
        let p = heap.allocate(64).unwrap();

        let inside = NonNull::new(p.as_ptr().wrapping_add(8)).unwrap();
        assert!(matches!(heap.free(inside), Err(HeapError::NotABlock(_))));
        let outside = NonNull::new(p.as_ptr().wrapping_add(8192)).unwrap();
        assert!(matches!(heap.free(outside), Err(HeapError::OutOfRange(_))));

        heap.free(p).unwrap();
        assert!(matches!(heap.free(p), Err(HeapError::DoubleFree(_))));
    }

    #[test]
    fn reallocate_to_zero_frees() {
        let mut pages = Pages([0; 4 * 4096]);
        let (mut heap, _) = heap(&mut pages, 4, 4096);
        let p = heap.allocate(32).unwrap();
        assert_eq!(heap.reallocate(p, 0), Ok(None));
        assert!(matches!(heap.free(p), Err(HeapError::DoubleFree(_))));
    }

    #[test]
    fn uninitialized_heap_refuses_everything() {
        let mut heap = KernelHeap::new();
        let mut backing = HostBacking {
            granted: Vec::new(),
            limit: 1,
        };
        assert_eq!(heap.expand(4096, &mut backing), Err(HeapError::NotInitialized));
        assert!(matches!(heap.allocate(8), Err(HeapError::OutOfMemory { .. })));
    }
}
