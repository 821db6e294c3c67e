//! Simulated physical memory and MMU for host-side tests.
//!
//! Enabled for this crate's own tests and, through the `test-support`
//! feature, for the tests of dependent crates.

use crate::{Mmu, PhysMapper, RootTable};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// A 4 KiB-aligned raw frame.
#[repr(C, align(4096))]
pub struct Frame(pub [u8; 4096]);

/// "Physical RAM" as a run of 4 KiB frames.
///
/// Physical address `pa` is byte `pa % 4096` of frame `pa / 4096`. All
/// frames start zeroed.
pub struct TestPhys {
    frames: *mut [Frame],
}

impl TestPhys {
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        let frames: Box<[Frame]> = (0..n).map(|_| Frame([0; 4096])).collect();
        Self {
            frames: Box::into_raw(frames),
        }
    }

    /// The physical page of frame `n`.
    #[must_use]
    pub const fn frame(&self, n: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(n as u64)
    }

    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames.len()
    }

    /// Bytes of physical memory simulated.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.frames.len() as u64 * 4096
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames.len() == 0
    }

    /// Host pointer to the byte at `pa`.
    ///
    /// # Panics
    /// If `pa` is outside the simulated memory.
    #[must_use]
    pub fn host_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_u64() < self.len(), "{pa} outside simulated memory");
        #[allow(clippy::cast_possible_truncation)]
        let offset = pa.as_u64() as usize;
        self.frames.cast::<u8>().wrapping_add(offset)
    }

    /// Copy `len` bytes starting at `pa` out of simulated memory.
    #[must_use]
    pub fn read_bytes(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let src = self.host_ptr(pa);
        assert!(pa.as_u64() + len as u64 <= self.len());
        // SAFETY: the whole range lies inside the frame buffer.
        unsafe { core::slice::from_raw_parts(src, len) }.to_vec()
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.host_ptr(pa);
        debug_assert!(ptr.cast::<T>().is_aligned());
        // SAFETY: the caller promises `T` matches the bytes and is not aliased.
        unsafe { &mut *ptr.cast::<T>() }
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        // SAFETY: `frames` came from `Box::into_raw` and is dropped once.
        drop(unsafe { Box::from_raw(self.frames) });
    }
}

/// An [`Mmu`] that records what it was asked to do.
#[derive(Debug)]
pub struct RecordingMmu {
    root: RootTable,
    pub loads: Vec<RootTable>,
    pub invalidations: Vec<VirtualAddress>,
    pub flushes: usize,
}

impl RecordingMmu {
    /// Start out with `root` "in CR3".
    #[must_use]
    pub const fn new(root: RootTable) -> Self {
        Self {
            root,
            loads: Vec::new(),
            invalidations: Vec::new(),
            flushes: 0,
        }
    }
}

impl Mmu for RecordingMmu {
    fn active_root(&self) -> RootTable {
        self.root
    }

    unsafe fn load_root(&mut self, root: RootTable) {
        self.root = root;
        self.loads.push(root);
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        self.invalidations.push(va);
    }

    fn flush_all(&mut self) {
        self.flushes += 1;
    }
}
