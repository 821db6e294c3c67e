//! Virtual Memory Manager (VMM) for the kernel.
//!
//! Owns the table arena, the kernel root captured from the firmware and the
//! platform's [`Mmu`]. Everything that edits page tables goes through here so
//! that TLB maintenance is never forgotten.
//!
//! # Example
//! ```ignore
//! let vmm = Vmm::initialize(BootPhysMapper::new(..), unsafe { X86_64Mmu::new() }, arena, span)?;
//! let mut vmm = vmm.with_mapper(IdentityMapPhysMapper::new());
//! vmm.allocate_kernel_pages(heap_base, 128, PageEntry::kernel_rw(), &mut ranges)?;
//! ```

use kernel_info::memory::{IDENTITY_MAP_OFFSET, KERNEL_SPACE_START, USER_SPACE_END};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::identity_map::{self, IdentityMap, IdentityMapError};
use kernel_vmem::{
    AddressSpace, ArenaError, FrameAlloc, MapError, Mmu, PageEntry, PhysMapper, RootTable,
    TableArena, TableLevel, TranslationError,
};
use log::{debug, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    IdentityMap(#[from] IdentityMapError),
    #[error("physical address {0} is not page aligned")]
    UnalignedPhysical(PhysicalAddress),
    #[error("virtual address {0} is not page aligned")]
    UnalignedVirtual(VirtualAddress),
    #[error("{0} is not a user-space address")]
    NotUserSpace(VirtualAddress),
    #[error("{0} is not a canonical address")]
    NonCanonical(VirtualAddress),
    #[error("user page requested at kernel address {0}")]
    UserInKernelSpace(VirtualAddress),
    #[error("{pages} pages starting at {start} run past the end of the address space")]
    AddressOverflow { start: VirtualAddress, pages: u64 },
    #[error("out of physical frames after mapping {mapped} of {requested} pages")]
    OutOfFrames { mapped: u64, requested: u64 },
    #[error("{0} is the kernel address space")]
    KernelRoot(RootTable),
    #[error("{0} is the active address space")]
    ActiveRoot(RootTable),
}

/// The kernel's virtual memory manager.
///
/// `M` decides how page tables are reached (firmware identity mapping at boot,
/// the kernel's identity map afterwards); `P` performs register and TLB
/// access.
pub struct Vmm<M: PhysMapper, P: Mmu> {
    mapper: M,
    mmu: P,
    arena: TableArena,
    kernel_root: RootTable,
    identity: IdentityMap,
}

impl<M: PhysMapper, P: Mmu> Vmm<M, P> {
    /// Adopt the firmware's page tables and map all RAM below
    /// `identity_span` at [`IDENTITY_MAP_OFFSET`].
    ///
    /// `mapper` must reach both the firmware tables and the arena slots.
    ///
    /// # Errors
    /// [`VmmError::IdentityMap`] if the span is too large or the arena runs
    /// out of tables.
    pub fn initialize(
        mapper: M,
        mut mmu: P,
        mut arena: TableArena,
        identity_span: u64,
    ) -> Result<Self, VmmError> {
        let kernel_root = mmu.active_root();
        let identity = identity_map::build(
            &AddressSpace::new(&mapper, kernel_root),
            &mut arena,
            VirtualAddress::new(IDENTITY_MAP_OFFSET),
            identity_span,
        )?;
        mmu.flush_all();

        info!(
            "vmm: kernel root {kernel_root}, {}/{} table slots free",
            arena.available(),
            arena.capacity()
        );
        Ok(Self {
            mapper,
            mmu,
            arena,
            kernel_root,
            identity,
        })
    }

    /// Continue with a different way of reaching physical memory.
    pub fn with_mapper<N: PhysMapper>(self, mapper: N) -> Vmm<N, P> {
        Vmm {
            mapper,
            mmu: self.mmu,
            arena: self.arena,
            kernel_root: self.kernel_root,
            identity: self.identity,
        }
    }

    #[must_use]
    pub const fn kernel_root(&self) -> RootTable {
        self.kernel_root
    }

    /// The root currently loaded in CR3.
    #[must_use]
    pub fn active_root(&self) -> RootTable {
        self.mmu.active_root()
    }

    #[must_use]
    pub const fn arena(&self) -> &TableArena {
        &self.arena
    }

    #[must_use]
    pub const fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn mmu(&self) -> &P {
        &self.mmu
    }

    /// A view of the address space rooted at `root`.
    #[must_use]
    pub const fn address_space(&self, root: RootTable) -> AddressSpace<'_, M> {
        AddressSpace::new(&self.mapper, root)
    }

    /// Map the page containing `va` to `pa` in the kernel address space.
    ///
    /// # Errors
    /// See [`map_page_in`](Self::map_page_in).
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        self.map_page_in(self.kernel_root, va, pa, flags)
    }

    /// Map the page containing `va` to the frame at `pa` in `root`.
    ///
    /// The leaf is always written present. An existing mapping is overwritten
    /// in place and the cached translation for `va` is dropped.
    ///
    /// # Errors
    /// - [`VmmError::NonCanonical`] if `va` lies in the address hole.
    /// - [`VmmError::UserInKernelSpace`] for a user leaf in the kernel half.
    /// - [`VmmError::UnalignedPhysical`] if `pa` does not start a frame.
    /// - [`VmmError::Map`] if a table level cannot be allocated or a huge
    ///   leaf covers `va`.
    pub fn map_page_in(
        &mut self,
        root: RootTable,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        if !va.is_canonical() {
            return Err(VmmError::NonCanonical(va));
        }
        if flags.user() && va.as_u64() >= KERNEL_SPACE_START {
            warn!("refusing user mapping at {va}");
            return Err(VmmError::UserInKernelSpace(va));
        }
        let frame = PhysicalPage::<Size4K>::from_addr(pa).ok_or(VmmError::UnalignedPhysical(pa))?;
        let previous = AddressSpace::new(&self.mapper, root).map_page(
            &mut self.arena,
            va,
            frame,
            flags,
        )?;
        if previous.present() && previous.frame_page() != frame {
            debug!("remap {va}: {} -> {frame}", previous.frame_page());
        }
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Unmap the page containing `va` in the kernel address space.
    ///
    /// # Errors
    /// See [`unmap_page_in`](Self::unmap_page_in).
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<(), VmmError> {
        self.unmap_page_in(self.kernel_root, va)
    }

    /// Clear the present bit of the 4 KiB leaf for `va` in `root` and drop
    /// the cached translation. Emptied tables are kept.
    ///
    /// # Errors
    /// [`VmmError::Translation`] if `va` is not mapped by a 4 KiB leaf.
    pub fn unmap_page_in(&mut self, root: RootTable, va: VirtualAddress) -> Result<(), VmmError> {
        AddressSpace::new(&self.mapper, root).unmap_page(va)?;
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Translate `va` through the kernel address space.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the missing level.
    pub fn get_physical_address(
        &self,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslationError> {
        self.get_physical_address_in(self.kernel_root, va)
    }

    /// Translate `va` through `root`.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the missing level.
    pub fn get_physical_address_in(
        &self,
        root: RootTable,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslationError> {
        self.address_space(root).translate(va)
    }

    /// Physical address of the entry that maps `va` in the kernel address space.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the missing upper level.
    pub fn get_pte_address(&self, va: VirtualAddress) -> Result<PhysicalAddress, TranslationError> {
        self.get_pte_address_in(self.kernel_root, va)
    }

    /// Physical address of the entry that maps `va` in `root`.
    ///
    /// For 4 KiB mappings this is the PT entry, even when it is not present.
    ///
    /// # Errors
    /// [`TranslationError::NotPresent`] naming the missing upper level.
    pub fn get_pte_address_in(
        &self,
        root: RootTable,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslationError> {
        Ok(self.address_space(root).leaf_entry(va)?.address())
    }

    /// Back `count` pages from `start` in the kernel address space with fresh
    /// frames from `frames`.
    ///
    /// # Errors
    /// See [`allocate_user_pages`](Self::allocate_user_pages).
    pub fn allocate_kernel_pages<F: FrameAlloc + ?Sized>(
        &mut self,
        start: VirtualAddress,
        count: u64,
        flags: PageEntry,
        frames: &mut F,
    ) -> Result<(), VmmError> {
        self.allocate_pages_in(self.kernel_root, start, count, flags, frames)
    }

    /// Back `count` user-accessible pages from `start` in `root` with fresh
    /// frames from `frames`.
    ///
    /// Pages mapped before a failure stay mapped.
    ///
    /// # Errors
    /// - [`VmmError::UnalignedVirtual`] if `start` is not page aligned.
    /// - [`VmmError::NotUserSpace`] if the range reaches into the kernel half.
    /// - [`VmmError::OutOfFrames`] when `frames` runs dry.
    /// - [`VmmError::Map`] if a table level cannot be allocated.
    pub fn allocate_user_pages<F: FrameAlloc + ?Sized>(
        &mut self,
        start: VirtualAddress,
        count: u64,
        flags: PageEntry,
        root: RootTable,
        frames: &mut F,
    ) -> Result<(), VmmError> {
        let end = range_end(start, count)?;
        if end > USER_SPACE_END {
            return Err(VmmError::NotUserSpace(start));
        }
        self.allocate_pages_in(root, start, count, flags.with_user(true), frames)
    }

    fn allocate_pages_in<F: FrameAlloc + ?Sized>(
        &mut self,
        root: RootTable,
        start: VirtualAddress,
        count: u64,
        flags: PageEntry,
        frames: &mut F,
    ) -> Result<(), VmmError> {
        if !start.is_aligned::<Size4K>() {
            return Err(VmmError::UnalignedVirtual(start));
        }
        let end = range_end(start, count)?;
        if count > 0 {
            check_range(start, VirtualAddress::new(end - Size4K::SIZE), flags)?;
        }

        for i in 0..count {
            let va = start + i * Size4K::SIZE;
            // A frame drawn here cannot be handed back, so the tables go first.
            self.check_tables(root, va)?;
            let frame = frames.alloc_4k().ok_or(VmmError::OutOfFrames {
                mapped: i,
                requested: count,
            })?;
            self.map_page_in(root, va, frame.base(), flags)?;
        }
        debug!("backed {count} pages at {start} in {root}");
        Ok(())
    }

    /// Fail the way [`AddressSpace::map_page`] would for `va`, without
    /// touching the tables.
    fn check_tables(&self, root: RootTable, va: VirtualAddress) -> Result<(), MapError> {
        let missing = match self.address_space(root).leaf_entry(va) {
            Ok(loc) if loc.level == TableLevel::Pt => return Ok(()),
            Ok(loc) => return Err(MapError::HugePageConflict { level: loc.level, va }),
            Err(err) => err.level(),
        };
        let mut available = self.arena.available();
        let mut next = missing.child();
        while let Some(level) = next {
            if available == 0 {
                return Err(MapError::TableExhausted { level });
            }
            available -= 1;
            next = level.child();
        }
        Ok(())
    }

    /// A fresh root whose kernel half is a copy of the kernel root as it is now.
    ///
    /// Kernel-half PML4 entries added later are not seen by this space.
    ///
    /// # Errors
    /// [`VmmError::Arena`] if no table slot is left.
    pub fn create_address_space(&mut self) -> Result<RootTable, VmmError> {
        let root = self.arena.allocate_table_level()?;
        let space = AddressSpace::new(&self.mapper, root);
        space.clear_root();
        space.copy_kernel_half_from(&AddressSpace::new(&self.mapper, self.kernel_root));
        debug!("created address space {root}");
        Ok(root)
    }

    /// Return the lower-half table levels of `root` and the root itself to
    /// the arena. Data frames are not returned.
    ///
    /// # Errors
    /// - [`VmmError::KernelRoot`] / [`VmmError::ActiveRoot`] for roots still
    ///   in use.
    /// - [`VmmError::Arena`] if `root` was not created by this manager.
    pub fn destroy_address_space(&mut self, root: RootTable) -> Result<(), VmmError> {
        if root == self.kernel_root {
            return Err(VmmError::KernelRoot(root));
        }
        if root == self.mmu.active_root() {
            return Err(VmmError::ActiveRoot(root));
        }
        if !self.arena.contains(root.base()) {
            warn!("refusing to destroy foreign root {root}");
            return Err(ArenaError::InvalidPointer(root.base()).into());
        }

        let released = AddressSpace::new(&self.mapper, root).release_lower_half(&mut self.arena)?;
        self.arena.free_table_level(root.base())?;
        debug!("destroyed address space {root}, {released} tables released");
        Ok(())
    }

    /// Make `root` the active address space.
    ///
    /// # Safety
    /// `root` must be a well-formed PML4 whose kernel half maps the running
    /// code and data. Nothing is validated.
    pub unsafe fn load_address_space(&mut self, root: RootTable) {
        unsafe { self.mmu.load_root(root) };
    }
}

/// `first..=last` must stay on one side of the address hole, and user pages
/// must stay out of the kernel half.
fn check_range(first: VirtualAddress, last: VirtualAddress, flags: PageEntry) -> Result<(), VmmError> {
    if !first.is_canonical() {
        return Err(VmmError::NonCanonical(first));
    }
    if !last.is_canonical() {
        return Err(VmmError::NonCanonical(last));
    }
    if first.as_u64() < USER_SPACE_END && last.as_u64() >= USER_SPACE_END {
        return Err(VmmError::NonCanonical(VirtualAddress::new(USER_SPACE_END)));
    }
    if flags.user() && last.as_u64() >= KERNEL_SPACE_START {
        return Err(VmmError::UserInKernelSpace(first));
    }
    Ok(())
}

/// Exclusive end address of `count` pages from `start`.
fn range_end(start: VirtualAddress, count: u64) -> Result<u64, VmmError> {
    count
        .checked_mul(Size4K::SIZE)
        .and_then(|len| start.as_u64().checked_add(len))
        .ok_or(VmmError::AddressOverflow {
            start,
            pages: count,
        })
}
