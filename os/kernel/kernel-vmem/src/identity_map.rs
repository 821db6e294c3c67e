//! Identity map of physical memory.
//!
//! All RAM is mapped at a fixed kernel-half offset with 2 MiB leaves: one PDPT
//! hung off a single PML4 slot, one PD per GiB.
//!
//! ```text
//! PML4[offset]──► PDPT[0] ──► PD ──► 512 × 2 MiB  =  [0, 1 GiB)
//!                 PDPT[1] ──► PD ──► 512 × 2 MiB  =  [1 GiB, 2 GiB)
//!                 ...
//! ```

use crate::page_table::{PageEntry, PageTableNode, TableIndex, TableLevel};
use crate::{AddressSpace, FrameAlloc, MapError, PhysMapper};
use kernel_info::memory::IDENTITY_MAP_MAX_BYTES;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size1G, Size2M, VirtualAddress};
use log::{info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum IdentityMapError {
    #[error("identity map of {span:#x} bytes exceeds the {max:#x} byte limit")]
    SpanTooLarge { span: u64, max: u64 },
    #[error("identity map offset {0} is not aligned to a PML4 slot")]
    MisalignedOffset(VirtualAddress),
    #[error(transparent)]
    Tables(#[from] MapError),
}

/// Summary of a built identity map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IdentityMap {
    pub offset: VirtualAddress,
    /// Bytes of physical memory covered, a multiple of 1 GiB.
    pub span: u64,
    /// Page-table levels taken from the allocator (PDPT plus PDs).
    pub tables: usize,
}

impl IdentityMap {
    /// The identity-mapped virtual address of `pa`, if it is covered.
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        if pa.as_u64() < self.span {
            Some(VirtualAddress::new(self.offset.as_u64() + pa.as_u64()))
        } else {
            None
        }
    }
}

/// Map `[0, span)` at `offset` in `aspace`, rounding `span` up to whole GiB.
///
/// A PML4 slot that is already present is replaced; the old subtree is left
/// untouched.
///
/// # Errors
/// - [`IdentityMapError::SpanTooLarge`] if `span` exceeds [`IDENTITY_MAP_MAX_BYTES`].
/// - [`IdentityMapError::MisalignedOffset`] if `offset` does not start a PML4 slot.
/// - [`IdentityMapError::Tables`] if `tables` runs dry.
pub fn build<M: PhysMapper, A: FrameAlloc + ?Sized>(
    aspace: &AddressSpace<'_, M>,
    tables: &mut A,
    offset: VirtualAddress,
    span: u64,
) -> Result<IdentityMap, IdentityMapError> {
    if span > IDENTITY_MAP_MAX_BYTES {
        return Err(IdentityMapError::SpanTooLarge {
            span,
            max: IDENTITY_MAP_MAX_BYTES,
        });
    }
    if !offset.as_u64().is_multiple_of(TableLevel::Pml4.entry_span()) {
        return Err(IdentityMapError::MisalignedOffset(offset));
    }

    let gib = span.div_ceil(Size1G::SIZE).max(1);

    let pdpt_page = tables.alloc_4k().ok_or(MapError::TableExhausted {
        level: TableLevel::Pdpt,
    })?;
    let pdpt = aspace.node(pdpt_page);
    *pdpt = PageTableNode::zero();

    for g in 0..gib {
        let pd_page = tables.alloc_4k().ok_or(MapError::TableExhausted {
            level: TableLevel::Pd,
        })?;
        let pd = aspace.node(pd_page);
        for i in 0..512u16 {
            let pa = g * Size1G::SIZE + u64::from(i) * Size2M::SIZE;
            pd.set_entry(TableIndex::new(i), PageEntry::large_2m(PhysicalAddress::new(pa)));
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = TableIndex::new(g as u16);
        pdpt.set_entry(index, PageEntry::table(pd_page, false));
    }

    let slot = TableLevel::Pml4.index_of(offset);
    let root = aspace.node(aspace.root());
    if root.entry(slot).present() {
        warn!("identity map replaces present PML4[{slot}]");
    }
    root.set_entry(slot, PageEntry::table(pdpt_page, false));

    let map = IdentityMap {
        offset,
        span: gib * Size1G::SIZE,
        tables: 1 + usize::try_from(gib).unwrap_or(usize::MAX),
    };
    info!(
        "identity map: {} GiB at {offset} using {} tables",
        gib, map.tables
    );
    Ok(map)
}
