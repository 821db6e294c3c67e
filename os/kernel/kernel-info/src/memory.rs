//! # Memory Layout

/// Size of the base page (and of every page-table node).
pub const PAGE_SIZE: u64 = 4096;

/// First PML4 slot of the kernel half.
///
/// Slots `KERNEL_SPACE_PML4_INDEX..512` are shared by copying them into every
/// new address space.
pub const KERNEL_SPACE_PML4_INDEX: usize = 256;

/// Exclusive end of the lower (user) half of the canonical address space.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest virtual address of the kernel half.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// Virtual offset at which all of physical memory is mapped.
///
/// Physical address `pa` can be dereferenced at `IDENTITY_MAP_OFFSET + pa`
/// once the identity map has been built.
pub const IDENTITY_MAP_OFFSET: u64 = 0xffff_8880_0000_0000;

/// Largest amount of physical memory the identity map covers.
///
/// One PDPT plus one PD per GiB come out of the table arena, so this bounds
/// the arena share reserved for the identity map.
pub const IDENTITY_MAP_MAX_BYTES: u64 = 256 * 1024 * 1024 * 1024;

/// Base of the kernel heap's virtual region.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Initial heap size requested at boot (128 pages).
pub const INITIAL_HEAP_BYTES: u64 = 128 * PAGE_SIZE;

/// Number of page-table slots in the bootstrap table arena.
pub const TABLE_ARENA_SLOTS: usize = 512;

/// Number of physical range descriptors available to the range allocator.
///
/// Must leave room for remainders created by splitting free ranges.
pub const RANGE_DESCRIPTOR_CAPACITY: usize = 256;

const _: () = {
    assert!(IDENTITY_MAP_OFFSET >= KERNEL_SPACE_START);
    assert!(KERNEL_HEAP_BASE >= KERNEL_SPACE_START);
    assert!(IDENTITY_MAP_OFFSET.is_multiple_of(512 * 1024 * 1024 * 1024));
    assert!(IDENTITY_MAP_OFFSET + IDENTITY_MAP_MAX_BYTES <= KERNEL_HEAP_BASE);
    assert!(IDENTITY_MAP_MAX_BYTES <= 512 * 1024 * 1024 * 1024);
    assert!(KERNEL_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(INITIAL_HEAP_BYTES.is_multiple_of(PAGE_SIZE));
    assert!(((KERNEL_SPACE_START >> 39) & 0x1FF) as usize == KERNEL_SPACE_PML4_INDEX);
    assert!((USER_SPACE_END >> 39) as usize == KERNEL_SPACE_PML4_INDEX);
    // identity map tables (one PDPT, one PD per GiB) must leave slots for everything else
    assert!((1 + IDENTITY_MAP_MAX_BYTES / (1024 * 1024 * 1024)) < TABLE_ARENA_SLOTS as u64);
    assert!(TABLE_ARENA_SLOTS.is_multiple_of(64));
    assert!(RANGE_DESCRIPTOR_CAPACITY < u16::MAX as usize);
};
