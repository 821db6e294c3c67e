use kernel_alloc::{RangeAllocator, Vmm, VmmError};
use kernel_info::boot::{MemoryMapEntry, MemoryType};
use kernel_info::memory::{IDENTITY_MAP_OFFSET, USER_SPACE_END};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::testing::{RecordingMmu, TestPhys};
use kernel_vmem::{ArenaError, MapError, PageEntry, TableArena, TableLevel, TranslationError};

/// Frame 0 is the firmware root, frames 1..=16 the table arena, frames 32..64
/// usable RAM.
const FRAMES: usize = 64;
const ARENA_SLOTS: usize = 16;
const RAM_START: u64 = 32 * 4096;

fn setup(phys: &TestPhys) -> (Vmm<&TestPhys, RecordingMmu>, RangeAllocator) {
    let mmu = RecordingMmu::new(phys.frame(0));
    let arena = TableArena::new(phys.frame(1), ARENA_SLOTS);
    let vmm = Vmm::initialize(phys, mmu, arena, phys.len()).unwrap();

    let mut ranges = RangeAllocator::new();
    ranges
        .initialize(&[
            MemoryMapEntry::new(0, RAM_START, MemoryType::Used),
            MemoryMapEntry::new(RAM_START, phys.len() - RAM_START, MemoryType::Free),
        ])
        .unwrap();
    (vmm, ranges)
}

#[test]
fn identity_map_is_built_into_the_firmware_root() {
    let phys = TestPhys::with_frames(FRAMES);
    let (vmm, _) = setup(&phys);

    assert_eq!(vmm.kernel_root(), phys.frame(0));
    assert_eq!(vmm.arena().in_use(), 2);
    assert_eq!(vmm.mmu().flushes, 1);

    let pa = 0x3_0123;
    let va = VirtualAddress::new(IDENTITY_MAP_OFFSET + pa);
    assert_eq!(vmm.get_physical_address(va).unwrap().as_u64(), pa);
}

#[test]
fn map_translate_and_unmap_a_kernel_page() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, _) = setup(&phys);
    let va = VirtualAddress::new(0xffff_c000_0000_0000);
    let pa = PhysicalAddress::new(0x2_8000);

    vmm.map_page(va, pa, PageEntry::kernel_rw()).unwrap();
    assert_eq!(vmm.get_physical_address(va + 0x10).unwrap().as_u64(), 0x2_8010);
    assert_eq!(vmm.mmu().invalidations, [va]);

    let pte = vmm.get_pte_address(va).unwrap();
    let raw: &mut u64 = unsafe { kernel_vmem::PhysMapper::phys_to_mut(&phys, pte) };
    assert!(PageEntry::from_bits(*raw).present());

    vmm.unmap_page(va).unwrap();
    assert_eq!(
        vmm.get_physical_address(va),
        Err(TranslationError::NotPresent {
            level: TableLevel::Pt,
            va
        })
    );
    assert_eq!(vmm.get_pte_address(va).unwrap(), pte);
    assert_eq!(vmm.mmu().invalidations.len(), 2);
}

#[test]
fn unaligned_physical_frames_are_refused() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, _) = setup(&phys);
    let err = vmm
        .map_page(
            VirtualAddress::new(0xffff_c000_0000_0000),
            PhysicalAddress::new(0x2_8008),
            PageEntry::kernel_rw(),
        )
        .unwrap_err();
    assert_eq!(err, VmmError::UnalignedPhysical(PhysicalAddress::new(0x2_8008)));
}

#[test]
fn kernel_pages_come_from_the_range_allocator() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let start = VirtualAddress::new(0xffff_c000_0000_0000);

    vmm.allocate_kernel_pages(start, 4, PageEntry::kernel_rw(), &mut ranges)
        .unwrap();

    for i in 0..4u64 {
        let pa = vmm.get_physical_address(start + i * 4096).unwrap();
        assert_eq!(pa.as_u64(), RAM_START + i * 4096);
    }
    assert_eq!(ranges.free_bytes(), phys.len() - RAM_START - 4 * 4096);
}

#[test]
fn running_out_of_frames_keeps_the_pages_already_mapped() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let start = VirtualAddress::new(0xffff_c000_0000_0000);
    let available = (phys.len() - RAM_START) / 4096;

    let err = vmm
        .allocate_kernel_pages(start, available + 2, PageEntry::kernel_rw(), &mut ranges)
        .unwrap_err();
    assert_eq!(
        err,
        VmmError::OutOfFrames {
            mapped: available,
            requested: available + 2
        }
    );
    assert!(vmm.get_physical_address(start).is_ok());
    assert!(vmm.get_physical_address(start + available * 4096).is_err());
}

#[test]
fn non_canonical_addresses_are_refused() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let tables = vmm.arena().in_use();
    let hole = VirtualAddress::new(0x0000_8000_0000_1000);

    assert_eq!(
        vmm.map_page(hole, PhysicalAddress::new(0x2_0000), PageEntry::kernel_rw()),
        Err(VmmError::NonCanonical(hole))
    );
    assert_eq!(vmm.arena().in_use(), tables);

    // A run of pages may not cross from the lower half into the hole.
    let below = VirtualAddress::new(USER_SPACE_END - 4096);
    assert_eq!(
        vmm.allocate_kernel_pages(below, 2, PageEntry::kernel_rw(), &mut ranges),
        Err(VmmError::NonCanonical(VirtualAddress::new(USER_SPACE_END)))
    );
    assert_eq!(ranges.free_bytes(), phys.len() - RAM_START);
    assert!(vmm.mmu().invalidations.is_empty());
}

#[test]
fn user_mappings_never_reach_into_the_kernel_half() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let heap = VirtualAddress::new(0xffff_c000_0000_0000);
    vmm.map_page(heap, PhysicalAddress::new(0x2_0000), PageEntry::kernel_rw())
        .unwrap();
    let user = vmm.create_address_space().unwrap();

    let va = heap + 0x2000;
    assert_eq!(
        vmm.map_page_in(user, va, PhysicalAddress::new(0x2_1000), PageEntry::user_rw()),
        Err(VmmError::UserInKernelSpace(va))
    );
    assert_eq!(
        vmm.allocate_kernel_pages(va, 1, PageEntry::user_ro(), &mut ranges),
        Err(VmmError::UserInKernelSpace(va))
    );
    assert_eq!(ranges.free_bytes(), phys.len() - RAM_START);

    // The shared tables stay supervisor-only in both roots.
    for root in [vmm.kernel_root(), user] {
        let walk = vmm.address_space(root).walk(heap);
        assert_eq!(walk.steps().count(), 4);
        assert!(walk.steps().all(|s| !s.entry.user()));
    }
    assert!(vmm.get_physical_address_in(user, va).is_err());
}

#[test]
fn table_exhaustion_does_not_consume_frames() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    // Each untouched PML4 slot costs three tables; leave two.
    for slot in 1..=4u64 {
        vmm.map_page(
            VirtualAddress::new(slot << 39),
            PhysicalAddress::new(0x2_0000),
            PageEntry::kernel_rw(),
        )
        .unwrap();
    }
    assert_eq!(vmm.arena().available(), 2);

    let err = vmm
        .allocate_kernel_pages(VirtualAddress::new(5 << 39), 1, PageEntry::kernel_rw(), &mut ranges)
        .unwrap_err();
    assert_eq!(
        err,
        VmmError::Map(MapError::TableExhausted {
            level: TableLevel::Pt
        })
    );
    assert_eq!(ranges.free_bytes(), phys.len() - RAM_START);
    assert_eq!(vmm.arena().available(), 2);
}

#[test]
fn user_pages_are_user_accessible_and_stay_below_the_kernel_half() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let root = vmm.create_address_space().unwrap();
    let start = VirtualAddress::new(0x40_0000);

    vmm.allocate_user_pages(start, 2, PageEntry::user_rw().with_user(false), root, &mut ranges)
        .unwrap();
    let leaf = vmm.address_space(root).leaf_entry(start + 4096).unwrap();
    assert!(leaf.entry.user());
    assert!(leaf.entry.writable());
    assert!(vmm.get_physical_address(start).is_err());

    let top = VirtualAddress::new(USER_SPACE_END - 4096);
    assert_eq!(
        vmm.allocate_user_pages(top, 2, PageEntry::user_rw(), root, &mut ranges),
        Err(VmmError::NotUserSpace(top))
    );
    assert_eq!(
        vmm.allocate_user_pages(start + 1, 1, PageEntry::user_rw(), root, &mut ranges),
        Err(VmmError::UnalignedVirtual(start + 1))
    );
}

#[test]
fn new_spaces_share_the_kernel_half_and_isolate_the_lower_half() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, _) = setup(&phys);
    let kernel_va = VirtualAddress::new(0xffff_c000_0000_0000);
    vmm.map_page(kernel_va, PhysicalAddress::new(0x2_0000), PageEntry::kernel_rw())
        .unwrap();

    let a = vmm.create_address_space().unwrap();
    let b = vmm.create_address_space().unwrap();
    assert_ne!(a, b);

    // Kernel mappings present at creation are visible everywhere.
    assert_eq!(
        vmm.get_physical_address_in(a, kernel_va).unwrap(),
        vmm.get_physical_address(kernel_va).unwrap()
    );

    // Lower-half mappings stay private.
    let user_va = VirtualAddress::new(0x1000);
    vmm.map_page_in(a, user_va, PhysicalAddress::new(0x2_1000), PageEntry::user_rw())
        .unwrap();
    assert!(vmm.get_physical_address_in(a, user_va).is_ok());
    assert!(vmm.get_physical_address_in(b, user_va).is_err());
    assert!(vmm.get_physical_address(user_va).is_err());
}

#[test]
fn kernel_half_is_copied_at_creation_time() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, _) = setup(&phys);
    let space = vmm.create_address_space().unwrap();

    // A kernel-half PML4 slot populated afterwards is not seen by `space`.
    let late = VirtualAddress::new(0xffff_ff80_0000_0000);
    vmm.map_page(late, PhysicalAddress::new(0x2_2000), PageEntry::kernel_rw())
        .unwrap();
    assert!(vmm.get_physical_address(late).is_ok());
    assert_eq!(
        vmm.get_physical_address_in(space, late),
        Err(TranslationError::NotPresent {
            level: TableLevel::Pml4,
            va: late
        })
    );
}

#[test]
fn destroying_a_space_returns_its_tables() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, mut ranges) = setup(&phys);
    let before = vmm.arena().in_use();

    let root = vmm.create_address_space().unwrap();
    vmm.allocate_user_pages(VirtualAddress::new(0x1000), 1, PageEntry::user_rw(), root, &mut ranges)
        .unwrap();
    assert_eq!(vmm.arena().in_use(), before + 4);

    vmm.destroy_address_space(root).unwrap();
    assert_eq!(vmm.arena().in_use(), before);
}

#[test]
fn kernel_active_and_foreign_roots_cannot_be_destroyed() {
    let phys = TestPhys::with_frames(FRAMES);
    let (mut vmm, _) = setup(&phys);
    let kernel = vmm.kernel_root();
    assert_eq!(
        vmm.destroy_address_space(kernel),
        Err(VmmError::KernelRoot(kernel))
    );

    let root = vmm.create_address_space().unwrap();
    unsafe { vmm.load_address_space(root) };
    assert_eq!(vmm.active_root(), root);
    assert_eq!(vmm.mmu().loads, [root]);
    assert_eq!(vmm.destroy_address_space(root), Err(VmmError::ActiveRoot(root)));

    unsafe { vmm.load_address_space(kernel) };
    let foreign = phys.frame(40);
    assert_eq!(
        vmm.destroy_address_space(foreign),
        Err(VmmError::Arena(ArenaError::InvalidPointer(foreign.base())))
    );
    vmm.destroy_address_space(root).unwrap();
}
