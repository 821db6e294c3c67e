//! Page-fault diagnostics.
//!
//! Decodes the error code the CPU pushes for `#PF` and walks the active
//! address space at the faulting address (CR2), so the fault handler can log
//! a useful report before halting.

use crate::vmm::Vmm;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{Mmu, PhysMapper, RootTable, TranslationError, Walk};
use log::error;

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 1 = write access.
    pub write: bool,
    /// 1 = access from CPL3.
    pub user: bool,
    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool,
    /// 1 = instruction fetch.
    pub instruction_fetch: bool,
    /// 1 = protection-key violation (CR4.PKE=1).
    pub protection_key: bool,
    /// 1 = shadow stack access (CET-SS).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// A page fault as delivered by the CPU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address (CR2).
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(cr2: u64, error_code: u64) -> Self {
        Self {
            address: VirtualAddress::new(cr2),
            error: PageFaultError::from_bits(error_code),
        }
    }
}

/// Everything known about a fault after walking the page tables.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub fault: PageFault,
    /// The address space that was active.
    pub root: RootTable,
    pub walk: Walk,
    pub translation: Result<PhysicalAddress, TranslationError>,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "PAGE FAULT: cr2={} err={:#x} root={}",
            self.fault.address,
            self.fault.error.into_bits(),
            self.root
        )?;
        writeln!(f, "{}", self.fault.error.explain())?;
        for step in self.walk.steps() {
            let e = step.entry;
            writeln!(
                f,
                "  {}[{}] @ {}: P={} W={} U={} PS={} NX={} -> {}",
                step.level,
                step.index,
                step.table,
                u8::from(e.present()),
                u8::from(e.writable()),
                u8::from(e.user()),
                u8::from(e.huge_page()),
                u8::from(e.no_execute()),
                e.address()
            )?;
        }
        match self.translation {
            Ok(pa) => write!(f, "  resolves to {pa}"),
            Err(err) => write!(f, "  {err}"),
        }
    }
}

impl<M: PhysMapper, P: Mmu> Vmm<M, P> {
    /// Walk the active address space at the faulting address and log the
    /// result.
    #[must_use]
    pub fn diagnose_fault(&self, fault: PageFault) -> FaultReport {
        let root = self.active_root();
        let space = self.address_space(root);
        let report = FaultReport {
            fault,
            root,
            walk: space.walk(fault.address),
            translation: space.translate(fault.address),
        };
        error!("{report}");
        report
    }
}
