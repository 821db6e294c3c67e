//! # Physical and Virtual Memory Address Types
//!
//! Zero-cost `u64` wrappers that keep physical and virtual addresses apart at
//! compile time, plus page-granular views of both.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address translated through the page tables. |
//! | [`PhysicalPage<S>`] | A physical frame of size `S`, aligned to `S`. |
//! | [`VirtualPage<S>`] | A virtual page of size `S`, aligned to `S`. |
//!
//! The page size is a type parameter implementing the sealed [`PageSize`]
//! trait. The three x86-64 sizes are provided: [`Size4K`], [`Size2M`] and
//! [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8880_0020_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_8880_0020_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(page.base() + va.offset::<Size4K>(), va);
//!
//! let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x7000)).unwrap();
//! assert_eq!(frame.number(), 7);
//! assert!(PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x7001)).is_none());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes supported by x86-64 paging.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`.
    const SHIFT: u32;
    /// Short human-readable name, e.g. `"4K"`.
    const NAME: &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;
            const NAME: &'static str = $label;
        }
    };
}

page_size!(
    /// 4 KiB page, mapped by a PT entry.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page, mapped by a PD entry with `PS=1`.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page, mapped by a PDPT entry with `PS=1`.
    Size1G, 30, "1G"
);

macro_rules! address_type {
    ($(#[$meta:meta])* $addr:ident, $(#[$page_meta:meta])* $page:ident, $label:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $addr(u64);

        impl $addr {
            /// The zero address.
            pub const ZERO: Self = Self(0);

            #[inline(always)]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[inline(always)]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// The `S`-sized page containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page::containing_address(self)
            }

            /// Byte offset of this address within its `S`-sized page.
            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & (S::SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.offset::<S>() == 0
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0 & !(S::SIZE - 1))
            }

            /// Align up to the next `S` boundary, or `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn checked_align_up<S: PageSize>(self) -> Option<Self> {
                match self.0.checked_add(S::SIZE - 1) {
                    Some(v) => Some(Self(v & !(S::SIZE - 1))),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($addr), "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl fmt::LowerHex for $addr {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl Add<u64> for $addr {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $addr {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        /// Distance in bytes between two addresses.
        impl Sub for $addr {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: Self) -> Self::Output {
                self.0 - rhs.0
            }
        }

        $(#[$page_meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $page<S: PageSize> {
            base: u64,
            _size: PhantomData<S>,
        }

        impl<S: PageSize> $page<S> {
            /// The page starting exactly at `addr`, or `None` if `addr` is unaligned.
            #[inline]
            #[must_use]
            pub const fn from_addr(addr: $addr) -> Option<Self> {
                if addr.is_aligned::<S>() {
                    Some(Self {
                        base: addr.as_u64(),
                        _size: PhantomData,
                    })
                } else {
                    None
                }
            }

            /// The page containing `addr`.
            #[inline]
            #[must_use]
            pub const fn containing_address(addr: $addr) -> Self {
                Self {
                    base: addr.as_u64() & !(S::SIZE - 1),
                    _size: PhantomData,
                }
            }

            /// The page with number `n`, i.e. base `n * S::SIZE`.
            #[inline]
            #[must_use]
            pub const fn from_number(n: u64) -> Self {
                Self {
                    base: n << S::SHIFT,
                    _size: PhantomData,
                }
            }

            #[inline(always)]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr(self.base)
            }

            /// Page number (base divided by the page size).
            #[inline(always)]
            #[must_use]
            pub const fn number(self) -> u64 {
                self.base >> S::SHIFT
            }

            /// Address of byte `offset` inside this page.
            #[inline]
            #[must_use]
            pub const fn join(self, offset: u64) -> $addr {
                debug_assert!(offset < S::SIZE);
                $addr(self.base + (offset & (S::SIZE - 1)))
            }
        }

        impl<S: PageSize> fmt::Debug for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($page), "<{}>(0x{:016X})"), S::NAME, self.base)
            }
        }

        impl<S: PageSize> fmt::Display for $page<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " 0x{:016X}/{}"), self.base, S::NAME)
            }
        }
    };
}

address_type!(
    /// A physical byte address.
    PhysicalAddress,
    /// A physical frame of size `S`.
    PhysicalPage,
    "frame"
);

address_type!(
    /// A virtual byte address.
    VirtualAddress,
    /// A virtual page of size `S`.
    VirtualPage,
    "page"
);

impl VirtualAddress {
    /// The address of a pointer.
    #[inline]
    #[must_use]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>() as usize as u64)
    }

    /// Reinterpret this address as a raw pointer.
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// Whether bits 48..64 are a sign extension of bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let top = self.0 >> 47;
        top == 0 || top == 0x1_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_offset_4k() {
        let a = PhysicalAddress::new(0x1234_5678_9ABC_DEF0);
        let page = a.page::<Size4K>();
        assert_eq!(page.base().as_u64(), 0x1234_5678_9ABC_D000);
        assert_eq!(a.offset::<Size4K>(), 0xEF0);
        assert_eq!(page.join(a.offset::<Size4K>()), a);
    }

    #[test]
    fn page_and_offset_2m() {
        let a = VirtualAddress::new(0x0000_0008_1234_5678);
        let page = a.page::<Size2M>();
        assert_eq!(page.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(a.offset::<Size2M>(), 0x0014_5678);
        assert_eq!(page.base() + a.offset::<Size2M>(), a);
    }

    #[test]
    fn from_addr_rejects_unaligned() {
        assert!(PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1000)).is_some());
        assert!(PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x1008)).is_none());
        assert!(PhysicalPage::<Size2M>::from_addr(PhysicalAddress::new(0x1000)).is_none());
    }

    #[test]
    fn numbering() {
        let frame = PhysicalPage::<Size4K>::from_number(3);
        assert_eq!(frame.base().as_u64(), 0x3000);
        assert_eq!(frame.number(), 3);
    }

    #[test]
    fn align_helpers() {
        let a = VirtualAddress::new(0x1001);
        assert_eq!(a.align_down::<Size4K>().as_u64(), 0x1000);
        assert_eq!(a.checked_align_up::<Size4K>().map(VirtualAddress::as_u64), Some(0x2000));
        assert_eq!(VirtualAddress::new(u64::MAX).checked_align_up::<Size4K>(), None);
        assert_eq!(VirtualAddress::new(0x3000) - VirtualAddress::new(0x1000), 0x2000);
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    }

    #[test]
    fn display_is_zero_padded_hex() {
        let pa = PhysicalAddress::new(0xBEEF);
        assert_eq!(format!("{pa}"), "0x000000000000BEEF");
        assert_eq!(format!("{pa:?}"), "PhysicalAddress(0x000000000000BEEF)");
        let page = VirtualPage::<Size4K>::from_number(1);
        assert_eq!(format!("{page}"), "page 0x0000000000001000/4K");
    }
}
