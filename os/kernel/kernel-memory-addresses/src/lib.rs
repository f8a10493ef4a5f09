//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the translation
//! manager.
//!
//! ## Overview
//!
//! The MIPS MMU translates in units of one 4 KiB base page. Everything above
//! that granularity (segments, directories) is a software construct, so this
//! crate only models the three quantities the page-table code trades in:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | A byte address in some address space (user or kernel segment). |
//! | [`PhysicalAddress`] | A byte address on the physical bus (RAM or device registers). |
//! | [`FrameNumber`] | The index of a 4 KiB physical frame (`pa >> PAGE_SHIFT`). |
//!
//! Keeping them apart at the type level stops the classic "stored a VA in the
//! PFN field" bug.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.page_base().as_u64(), 0x0040_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let pa = PhysicalAddress::new(0x2000_5042);
//! let pfn = pa.frame();
//! assert_eq!(pfn.as_u64(), 0x20005);
//! assert_eq!(pfn.base().as_u64() + pa.page_offset(), pa.as_u64());
//! ```
//!
//! ## Design Notes
//!
//! - All types are `#[repr(transparent)]` over `u64` and `Copy + Ord + Hash`,
//!   so they can key ordered maps.
//! - Alignment helpers are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to a power-of-two `align`.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
/// assert_eq!(align_down(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Align `x` up to a power-of-two `align`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x1000, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

/// Number of base pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    align_up(bytes, PAGE_SIZE) >> PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn frame_and_address_agree() {
        let pa = PhysicalAddress::new(0x1234_5678);
        let pfn = FrameNumber::containing(pa);
        assert_eq!(pfn.base(), PhysicalAddress::new(0x1234_5000));
        assert_eq!(pfn.next().base().as_u64(), 0x1234_6000);
    }

    #[test]
    fn virtual_page_walk() {
        let va = VirtualAddress::new(0x7fff_f123);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_base() + PAGE_SIZE, va.round_up_page());
        assert_eq!(va.vpn(), 0x7ffff);
    }
}
