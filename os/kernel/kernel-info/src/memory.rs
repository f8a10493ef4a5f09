//! # Memory Layout

use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

/// Bytes per translation entry.
pub const PTE_SIZE: u64 = 8;

/// Translation entries held by one page-table page.
pub const NPTEPG: usize = (PAGE_SIZE / PTE_SIZE) as usize;

/// log2 of the VA span covered by one segment-directory slot.
pub const SEGMENT_SHIFT: u32 = PAGE_SHIFT + NPTEPG.trailing_zeros();

/// VA span covered by one segment-directory slot (one page-table page).
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;

/// Slots in a segment directory; covers the full 32-bit VA.
pub const NSEGS: usize = 1 << (32 - SEGMENT_SHIFT);

/// First address past the per-process segment.
pub const USER_MAX_ADDRESS: u64 = 0x8000_0000;

/// Cached direct map of the low physical range.
pub const KSEG0_BASE: u64 = 0x8000_0000;

/// Uncached direct map of the low physical range.
pub const KSEG1_BASE: u64 = 0xA000_0000;

/// Physical bytes reachable through `kseg0`/`kseg1`.
pub const DIRECT_MAP_SIZE: u64 = 0x2000_0000;

/// Start of the mapped kernel segment.
pub const KERNEL_BASE: u64 = 0xC000_0000;

/// End of the general-purpose kernel VA; the window area follows.
pub const KERNEL_MAX_ADDRESS: u64 = WINDOW_BASE;

/// Start of the per-CPU physical window slots.
pub const WINDOW_BASE: u64 = 0xFFC0_0000;

/// Window slots per CPU.
pub const WINDOW_SLOTS: usize = 2;

/// Largest CPU count supported; the active-CPU set is a `u64` mask.
pub const MAX_CPUS: usize = 64;

/// First address past the window area.
pub const WINDOW_END: u64 = WINDOW_BASE + (MAX_CPUS * WINDOW_SLOTS) as u64 * PAGE_SIZE;

/// Tag reserved for the kernel's global translations.
pub const KERNEL_ASID: u16 = 0;

/// Number of distinct tags the TLB can hold (8-bit `EntryHi.ASID`).
pub const HW_ASID_COUNT: u16 = 256;

/// Returns the segment-directory slot for `va`.
#[inline]
#[must_use]
pub const fn segment_index(va: u64) -> usize {
    (va >> SEGMENT_SHIFT) as usize
}

/// Returns the entry index inside the page-table page for `va`.
#[inline]
#[must_use]
pub const fn pte_index(va: u64) -> usize {
    ((va >> PAGE_SHIFT) as usize) & (NPTEPG - 1)
}

/// First address of the segment following the one containing `va`.
#[inline]
#[must_use]
pub const fn next_segment(va: u64) -> u64 {
    (va | (SEGMENT_SIZE - 1)) + 1
}

/// Whether `va` lies in the kernel's mapped segment (window area included).
#[inline]
#[must_use]
pub const fn is_kernel_mapped(va: u64) -> bool {
    va >= KERNEL_BASE && va < WINDOW_END
}

/// Whether `va` is a user address.
#[inline]
#[must_use]
pub const fn is_user(va: u64) -> bool {
    va < USER_MAX_ADDRESS
}

const _: () = {
    assert!(NPTEPG == 512);
    assert!(SEGMENT_SIZE == 2 * 1024 * 1024);
    assert!(NSEGS == 2048);
    assert!(USER_MAX_ADDRESS <= KSEG0_BASE);
    assert!(KSEG1_BASE == KSEG0_BASE + DIRECT_MAP_SIZE);
    assert!(KERNEL_BASE == KSEG1_BASE + DIRECT_MAP_SIZE);
    assert!(WINDOW_BASE.is_multiple_of(SEGMENT_SIZE));
    assert!(WINDOW_END <= 0x1_0000_0000);
    assert!(KERNEL_BASE.is_multiple_of(SEGMENT_SIZE));
};
