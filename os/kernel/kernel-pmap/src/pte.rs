//! # Translation entries
//!
//! One [`PtEntry`] describes one 4 KiB page. The low bits follow the layout
//! of the MIPS `EntryLo` register so a refill can copy them straight into the
//! TLB; the high bits are software state the hardware never sees.
//!
//! | Bits   | Name         | Meaning |
//! |--------|--------------|---------|
//! | 0      | `G`          | Global: matches regardless of ASID |
//! | 1      | `V`          | Valid |
//! | 2      | `D`          | Dirty: the TLB permits stores |
//! | 3..6   | `C`          | Cache coherency attribute |
//! | 6..36  | `PFN`        | Physical frame number |
//! | 56     | `RO`         | Software read-only; `D` may never be set |
//! | 57     | `W`          | Wired |
//! | 58     | `MANAGED`    | Frame has a reverse-mapping record |
//! | 59     | `REF`        | Software referenced bit |
//!
//! `D` doubles as the modified bit: writable managed mappings start with
//! `D` clear, the first store traps into modify emulation which sets it.

use crate::prot::Protection;
use bitfield_struct::bitfield;
use kernel_memory_addresses::FrameNumber;

/// Cache coherency attribute stored in the `C` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CacheAttr {
    /// Uncached; used for device registers.
    Uncached = 2,
    /// Cacheable, non-coherent, write-back.
    Cacheable = 3,
    /// Uncached accelerated; write-combining for frame buffers.
    UncachedAccelerated = 7,
}

impl CacheAttr {
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Decodes a `C` field; anything unknown is treated as uncached.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            3 => Self::Cacheable,
            7 => Self::UncachedAccelerated,
            _ => Self::Uncached,
        }
    }
}

/// A single translation entry.
///
/// ### Example
/// ```rust
/// # use kernel_pmap::{CacheAttr, PtEntry};
/// # use kernel_memory_addresses::FrameNumber;
/// let e = PtEntry::new()
///     .with_valid(true)
///     .with_frame(FrameNumber::new(5))
///     .with_cache_attr(CacheAttr::Cacheable);
/// assert_eq!(e.frame(), FrameNumber::new(5));
/// assert!(e.is_writable());
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PtEntry {
    /// Global (`G`): kernel translations shared by every ASID.
    pub global: bool,
    /// Valid (`V`).
    pub valid: bool,
    /// Dirty (`D`): stores allowed without a modify trap.
    pub dirty: bool,
    /// Cache attribute (`C`), see [`CacheAttr`].
    #[bits(3)]
    cache: u8,
    /// Physical frame number.
    #[bits(30)]
    pfn: u32,
    #[bits(20)]
    __reserved: u32,
    /// Software read-only.
    pub read_only: bool,
    /// Wired: excluded from reclamation.
    pub wired: bool,
    /// The frame is managed and a reverse-mapping record exists.
    pub managed: bool,
    /// Software referenced bit.
    pub referenced: bool,
    #[bits(4)]
    __spare: u8,
}

impl PtEntry {
    /// Empty slot in the kernel table. `G` is kept so the even/odd TLB pair
    /// of a global mapping stays global.
    #[inline]
    #[must_use]
    pub const fn invalid_global() -> Self {
        Self::new().with_global(true)
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new(self.pfn() as u64)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_frame(self, frame: FrameNumber) -> Self {
        self.with_pfn(frame.as_u64() as u32)
    }

    #[inline]
    #[must_use]
    pub const fn cache_attr(self) -> CacheAttr {
        CacheAttr::from_bits(self.cache())
    }

    #[inline]
    #[must_use]
    pub const fn with_cache_attr(self, attr: CacheAttr) -> Self {
        self.with_cache(attr.bits())
    }

    #[inline]
    pub const fn set_cache_attr(&mut self, attr: CacheAttr) {
        self.set_cache(attr.bits());
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !self.read_only()
    }

    /// Whether the page has been written through this mapping.
    #[inline]
    #[must_use]
    pub const fn is_modified(self) -> bool {
        self.dirty() && !self.read_only()
    }
}

/// Protection bits for a fresh mapping.
///
/// * No write permission: valid and read-only.
/// * Managed and writable: valid; dirty only if the access being resolved
///   is a write, so the first store otherwise goes through modify emulation.
/// * Unmanaged and writable: valid, dirty and referenced; there is nothing
///   to emulate for untracked frames.
#[must_use]
pub fn init_pte_prot(managed: bool, access: Protection, prot: Protection) -> PtEntry {
    let e = PtEntry::new().with_valid(true);
    if !prot.contains(Protection::WRITE) {
        e.with_read_only(true)
    } else if managed {
        e.with_dirty(access.contains(Protection::WRITE))
    } else {
        e.with_dirty(true).with_referenced(true)
    }
}
