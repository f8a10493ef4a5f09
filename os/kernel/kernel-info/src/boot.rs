//! # Boot Memory Map
//!
//! Firmware hands over an unordered list of RAM ranges, possibly unaligned
//! and overlapping. [`normalize`] turns that into what the translation
//! manager's bootstrap expects: sorted, page-aligned, disjoint regions.

use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, align_down, align_up};

/// A half-open range `[start, end)` of physical RAM.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysRegion {
    #[inline]
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of whole frames in the region.
    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn first_frame(&self) -> FrameNumber {
        self.start.frame()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start.as_u64() && pa.as_u64() < self.end.as_u64()
    }
}

/// Sort, page-align and coalesce `regions` in place.
///
/// Returns how many leading entries of `regions` are valid afterwards.
/// Starts are rounded up and ends rounded down, so partial pages are
/// dropped; regions that shrink to nothing are removed.
///
/// ```rust
/// # use kernel_info::boot::{PhysRegion, normalize};
/// let mut map = [
///     PhysRegion::new(0x8000, 0x9800),
///     PhysRegion::new(0x0100, 0x4000),
///     PhysRegion::new(0x4000, 0x6000),
/// ];
/// let n = normalize(&mut map);
/// assert_eq!(&map[..n], &[PhysRegion::new(0x1000, 0x6000), PhysRegion::new(0x8000, 0x9000)]);
/// ```
pub fn normalize(regions: &mut [PhysRegion]) -> usize {
    for r in regions.iter_mut() {
        let start = align_up(r.start.as_u64(), PAGE_SIZE);
        let end = align_down(r.end.as_u64(), PAGE_SIZE);
        *r = PhysRegion::new(start, end.max(start));
    }
    regions.sort_unstable_by_key(|r| r.start);

    let mut out = 0;
    for i in 0..regions.len() {
        let r = regions[i];
        if r.is_empty() {
            continue;
        }
        if out > 0 && regions[out - 1].end >= r.start {
            let prev = &mut regions[out - 1];
            prev.end = prev.end.max(r.end);
        } else {
            regions[out] = r;
            out += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_regions_merge() {
        let mut map = [
            PhysRegion::new(0x3000_0000, 0x3100_0000),
            PhysRegion::new(0x0000_0000, 0x0200_0000),
            PhysRegion::new(0x0100_0000, 0x0300_0000),
        ];
        let n = normalize(&mut map);
        assert_eq!(n, 2);
        assert_eq!(map[0], PhysRegion::new(0, 0x0300_0000));
        assert_eq!(map[1].frame_count(), 0x1000);
    }

    #[test]
    fn sub_page_regions_vanish() {
        let mut map = [PhysRegion::new(0x10, 0x20), PhysRegion::new(0x1000, 0x1fff)];
        assert_eq!(normalize(&mut map), 0);
    }
}
