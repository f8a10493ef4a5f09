//! Page-table-page lifecycle.
//!
//! Pages are handed out by a [`PtpSlab`] fed from a [`FrameSource`]. A
//! user table page lives exactly as long as its wire count is nonzero;
//! [`release`] is the only way the count goes down. Kernel table pages are
//! installed by kernel growth with a count of zero and never released.

use crate::error::PmapError;
use crate::pte::PtEntry;
use crate::table::{PtpHandle, TranslationTable};
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_info::memory::{NPTEPG, segment_index};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_sync::SpinMutex;

/// Supplies physical frames for page-table pages and directories.
pub trait FrameSource: Send {
    fn alloc_frame(&mut self) -> Option<FrameNumber>;

    /// Frames still available.
    fn remaining(&self) -> usize;
}

/// A contiguous run of frames set aside at bootstrap.
#[derive(Debug, Clone)]
pub struct ReservedFrames {
    next: FrameNumber,
    left: usize,
}

impl ReservedFrames {
    #[must_use]
    pub const fn new(first: FrameNumber, count: usize) -> Self {
        Self {
            next: first,
            left: count,
        }
    }
}

impl FrameSource for ReservedFrames {
    fn alloc_frame(&mut self) -> Option<FrameNumber> {
        if self.left == 0 {
            return None;
        }
        let f = self.next;
        self.next = f.next();
        self.left -= 1;
        Some(f)
    }

    fn remaining(&self) -> usize {
        self.left
    }
}

/// A frame together with the entries stored in it.
pub(crate) struct TableFrame {
    pub frame: FrameNumber,
    pub entries: Box<[PtEntry; NPTEPG]>,
}

/// Cache of zeroed table frames in front of a [`FrameSource`].
pub struct PtpSlab {
    source: Box<dyn FrameSource>,
    free: Vec<TableFrame>,
}

impl PtpSlab {
    #[must_use]
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            free: Vec::new(),
        }
    }

    /// Frames that can still be handed out.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len() + self.source.remaining()
    }

    /// A frame with every entry set to `fill`.
    pub(crate) fn take(&mut self, fill: PtEntry) -> Option<TableFrame> {
        let mut f = match self.free.pop() {
            Some(f) => f,
            None => TableFrame {
                frame: self.source.alloc_frame()?,
                entries: Box::new([PtEntry::new(); NPTEPG]),
            },
        };
        if fill != PtEntry::new() {
            f.entries.fill(fill);
        }
        Some(f)
    }

    /// Zero-fills and caches a frame.
    pub(crate) fn give(&mut self, mut f: TableFrame) {
        f.entries.fill(PtEntry::new());
        self.free.push(f);
    }
}

/// Returns the page covering `va`, fabricating it if needed, with one
/// extra reference held for the caller.
///
/// # Errors
/// [`PmapError::ResourceShortage`] when no frame is left and `nosleep` is
/// set.
///
/// # Panics
/// When no frame is left and `nosleep` is not set.
pub(crate) fn allocate(
    table: &mut TranslationTable,
    va: VirtualAddress,
    slab: &SpinMutex<PtpSlab>,
    nosleep: bool,
) -> Result<PtpHandle, PmapError> {
    let segment = segment_index(va.as_u64());

    if let Some(h) = table.hint
        && table.page(h).segment == segment
    {
        table.page_mut(h).wire_count += 1;
        return Ok(h);
    }

    if let Some(h) = table.locate(va) {
        table.page_mut(h).wire_count += 1;
        table.hint = Some(h);
        return Ok(h);
    }

    let fill = table.empty_entry();
    let Some(backing) = slab.lock().take(fill) else {
        if nosleep {
            return Err(PmapError::ResourceShortage);
        }
        panic!("out of page-table pages mapping {va}");
    };
    let h = table.install(segment, backing, 1);
    table.hint = Some(h);
    Ok(h)
}

/// Drops one reference; frees the page when it was the last one.
///
/// Returns whether the page was freed.
///
/// # Panics
/// On wire-count underflow.
pub(crate) fn release(table: &mut TranslationTable, h: PtpHandle, slab: &SpinMutex<PtpSlab>) -> bool {
    let page = table.page_mut(h);
    assert!(page.wire_count > 0, "page-table page {h:?} wire count underflow");
    page.wire_count -= 1;
    if page.wire_count > 0 {
        return false;
    }
    let backing = table.take(h);
    slab.lock().give(backing);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab(frames: usize) -> SpinMutex<PtpSlab> {
        SpinMutex::new(PtpSlab::new(Box::new(ReservedFrames::new(
            FrameNumber::new(0x100),
            frames,
        ))))
    }

    #[test]
    fn allocate_reuses_and_counts_references() {
        let slab = slab(4);
        let mut t = TranslationTable::new(false);
        let a = allocate(&mut t, VirtualAddress::new(0x1000), &slab, false).unwrap();
        let b = allocate(&mut t, VirtualAddress::new(0x2000), &slab, false).unwrap();
        assert_eq!(a, b);
        assert_eq!(t.page(a).wire_count, 2);
        assert_eq!(slab.lock().available(), 3);

        let c = allocate(&mut t, VirtualAddress::new(0x0040_0000), &slab, false).unwrap();
        assert_ne!(a, c);
        assert_eq!(t.hint, Some(c));
    }

    #[test]
    fn last_release_frees_and_zeroes() {
        let slab = slab(1);
        let mut t = TranslationTable::new(false);
        let va = VirtualAddress::new(0x5000);
        let h = allocate(&mut t, va, &slab, false).unwrap();
        *t.entry_mut(va).unwrap() = PtEntry::new().with_valid(true);

        assert!(release(&mut t, h, &slab));
        assert!(t.locate(va).is_none());
        assert_eq!(t.hint, None);

        let again = slab.lock().take(PtEntry::new()).unwrap();
        assert!(again.entries.iter().all(|e| *e == PtEntry::new()));
    }

    #[test]
    fn kernel_pages_start_invalid_global() {
        let slab = slab(1);
        let mut t = TranslationTable::new(true);
        let va = VirtualAddress::new(0xc000_0000);
        allocate(&mut t, va, &slab, false).unwrap();
        assert_eq!(t.entry(va), Some(PtEntry::invalid_global()));
    }

    #[test]
    fn nosleep_reports_shortage() {
        let slab = slab(0);
        let mut t = TranslationTable::new(false);
        let r = allocate(&mut t, VirtualAddress::new(0x1000), &slab, true);
        assert_eq!(r, Err(PmapError::ResourceShortage));
    }

    #[test]
    #[should_panic(expected = "wire count underflow")]
    fn underflow_is_fatal() {
        let slab = slab(2);
        let mut t = TranslationTable::new(false);
        let h = allocate(&mut t, VirtualAddress::new(0x1000), &slab, false).unwrap();
        t.page_mut(h).wire_count = 0;
        release(&mut t, h, &slab);
    }
}
