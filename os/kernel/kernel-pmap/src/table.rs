//! Two-level translation table.
//!
//! ```text
//!  va[31:21] ──► directory[NSEGS] ──► PageTablePage ──► entries[va[20:12]]
//! ```
//!
//! Directory slots hold arena handles instead of pointers; a slot is
//! `None` until the first mapping in its segment fabricates a page.

use crate::arena::{Arena, Handle};
use crate::ptp::TableFrame;
use crate::pte::PtEntry;
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::{NPTEPG, NSEGS, next_segment, pte_index, segment_index};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};

pub(crate) type PtpHandle = Handle<PageTablePage>;

/// One page of translation entries, referenced from one directory slot.
pub(crate) struct PageTablePage {
    pub segment: usize,
    /// Valid entries, plus one for every lookup currently holding the page.
    pub wire_count: u32,
    backing: TableFrame,
}

impl PageTablePage {
    #[inline]
    pub const fn frame(&self) -> FrameNumber {
        self.backing.frame
    }

    #[inline]
    pub fn entries(&self) -> &[PtEntry; NPTEPG] {
        &self.backing.entries
    }

    #[inline]
    pub fn entries_mut(&mut self) -> &mut [PtEntry; NPTEPG] {
        &mut self.backing.entries
    }
}

pub(crate) struct TranslationTable {
    directory: Box<[Option<PtpHandle>]>,
    pages: Arena<PageTablePage>,
    /// Page touched by the last allocation; saves the directory walk for
    /// runs of faults in one segment.
    pub hint: Option<PtpHandle>,
    kernel: bool,
}

impl TranslationTable {
    pub fn new(kernel: bool) -> Self {
        Self {
            directory: vec![None; NSEGS].into_boxed_slice(),
            pages: Arena::new(),
            hint: None,
            kernel,
        }
    }

    /// What an unused slot holds: kernel tables keep `G` set.
    #[inline]
    pub const fn empty_entry(&self) -> PtEntry {
        if self.kernel {
            PtEntry::invalid_global()
        } else {
            PtEntry::new()
        }
    }

    #[inline]
    pub fn locate(&self, va: VirtualAddress) -> Option<PtpHandle> {
        self.directory[segment_index(va.as_u64())]
    }

    #[inline]
    pub fn page(&self, h: PtpHandle) -> &PageTablePage {
        &self.pages[h]
    }

    #[inline]
    pub fn page_mut(&mut self, h: PtpHandle) -> &mut PageTablePage {
        &mut self.pages[h]
    }

    /// The entry for `va`, or `None` when no page covers its segment.
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let h = self.locate(va)?;
        Some(self.pages[h].entries()[pte_index(va.as_u64())])
    }

    pub fn entry_mut(&mut self, va: VirtualAddress) -> Option<&mut PtEntry> {
        let h = self.locate(va)?;
        Some(&mut self.pages[h].entries_mut()[pte_index(va.as_u64())])
    }

    /// Hooks `backing` into the directory slot `segment`.
    pub fn install(&mut self, segment: usize, backing: TableFrame, wire_count: u32) -> PtpHandle {
        debug_assert!(self.directory[segment].is_none(), "segment {segment} already populated");
        let page = PageTablePage {
            segment,
            wire_count,
            backing,
        };
        let Ok(h) = self.pages.insert(page) else {
            unreachable!("page-table arena is unbounded");
        };
        self.directory[segment] = Some(h);
        h
    }

    /// Unhooks a page, clearing its directory slot and the hint.
    pub fn take(&mut self, h: PtpHandle) -> TableFrame {
        let page = self
            .pages
            .remove(h)
            .unwrap_or_else(|| panic!("stale page-table handle {h:?}"));
        self.directory[page.segment] = None;
        if self.hint == Some(h) {
            self.hint = None;
        }
        page.backing
    }

    /// Populated pages in directory order.
    pub fn pages(&self) -> impl Iterator<Item = (PtpHandle, &PageTablePage)> {
        self.directory
            .iter()
            .flatten()
            .map(|&h| (h, &self.pages[h]))
    }

    /// Clips `[start, end)` to the segments that have a table page, one
    /// run per segment.
    pub fn populated_runs(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Vec<(VirtualAddress, VirtualAddress)> {
        let mut runs = Vec::new();
        let mut va = start;
        while va < end {
            let next = VirtualAddress::new(next_segment(va.as_u64())).min(end);
            if self.locate(va).is_some() {
                runs.push((va, next));
            }
            va = next;
        }
        runs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
