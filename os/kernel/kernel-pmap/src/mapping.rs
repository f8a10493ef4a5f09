//! Installing, changing and removing translations.

use crate::error::PmapError;
use crate::frame::FrameClass;
use crate::pmap::CpuContext;
use crate::prot::{EnterFlags, Mincore, Protection};
use crate::pte::{PtEntry, init_pte_prot};
use crate::ptp;
use crate::pv::PvEntry;
use crate::queues::AFlags;
use crate::space::{AddressSpace, SpaceTables};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;
use kernel_info::memory::KERNEL_ASID;
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, VirtualAddress};
use log::{debug, trace};

fn debug_check_range(start: VirtualAddress, end: VirtualAddress) {
    debug_assert!(
        start.is_page_aligned() && end.is_page_aligned() && start <= end,
        "bad range {start}..{end}"
    );
}

impl CpuContext<'_> {
    /// Maps `va` to `frame` in `space`.
    ///
    /// Re-entering the frame already mapped at `va` only changes
    /// protection and wiring. Replacing a different frame moves the
    /// reverse-mapping record over and invalidates the old translation.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] when a table page or record is
    /// unavailable and `flags` contains [`EnterFlags::NOSLEEP`]. Nothing is
    /// changed in that case.
    ///
    /// # Panics
    /// On exhaustion without `NOSLEEP`, and when a kernel VA lies beyond the
    /// grown kernel table.
    pub fn enter(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        frame: FrameNumber,
        prot: Protection,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        debug_assert!(va.is_page_aligned(), "enter: unaligned {va}");
        debug_assert!(space.covers(va), "enter: {va} outside {:?}", space.id());

        let nosleep = flags.contains(EnterFlags::NOSLEEP);
        let class = self.pmap.frames.classify(frame);
        let managed = matches!(class, FrameClass::Managed(_));

        let mut guard = self.lock_space(space);
        let tables = &mut *guard;
        debug_assert!(!tables.released, "enter into released {:?}", space.id());

        let table_page = if space.is_kernel() {
            None
        } else {
            Some(ptp::allocate(&mut tables.table, va, &self.pmap.slab, nosleep)?)
        };
        let mut queues = self.lock_queues();
        let q = &mut *queues;

        let Some(old) = tables.table.entry(va) else {
            panic!("enter: {va} is beyond the kernel table");
        };
        let remap = old.valid() && old.frame() == frame;

        // Take a record before touching anything so a shortage leaves the
        // table as it was.
        let mut fresh = None;
        if managed && !remap && !old.managed() {
            let entry = PvEntry {
                space: Arc::clone(space),
                va,
                ptp: table_page,
                frame,
            };
            match self.get_pv_entry(space, tables, q, entry, nosleep) {
                Ok(h) => fresh = Some(h),
                Err(e) => {
                    if let Some(h) = table_page {
                        ptp::release(&mut tables.table, h, &self.pmap.slab);
                    }
                    return Err(e);
                }
            }
        }

        let attr = match class {
            FrameClass::Managed(idx) => q.md(idx).memattr,
            FrameClass::Unmanaged => None,
        }
        .unwrap_or_else(|| self.pmap.frames.default_attr(frame));

        let mut new = init_pte_prot(managed, flags.access(), prot)
            .with_frame(frame)
            .with_cache_attr(attr)
            .with_referenced(true)
            .with_wired(flags.contains(EnterFlags::WIRED))
            .with_global(space.is_kernel());

        if remap {
            match (new.wired(), old.wired()) {
                (true, false) => space.wired_inc(),
                (false, true) => space.wired_dec(),
                _ => {}
            }
            if let Some(h) = table_page {
                let freed = ptp::release(&mut tables.table, h, &self.pmap.slab);
                assert!(!freed, "enter: {va} lost its table page reference");
            }
            if old.managed() {
                new.set_managed(true);
                if new.is_writable() {
                    q.md_mut(self.pmap.frames.managed_index(frame)).aflags |= AFlags::WRITEABLE;
                }
            }
            if new.is_writable() && old.dirty() {
                new.set_dirty(true);
            }
        } else {
            let mut reused = None;
            if old.valid() {
                if old.wired() {
                    space.wired_dec();
                }
                if old.managed() {
                    let Some(h) = tables.pv.remove(&va) else {
                        panic!("missing reverse-mapping record for {va} in {:?}", space.id());
                    };
                    q.unlink(self.pmap.frames.managed_index(old.frame()), h);
                    reused = Some(h);
                }
                if let Some(h) = table_page {
                    ptp::release(&mut tables.table, h, &self.pmap.slab);
                }
            } else {
                space.resident_inc();
            }

            if let FrameClass::Managed(idx) = class {
                new.set_managed(true);
                let h = if let Some(h) = reused {
                    if let Some(e) = q.pool.get_mut(h) {
                        e.frame = frame;
                        e.ptp = table_page;
                    }
                    h
                } else if let Some(h) = fresh {
                    h
                } else {
                    unreachable!("managed mapping without a record");
                };
                q.link(idx, h);
                tables.pv.insert(va, h);
                if new.is_writable() {
                    q.md_mut(idx).aflags |= AFlags::WRITEABLE;
                }
            } else if let Some(h) = reused {
                q.pool.remove(h);
            }

            if new.wired() {
                space.wired_inc();
            }
        }

        if old.valid() {
            if old != new {
                if let Some(e) = tables.table.entry_mut(va) {
                    *e = new;
                }
                if old.managed() {
                    let md = q.md_mut(self.pmap.frames.managed_index(old.frame()));
                    if old.referenced() {
                        md.aflags |= AFlags::REFERENCED;
                    }
                    if old.is_modified() {
                        md.dirty = true;
                    }
                }
                self.invalidate_page(space, va);
            }
        } else if let Some(e) = tables.table.entry_mut(va) {
            *e = new;
        }

        trace!("enter {:?} {va} -> {frame:?} {prot:?}", space.id());

        if !space.is_kernel() && prot.contains(Protection::EXECUTE) && self.is_current(space) {
            self.pmap.cache.icache_sync_range(va, PAGE_SIZE);
            self.pmap.cache.dcache_wbinv_range(va, PAGE_SIZE);
        }
        Ok(())
    }

    /// Prefault path: maps `frame` read-only at `va` if the slot is empty.
    ///
    /// Never replaces a valid entry and never reclaims; returns whether a
    /// mapping was made. A missing table page is fabricated only if a
    /// frame is at hand.
    pub fn enter_quick(
        &self,
        space: &Arc<AddressSpace>,
        va: VirtualAddress,
        frame: FrameNumber,
        prot: Protection,
    ) -> bool {
        debug_assert!(va.is_page_aligned(), "enter_quick: unaligned {va}");
        debug_assert!(space.covers(va), "enter_quick: {va} outside {:?}", space.id());
        let mut guard = self.lock_space(space);
        self.enter_quick_locked(space, &mut guard, va, frame, prot)
    }

    /// Prefaults a run of pages: `pages[i]`, when present, goes to
    /// `start + i` pages. Stops at `end`. Returns how many were mapped.
    pub fn enter_object(
        &self,
        space: &Arc<AddressSpace>,
        start: VirtualAddress,
        end: VirtualAddress,
        pages: &[Option<FrameNumber>],
        prot: Protection,
    ) -> usize {
        debug_check_range(start, end);
        let mut guard = self.lock_space(space);
        let mut mapped = 0;
        let mut va = start;
        for &page in pages {
            if va >= end {
                break;
            }
            if let Some(frame) = page
                && self.enter_quick_locked(space, &mut guard, va, frame, prot)
            {
                mapped += 1;
            }
            va += PAGE_SIZE;
        }
        mapped
    }

    fn enter_quick_locked(
        &self,
        space: &Arc<AddressSpace>,
        tables: &mut SpaceTables,
        va: VirtualAddress,
        frame: FrameNumber,
        prot: Protection,
    ) -> bool {
        debug_assert!(!tables.released, "enter_quick into released {:?}", space.id());
        if prot.is_empty() {
            return false;
        }

        let table_page = if space.is_kernel() {
            None
        } else {
            match ptp::allocate(&mut tables.table, va, &self.pmap.slab, true) {
                Ok(h) => Some(h),
                Err(_) => return false,
            }
        };
        let drop_table_ref = |tables: &mut SpaceTables| {
            if let Some(h) = table_page {
                ptp::release(&mut tables.table, h, &self.pmap.slab);
            }
        };

        if tables.table.entry(va).is_none_or(|e| e.valid()) {
            drop_table_ref(tables);
            return false;
        }

        let class = self.pmap.frames.classify(frame);
        let mut q = self.lock_queues();
        let attr = match class {
            FrameClass::Managed(idx) => q.md(idx).memattr,
            FrameClass::Unmanaged => None,
        }
        .unwrap_or_else(|| self.pmap.frames.default_attr(frame));

        let mut new = PtEntry::new()
            .with_valid(true)
            .with_read_only(true)
            .with_frame(frame)
            .with_cache_attr(attr);

        if let FrameClass::Managed(idx) = class {
            let entry = PvEntry {
                space: Arc::clone(space),
                va,
                ptp: table_page,
                frame,
            };
            let Ok(h) = q.pool.insert(entry) else {
                drop(q);
                drop_table_ref(tables);
                trace!("enter_quick {:?} {va}: no free record", space.id());
                return false;
            };
            q.link(idx, h);
            tables.pv.insert(va, h);
            new.set_managed(true);
        }
        drop(q);

        if space.is_kernel() {
            new = new.with_global(true).with_referenced(true);
        }
        if let Some(e) = tables.table.entry_mut(va) {
            *e = new;
        }
        space.resident_inc();
        trace!("enter_quick {:?} {va} -> {frame:?}", space.id());

        if !space.is_kernel() && prot.contains(Protection::EXECUTE) && self.is_current(space) {
            self.pmap.cache.icache_sync_range(va, PAGE_SIZE);
            self.pmap.cache.dcache_wbinv_range(va, PAGE_SIZE);
        }
        true
    }

    /// Removes every translation in `[start, end)`.
    pub fn remove(&self, space: &AddressSpace, start: VirtualAddress, end: VirtualAddress) {
        debug_check_range(start, end);

        let mut guard = self.lock_space(space);
        if space.resident_count() == 0 {
            return;
        }
        let mut queues = self.lock_queues();
        let (tables, q) = (&mut *guard, &mut *queues);

        if start + PAGE_SIZE == end {
            if self.pmap.remove_pte(space, tables, q, start).is_some() {
                self.invalidate_page(space, start);
            }
            return;
        }

        for (seg_start, seg_end) in tables.table.populated_runs(start, end) {
            if space.resident_count() == 0 {
                break;
            }
            let mut run: Option<(VirtualAddress, VirtualAddress)> = None;
            let mut va = seg_start;
            // The table page goes away with its last entry.
            while va < seg_end && tables.table.locate(va).is_some() {
                if self.pmap.remove_pte(space, tables, q, va).is_some() {
                    run = Some((run.map_or(va, |r| r.0), va + PAGE_SIZE));
                }
                va += PAGE_SIZE;
            }
            if let Some((a, b)) = run {
                self.invalidate_range(space, a, b);
            }
        }
    }

    /// Tears down every mapping of a managed frame.
    pub fn remove_all(&self, frame: FrameNumber) {
        debug_assert!(self.pmap.frames.is_managed(frame), "remove_all: {frame:?} is unmanaged");
        if !self.pmap.frames.is_managed(frame) {
            return;
        }
        let idx = self.pmap.frames.managed_index(frame);

        self.for_each_mapping(frame, |space, tables, q, va| {
            if q.md(idx).pv.len() == 1 {
                self.pmap.cache.dcache_wbinv_range(va, PAGE_SIZE);
            }
            let old = self.pmap.remove_pte(space, tables, q, va);
            assert!(old.is_some(), "record for {va} in {:?} without a valid entry", space.id());
            self.invalidate_page(space, va);
            ControlFlow::Continue(())
        });
    }

    /// Narrows the protection of `[start, end)`.
    ///
    /// Dropping read removes the range; keeping write changes nothing.
    pub fn protect(&self, space: &AddressSpace, start: VirtualAddress, end: VirtualAddress, prot: Protection) {
        debug_check_range(start, end);
        if !prot.contains(Protection::READ) {
            self.remove(space, start, end);
            return;
        }
        if prot.contains(Protection::WRITE) {
            return;
        }

        let mut guard = self.lock_space(space);
        let mut queues = self.lock_queues();
        let (tables, q) = (&mut *guard, &mut *queues);

        for (seg_start, seg_end) in tables.table.populated_runs(start, end) {
            let mut run: Option<(VirtualAddress, VirtualAddress)> = None;
            let mut va = seg_start;
            while va < seg_end {
                if let Some(e) = tables.table.entry_mut(va)
                    && e.valid()
                    && e.is_writable()
                {
                    let old = *e;
                    e.set_read_only(true);
                    e.set_dirty(false);
                    if old.managed() && old.is_modified() {
                        q.md_mut(self.pmap.frames.managed_index(old.frame())).dirty = true;
                    }
                    run = Some((run.map_or(va, |r| r.0), va + PAGE_SIZE));
                }
                va += PAGE_SIZE;
            }
            if let Some((a, b)) = run {
                self.invalidate_range(space, a, b);
            }
        }
    }

    /// The frame mapped at `va`, if any.
    #[must_use]
    pub fn extract(&self, space: &AddressSpace, va: VirtualAddress) -> Option<FrameNumber> {
        let guard = self.lock_space(space);
        guard
            .table
            .entry(va.page_base())
            .filter(|e| e.valid())
            .map(PtEntry::frame)
    }

    /// Like [`extract`](Self::extract), but also requires the mapping to
    /// allow `prot` and holds the frame before returning it.
    #[must_use]
    pub fn extract_and_hold(&self, space: &AddressSpace, va: VirtualAddress, prot: Protection) -> Option<FrameNumber> {
        let guard = self.lock_space(space);
        let e = guard.table.entry(va.page_base()).filter(|e| e.valid())?;
        if prot.contains(Protection::WRITE) && !e.is_writable() {
            return None;
        }
        self.pmap.frames.hold(e.frame());
        Some(e.frame())
    }

    /// Sets or clears the wired bit of one valid mapping. Software-only.
    pub fn change_wiring(&self, space: &AddressSpace, va: VirtualAddress, wired: bool) {
        let mut guard = self.lock_space(space);
        let e = guard.table.entry_mut(va).filter(|e| e.valid());
        debug_assert!(e.is_some(), "change_wiring: no valid mapping at {va}");
        let Some(e) = e else { return };
        if e.wired() != wired {
            if wired {
                space.wired_inc();
            } else {
                space.wired_dec();
            }
            e.set_wired(wired);
        }
    }

    /// Clears the wired bit of every valid mapping in `[start, end)`.
    ///
    /// # Panics
    /// If a valid mapping in the range is not wired.
    pub fn unwire(&self, space: &AddressSpace, start: VirtualAddress, end: VirtualAddress) {
        debug_check_range(start, end);
        let mut guard = self.lock_space(space);
        let table = &mut guard.table;
        for (seg_start, seg_end) in table.populated_runs(start, end) {
            let mut va = seg_start;
            while va < seg_end {
                if let Some(e) = table.entry_mut(va)
                    && e.valid()
                {
                    assert!(e.wired(), "unwire: {va} in {:?} is not wired", space.id());
                    e.set_wired(false);
                    space.wired_dec();
                }
                va += PAGE_SIZE;
            }
        }
    }

    /// Process teardown: removes every unwired managed mapping, then
    /// invalidates the whole space once.
    pub fn remove_pages(&self, space: &AddressSpace) {
        debug_assert!(!space.is_kernel(), "remove_pages on the kernel space");
        let mut guard = self.lock_space(space);
        let mut queues = self.lock_queues();
        let (tables, q) = (&mut *guard, &mut *queues);

        let vas: Vec<VirtualAddress> = tables.pv.keys().copied().collect();
        let mut removed = 0_usize;
        for va in vas {
            if tables.table.entry(va).is_some_and(|e| e.wired()) {
                continue;
            }
            if self.pmap.remove_pte(space, tables, q, va).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            self.invalidate_all(space);
        }
        debug!("remove_pages {:?}: {removed} mappings", space.id());
    }

    /// Whether a fault-ahead may map `va`: its table page exists and the
    /// slot is empty.
    #[must_use]
    pub fn is_prefaultable(&self, space: &AddressSpace, va: VirtualAddress) -> bool {
        let guard = self.lock_space(space);
        let empty = guard.table.empty_entry();
        guard.table.entry(va).is_some_and(|e| e == empty)
    }

    /// Whether `va` is resident in `space`, and whether it was referenced
    /// or modified.
    #[must_use]
    pub fn mincore(&self, space: &AddressSpace, va: VirtualAddress) -> Mincore {
        let guard = self.lock_space(space);
        let Some(e) = guard.table.entry(va.page_base()).filter(|e| e.valid()) else {
            return Mincore::empty();
        };

        let mut val = Mincore::INCORE;
        if e.is_modified() {
            val |= Mincore::MODIFIED | Mincore::MODIFIED_OTHER;
        }
        if e.referenced() {
            val |= Mincore::REFERENCED | Mincore::REFERENCED_OTHER;
        }
        if e.managed() && !val.contains(Mincore::MODIFIED_OTHER | Mincore::REFERENCED_OTHER) {
            let q = self.lock_queues();
            let md = q.md(self.pmap.frames.managed_index(e.frame()));
            if md.dirty {
                val |= Mincore::MODIFIED_OTHER;
            }
            if md.aflags.contains(AFlags::REFERENCED) {
                val |= Mincore::REFERENCED_OTHER;
            }
        }
        val
    }

    /// Returns a dead space's directory frame and forgets its tags.
    ///
    /// # Panics
    /// If the space still has resident mappings or table pages, or is the
    /// kernel space.
    pub fn release(&self, space: &AddressSpace) {
        assert!(!space.is_kernel(), "the kernel space is never released");
        let mut guard = self.lock_space(space);
        assert_eq!(
            space.resident_count(),
            0,
            "releasing {:?} with resident mappings",
            space.id()
        );
        assert!(guard.table.is_empty(), "releasing {:?} with table pages", space.id());
        debug_assert!(!guard.released, "{:?} released twice", space.id());

        self.invalidate_all(space);
        guard.released = true;
        if let Some(dir) = guard.directory.take() {
            self.pmap.slab.lock().give(dir);
        }
        debug!("pmap: released {:?}", space.id());
    }

    /// Modify-trap handler: the first store through a writable mapping.
    ///
    /// # Errors
    /// [`PmapError::Unmapped`] without a valid mapping,
    /// [`PmapError::ProtectionFault`] for a read-only one.
    pub fn emulate_modified(&self, space: &AddressSpace, va: VirtualAddress) -> Result<(), PmapError> {
        let va = va.page_base();
        let mut guard = self.lock_space(space);
        let e = guard
            .table
            .entry_mut(va)
            .filter(|e| e.valid())
            .ok_or(PmapError::Unmapped(va))?;
        if e.read_only() {
            return Err(PmapError::ProtectionFault(va));
        }
        e.set_dirty(true);
        e.set_referenced(true);
        let pte = *e;

        if pte.managed() {
            let mut q = self.lock_queues();
            let md = q.md_mut(self.pmap.frames.managed_index(pte.frame()));
            md.dirty = true;
            md.aflags |= AFlags::REFERENCED;
        }
        self.cpu.tlb.lock().update(va, self.local_asid(space), pte);
        Ok(())
    }

    /// Reference-trap handler: sets the software referenced bit.
    ///
    /// # Errors
    /// [`PmapError::Unmapped`] without a valid mapping.
    pub fn emulate_referenced(&self, space: &AddressSpace, va: VirtualAddress) -> Result<(), PmapError> {
        let va = va.page_base();
        let mut guard = self.lock_space(space);
        let e = guard
            .table
            .entry_mut(va)
            .filter(|e| e.valid())
            .ok_or(PmapError::Unmapped(va))?;
        e.set_referenced(true);
        let pte = *e;
        self.cpu.tlb.lock().update(va, self.local_asid(space), pte);
        Ok(())
    }

    fn local_asid(&self, space: &AddressSpace) -> u16 {
        if space.is_kernel() {
            KERNEL_ASID
        } else {
            space.asid_on(self.id()).0.0
        }
    }
}
