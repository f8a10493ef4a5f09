//! Frame-wide operations: everything that starts from a physical frame
//! and walks its reverse-mapping list.
//!
//! These run against the lock order (frame queues first, then each
//! mapping's space), so spaces are only try-locked while the queue lock is
//! held. On contention the queue lock is dropped, both locks are taken in
//! order, and the walk resumes if the frame's list did not move meanwhile.

use crate::frame::{FrameClass, PageQueue};
use crate::pmap::CpuContext;
use crate::pte::CacheAttr;
use crate::pv::PvHandle;
use crate::queues::{AFlags, PageQueues};
use crate::space::{AddressSpace, SpaceId, SpaceTables};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::ControlFlow;
use kernel_info::memory::{DIRECT_MAP_SIZE, KSEG0_BASE};
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, VirtualAddress};

/// How many records the quick checks look at.
const QUICK_SCAN: usize = 16;

/// Upper bound on references reported by one `ts_referenced` call.
const TS_REFERENCED_MAX: usize = 5;

impl CpuContext<'_> {
    /// Calls `visit` for every mapping of a managed frame with the owning
    /// space and the frame queues locked. Each record is visited once.
    pub(crate) fn for_each_mapping(
        &self,
        frame: FrameNumber,
        mut visit: impl FnMut(&AddressSpace, &mut SpaceTables, &mut PageQueues, VirtualAddress) -> ControlFlow<()>,
    ) {
        let idx = self.pmap.frames.managed_index(frame);
        let mut visited: Vec<PvHandle> = Vec::new();
        let mut queues = self.lock_queues();

        'scan: loop {
            let pending: Vec<PvHandle> = queues
                .md(idx)
                .pv
                .iter()
                .copied()
                .filter(|h| !visited.contains(h))
                .collect();

            for h in pending {
                let Some(e) = queues.pool.get(h) else { continue };
                let (space, va) = (Arc::clone(&e.space), e.va);

                let mut tables = if let Some(t) = space.tables.try_lock() {
                    t
                } else {
                    let generation = queues.md(idx).pv_gen;
                    drop(queues);
                    let t = self.lock_space(&space);
                    queues = self.lock_queues();
                    if queues.md(idx).pv_gen != generation {
                        drop(t);
                        continue 'scan;
                    }
                    t
                };

                visited.push(h);
                let flow = visit(&*space, &mut *tables, &mut *queues, va);
                drop(tables);
                if flow.is_break() {
                    return;
                }
            }
            return;
        }
    }

    fn frame_index(&self, frame: FrameNumber) -> Option<usize> {
        match self.pmap.frames.classify(frame) {
            FrameClass::Managed(i) => Some(i),
            FrameClass::Unmanaged => None,
        }
    }

    fn frame_aflags(&self, idx: usize) -> AFlags {
        self.lock_queues().md(idx).aflags
    }

    /// Number of wired mappings of `frame`.
    #[must_use]
    pub fn page_wired_mappings(&self, frame: FrameNumber) -> usize {
        if self.frame_index(frame).is_none() {
            return 0;
        }
        let mut count = 0;
        self.for_each_mapping(frame, |_, tables, _, va| {
            if tables.table.entry(va).is_some_and(|e| e.wired()) {
                count += 1;
            }
            ControlFlow::Continue(())
        });
        count
    }

    /// Whether any mapping has written to `frame` since the last
    /// [`clear_modify`](Self::clear_modify).
    #[must_use]
    pub fn is_modified(&self, frame: FrameNumber) -> bool {
        let Some(idx) = self.frame_index(frame) else {
            return false;
        };
        if !self.frame_aflags(idx).contains(AFlags::WRITEABLE) {
            return false;
        }
        let mut modified = false;
        self.for_each_mapping(frame, |_, tables, _, va| {
            modified = tables.table.entry(va).is_some_and(|e| e.is_modified());
            if modified {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        modified
    }

    #[must_use]
    pub fn is_referenced(&self, frame: FrameNumber) -> bool {
        let Some(idx) = self.frame_index(frame) else {
            return false;
        };
        if self.frame_aflags(idx).contains(AFlags::REFERENCED) {
            return true;
        }
        let mut referenced = false;
        self.for_each_mapping(frame, |_, tables, _, va| {
            referenced = tables.table.entry(va).is_some_and(|e| e.referenced());
            if referenced {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        referenced
    }

    /// Clears the modified state of every mapping so the next store traps.
    pub fn clear_modify(&self, frame: FrameNumber) {
        let Some(idx) = self.frame_index(frame) else {
            return;
        };
        if !self.frame_aflags(idx).contains(AFlags::WRITEABLE) {
            return;
        }
        self.for_each_mapping(frame, |space, tables, _, va| {
            if let Some(e) = tables.table.entry_mut(va)
                && e.is_modified()
            {
                e.set_dirty(false);
                let pte = *e;
                self.update_page(space, va, pte);
            }
            ControlFlow::Continue(())
        });
        self.lock_queues().md_mut(idx).dirty = false;
    }

    /// Clears the referenced state of every mapping.
    pub fn clear_reference(&self, frame: FrameNumber) {
        let Some(idx) = self.frame_index(frame) else {
            return;
        };
        self.for_each_mapping(frame, |space, tables, _, va| {
            if let Some(e) = tables.table.entry_mut(va)
                && e.referenced()
            {
                e.set_referenced(false);
                self.invalidate_page(space, va);
            }
            ControlFlow::Continue(())
        });
        self.lock_queues().md_mut(idx).aflags.remove(AFlags::REFERENCED);
    }

    /// Counts and clears referenced mappings, stopping after a handful.
    ///
    /// A reference recorded on the frame itself (from a mapping that has
    /// since gone) counts as one.
    #[must_use]
    pub fn ts_referenced(&self, frame: FrameNumber) -> usize {
        let Some(idx) = self.frame_index(frame) else {
            return 0;
        };
        let mut count = 0;
        {
            let mut q = self.lock_queues();
            let md = q.md_mut(idx);
            if md.aflags.contains(AFlags::REFERENCED) {
                md.aflags.remove(AFlags::REFERENCED);
                count += 1;
            }
        }
        self.for_each_mapping(frame, |space, tables, _, va| {
            if count >= TS_REFERENCED_MAX {
                return ControlFlow::Break(());
            }
            if let Some(e) = tables.table.entry_mut(va)
                && e.referenced()
            {
                e.set_referenced(false);
                self.invalidate_page(space, va);
                count += 1;
            }
            ControlFlow::Continue(())
        });
        count.min(TS_REFERENCED_MAX)
    }

    /// Makes every mapping of `frame` read-only.
    pub fn remove_write(&self, frame: FrameNumber) {
        let Some(idx) = self.frame_index(frame) else {
            return;
        };
        if !self.frame_aflags(idx).contains(AFlags::WRITEABLE) {
            return;
        }
        self.for_each_mapping(frame, |space, tables, q, va| {
            if let Some(e) = tables.table.entry_mut(va)
                && e.is_writable()
            {
                if e.is_modified() {
                    q.md_mut(idx).dirty = true;
                }
                e.set_read_only(true);
                e.set_dirty(false);
                self.invalidate_page(space, va);
            }
            ControlFlow::Continue(())
        });
        self.lock_queues().md_mut(idx).aflags.remove(AFlags::WRITEABLE);
    }

    /// Changes the cache policy of a managed frame and every mapping of it.
    pub fn page_set_memattr(&self, frame: FrameNumber, attr: CacheAttr) {
        let Some(idx) = self.frame_index(frame) else {
            return;
        };
        let mapped = {
            let mut q = self.lock_queues();
            let md = q.md_mut(idx);
            md.memattr = Some(attr);
            !md.pv.is_empty()
        };
        if !mapped {
            return;
        }

        let pa = frame.base().as_u64();
        if pa < DIRECT_MAP_SIZE {
            self.pmap
                .cache
                .dcache_wbinv_range(VirtualAddress::new(KSEG0_BASE + pa), PAGE_SIZE);
        }
        self.for_each_mapping(frame, |space, tables, _, va| {
            if let Some(e) = tables.table.entry_mut(va)
                && e.cache_attr() != attr
            {
                e.set_cache_attr(attr);
                let pte = *e;
                self.update_page(space, va, pte);
            }
            ControlFlow::Continue(())
        });
    }

    /// Whether `space` maps `frame`, looking at no more than the first few
    /// records.
    #[must_use]
    pub fn page_exists_quick(&self, space: &AddressSpace, frame: FrameNumber) -> bool {
        let Some(idx) = self.frame_index(frame) else {
            return false;
        };
        let q = self.lock_queues();
        q.md(idx)
            .pv
            .iter()
            .take(QUICK_SCAN)
            .filter_map(|&h| q.pool.get(h))
            .any(|e| e.space.id() == space.id())
    }

    #[must_use]
    pub fn page_is_mapped(&self, frame: FrameNumber) -> bool {
        self.frame_index(frame)
            .is_some_and(|idx| !self.lock_queues().md(idx).pv.is_empty())
    }

    /// Whether at least 16 distinct spaces map `frame`.
    #[must_use]
    pub fn is_mapped_widely(&self, frame: FrameNumber) -> bool {
        let Some(idx) = self.frame_index(frame) else {
            return false;
        };
        let q = self.lock_queues();
        let pv = &q.md(idx).pv;
        if pv.len() < QUICK_SCAN {
            return false;
        }
        let spaces: BTreeSet<SpaceId> = pv
            .iter()
            .filter_map(|&h| q.pool.get(h))
            .map(|e| e.space.id())
            .collect();
        spaces.len() >= QUICK_SCAN
    }

    /// Moves a managed frame between page queues.
    pub fn set_page_queue(&self, frame: FrameNumber, queue: PageQueue) {
        if let Some(idx) = self.frame_index(frame) {
            self.lock_queues().set_queue(idx, frame, queue);
        }
    }

    /// The frame's dirty flag as maintained by modify emulation.
    #[must_use]
    pub fn is_dirty(&self, frame: FrameNumber) -> bool {
        self.frame_index(frame)
            .is_some_and(|idx| self.lock_queues().md(idx).dirty)
    }
}
