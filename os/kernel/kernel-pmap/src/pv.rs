//! Reverse-mapping records and the pool they come from.
//!
//! Every valid translation of a managed frame owns exactly one [`PvEntry`].
//! The records live in a fixed-capacity arena and are indexed twice: by
//! virtual address in the owning space ([`SpaceTables::pv`]) and by frame
//! in the frame metadata ([`FrameMd::pv`]).
//!
//! When the arena is full, [`CpuContext::get_pv_entry`] steals a record by
//! tearing down one unwired mapping of an idle frame, in the order a
//! [`VictimSelector`] prescribes.
//!
//! [`SpaceTables::pv`]: crate::space::SpaceTables
//! [`FrameMd::pv`]: crate::queues::FrameMd

use crate::arena::{Arena, Handle};
use crate::error::PmapError;
use crate::frame::{FrameClass, PageQueue};
use crate::pmap::CpuContext;
use crate::queues::PageQueues;
use crate::space::{AddressSpace, SpaceTables};
use crate::table::PtpHandle;
use alloc::sync::Arc;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use log::{debug, warn};

pub(crate) struct PvEntry {
    pub space: Arc<AddressSpace>,
    pub va: VirtualAddress,
    /// Page-table page holding the translation; `None` in the kernel space.
    pub ptp: Option<PtpHandle>,
    pub frame: FrameNumber,
}

pub(crate) type PvHandle = Handle<PvEntry>;

/// Counters describing the record pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PvStats {
    pub capacity: usize,
    pub in_use: usize,
    pub high_water: usize,
    /// Mappings torn down to recycle their record.
    pub reclaimed: u64,
}

pub(crate) struct PvPool {
    arena: Arena<PvEntry>,
    high_water: usize,
    above_high_water: bool,
    reclaimed: u64,
}

impl PvPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: Arena::with_limit(capacity),
            high_water: 9 * (capacity / 10),
            above_high_water: false,
            reclaimed: 0,
        }
    }

    pub fn insert(&mut self, entry: PvEntry) -> Result<PvHandle, PvEntry> {
        let h = self.arena.insert(entry)?;
        if !self.above_high_water && self.arena.len() > self.high_water {
            self.above_high_water = true;
            debug!(
                "pv pool above high water: {}/{} records",
                self.arena.len(),
                self.arena.limit()
            );
        }
        Ok(h)
    }

    /// # Panics
    /// If `h` does not name a live record.
    pub fn remove(&mut self, h: PvHandle) -> PvEntry {
        let e = self
            .arena
            .remove(h)
            .unwrap_or_else(|| panic!("stale reverse-mapping handle {h:?}"));
        if self.above_high_water && self.arena.len() <= self.high_water {
            self.above_high_water = false;
        }
        e
    }

    #[inline]
    pub fn get(&self, h: PvHandle) -> Option<&PvEntry> {
        self.arena.get(h)
    }

    #[inline]
    pub fn get_mut(&mut self, h: PvHandle) -> Option<&mut PvEntry> {
        self.arena.get_mut(h)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PvHandle, &PvEntry)> {
        self.arena.iter()
    }

    pub fn stats(&self) -> PvStats {
        PvStats {
            capacity: self.arena.limit(),
            in_use: self.arena.len(),
            high_water: self.high_water,
            reclaimed: self.reclaimed,
        }
    }
}

/// Chooses which frames reclamation may steal mappings from, and in what
/// order.
pub trait VictimSelector: Send + Sync {
    /// Queues to scan, first to last.
    fn scan_order(&self) -> &[PageQueue];

    /// Whether a frame with `hold` outstanding holds may lose a mapping.
    fn is_candidate(&self, frame: FrameNumber, hold: u32) -> bool {
        let _ = frame;
        hold == 0
    }
}

/// Inactive frames first, then active ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct InactiveFirst;

impl VictimSelector for InactiveFirst {
    fn scan_order(&self) -> &[PageQueue] {
        &[PageQueue::Inactive, PageQueue::Active]
    }
}

impl CpuContext<'_> {
    /// Stores `entry`, reclaiming a record if the pool is full.
    ///
    /// `space` and `tables` are the caller's locked space; any other space
    /// is only ever try-locked.
    pub(crate) fn get_pv_entry(
        &self,
        space: &AddressSpace,
        tables: &mut SpaceTables,
        q: &mut PageQueues,
        entry: PvEntry,
        nosleep: bool,
    ) -> Result<PvHandle, PmapError> {
        let entry = match q.pool.insert(entry) {
            Ok(h) => return Ok(h),
            Err(entry) => entry,
        };

        if self.reclaim_one(space, tables, q)
            && let Ok(h) = q.pool.insert(entry)
        {
            return Ok(h);
        }

        if nosleep {
            warn!("pv pool exhausted, nothing reclaimable");
            return Err(PmapError::ResourceShortage);
        }
        panic!("reverse-mapping pool exhausted and no mapping can be reclaimed");
    }

    fn reclaim_one(&self, space: &AddressSpace, tables: &mut SpaceTables, q: &mut PageQueues) -> bool {
        let victims = &*self.pmap.victims;
        for &queue in victims.scan_order() {
            for frame in q.queue_frames(queue) {
                if !victims.is_candidate(frame, self.pmap.frames.hold_count(frame)) {
                    continue;
                }
                let FrameClass::Managed(idx) = self.pmap.frames.classify(frame) else {
                    continue;
                };

                for h in q.md(idx).pv.clone() {
                    let Some(e) = q.pool.get(h) else { continue };
                    let (owner, va) = (Arc::clone(&e.space), e.va);

                    let reclaimed = if owner.id() == space.id() {
                        self.reclaim_mapping(space, tables, q, va)
                    } else if let Some(mut guard) = owner.tables.try_lock() {
                        self.reclaim_mapping(&owner, &mut guard, q, va)
                    } else {
                        continue;
                    };

                    if reclaimed {
                        q.pool.reclaimed += 1;
                        warn!("reclaimed {va} of {:?} (frame {frame:?})", owner.id());
                        return true;
                    }
                }
            }
        }
        false
    }

    fn reclaim_mapping(
        &self,
        space: &AddressSpace,
        tables: &mut SpaceTables,
        q: &mut PageQueues,
        va: VirtualAddress,
    ) -> bool {
        match tables.table.entry(va) {
            Some(e) if e.valid() && !e.wired() => {}
            _ => return false,
        }
        self.pmap.remove_pte(space, tables, q, va);
        self.invalidate_page(space, va);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmapConfig;
    use crate::pmap::Pmap;
    use crate::prot::{EnterFlags, Protection};
    use kernel_info::boot::PhysRegion;

    fn pmap_with_records(records: usize) -> Pmap {
        let config = PmapConfig {
            pv_capacity: Some(records),
            ..PmapConfig::default()
        };
        Pmap::bootstrap(config, &[PhysRegion::new(0, 0x0100_0000)]).unwrap()
    }

    #[test]
    fn reclamation_skips_a_locked_foreign_space() {
        let pmap = pmap_with_records(2);
        let cpu = pmap.cpu(0);
        let (busy, idle, caller) = (pmap.create(), pmap.create(), pmap.create());
        let va = VirtualAddress::new(0x1000);
        let (f_busy, f_idle, f_new) = (FrameNumber::new(0x100), FrameNumber::new(0x101), FrameNumber::new(0x102));

        cpu.enter(&busy, va, f_busy, Protection::RW, EnterFlags::empty()).unwrap();
        cpu.enter(&idle, va, f_idle, Protection::RW, EnterFlags::empty()).unwrap();
        // The busy space's frame is the first candidate in scan order.
        cpu.set_page_queue(f_busy, PageQueue::Inactive);
        cpu.set_page_queue(f_idle, PageQueue::Active);

        {
            let _held = busy.tables.lock();
            cpu.enter(&caller, va, f_new, Protection::RW, EnterFlags::NOSLEEP)
                .unwrap();
        }

        assert_eq!(cpu.extract(&busy, va), Some(f_busy));
        assert_eq!(cpu.extract(&idle, va), None);
        assert_eq!(cpu.extract(&caller, va), Some(f_new));
        assert_eq!(idle.resident_count(), 0);
        assert_eq!(cpu.pv_stats().reclaimed, 1);
        cpu.audit(&[&busy, &idle, &caller]).unwrap();
    }

    #[test]
    fn nothing_reclaimable_outside_a_locked_space() {
        let pmap = pmap_with_records(1);
        let cpu = pmap.cpu(0);
        let (busy, caller) = (pmap.create(), pmap.create());
        let va = VirtualAddress::new(0x1000);
        cpu.enter(&busy, va, FrameNumber::new(0x100), Protection::RW, EnterFlags::empty())
            .unwrap();
        cpu.set_page_queue(FrameNumber::new(0x100), PageQueue::Inactive);

        let res = {
            let _held = busy.tables.lock();
            cpu.enter(&caller, va, FrameNumber::new(0x101), Protection::RW, EnterFlags::NOSLEEP)
        };
        assert_eq!(res, Err(PmapError::ResourceShortage));
        assert_eq!(cpu.extract(&busy, va), Some(FrameNumber::new(0x100)));
        assert_eq!(caller.resident_count(), 0);
        cpu.audit(&[&busy, &caller]).unwrap();
    }
}
