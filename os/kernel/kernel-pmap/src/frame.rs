//! Frame classification and the per-frame hold counts.
//!
//! A frame is *managed* when it belongs to pageable RAM: its mappings get
//! reverse-mapping records and its dirty/referenced state is tracked.
//! Everything else (device memory, the page-table reserve, addresses past
//! the end of RAM) is *unmanaged* and is mapped without bookkeeping.

use crate::pte::CacheAttr;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::boot::PhysRegion;
use kernel_memory_addresses::FrameNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Pageable RAM; carries the frame's dense index.
    Managed(usize),
    Unmanaged,
}

/// Page queue a managed frame sits on, owned by the page daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageQueue {
    #[default]
    None,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy)]
struct ManagedRange {
    first: FrameNumber,
    count: usize,
    base: usize,
}

/// Immutable description of physical memory plus atomic hold counts.
pub struct FrameTable {
    ram: Vec<PhysRegion>,
    managed: Vec<ManagedRange>,
    hold: Box<[AtomicU32]>,
}

impl FrameTable {
    /// Builds the table from normalized RAM regions, excluding `reserved`
    /// (the page-table frame pool) from the managed set.
    #[must_use]
    pub fn new(ram: &[PhysRegion], reserved: PhysRegion) -> Self {
        let mut managed = Vec::new();
        let mut base = 0;
        for r in ram {
            let pieces = [
                PhysRegion {
                    start: r.start,
                    end: r.end.min(reserved.start).max(r.start),
                },
                PhysRegion {
                    start: r.start.max(reserved.end).min(r.end),
                    end: r.end,
                },
            ];
            for p in pieces {
                let count = usize::try_from(p.frame_count()).unwrap_or(usize::MAX);
                if count == 0 {
                    continue;
                }
                managed.push(ManagedRange {
                    first: p.first_frame(),
                    count,
                    base,
                });
                base += count;
            }
        }

        let hold = (0..base).map(|_| AtomicU32::new(0)).collect();
        Self {
            ram: ram.to_vec(),
            managed,
            hold,
        }
    }

    /// Number of managed frames.
    #[inline]
    #[must_use]
    pub fn managed_count(&self) -> usize {
        self.hold.len()
    }

    #[must_use]
    pub fn classify(&self, frame: FrameNumber) -> FrameClass {
        let i = self.managed.partition_point(|r| r.first <= frame);
        if i == 0 {
            return FrameClass::Unmanaged;
        }
        let r = self.managed[i - 1];
        let off = frame.as_u64() - r.first.as_u64();
        match usize::try_from(off) {
            Ok(off) if off < r.count => FrameClass::Managed(r.base + off),
            _ => FrameClass::Unmanaged,
        }
    }

    /// Dense index of a frame known to be managed.
    ///
    /// # Panics
    /// If the frame is unmanaged.
    #[must_use]
    pub fn managed_index(&self, frame: FrameNumber) -> usize {
        match self.classify(frame) {
            FrameClass::Managed(i) => i,
            FrameClass::Unmanaged => panic!("{frame:?} is not a managed frame"),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_managed(&self, frame: FrameNumber) -> bool {
        matches!(self.classify(frame), FrameClass::Managed(_))
    }

    /// Whether the frame is RAM at all, managed or not.
    #[must_use]
    pub fn is_ram(&self, frame: FrameNumber) -> bool {
        self.ram.iter().any(|r| r.contains(frame.base()))
    }

    /// Cache policy used when nobody set one explicitly: RAM is cacheable,
    /// anything else is treated as a device.
    #[must_use]
    pub fn default_attr(&self, frame: FrameNumber) -> CacheAttr {
        if self.is_ram(frame) {
            CacheAttr::Cacheable
        } else {
            CacheAttr::Uncached
        }
    }

    /// Pin `frame` against reclamation. Unmanaged frames are ignored.
    pub fn hold(&self, frame: FrameNumber) {
        if let FrameClass::Managed(i) = self.classify(frame) {
            self.hold[i].fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn unhold(&self, frame: FrameNumber) {
        if let FrameClass::Managed(i) = self.classify(frame) {
            let prev = self.hold[i].fetch_sub(1, Ordering::AcqRel);
            assert!(prev > 0, "unhold of {frame:?} without a hold");
        }
    }

    #[must_use]
    pub fn hold_count(&self, frame: FrameNumber) -> u32 {
        match self.classify(frame) {
            FrameClass::Managed(i) => self.hold[i].load(Ordering::Acquire),
            FrameClass::Unmanaged => 0,
        }
    }
}
