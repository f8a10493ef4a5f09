//! State guarded by the global frame-queue lock.

use crate::frame::PageQueue;
use crate::pte::CacheAttr;
use crate::pv::{PvHandle, PvPool};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bitflags::bitflags;
use kernel_memory_addresses::FrameNumber;

bitflags! {
    /// Shadow flags kept per managed frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AFlags: u8 {
        /// Some mapping may be writable.
        const WRITEABLE = 1 << 0;
        /// A mapping was referenced since the flag was last cleared.
        const REFERENCED = 1 << 1;
    }
}

/// Per-frame machine-dependent metadata.
#[derive(Debug, Default)]
pub(crate) struct FrameMd {
    pub pv: Vec<PvHandle>,
    /// Bumped on every change to `pv`; lets a path that dropped the lock
    /// detect that the list moved under it.
    pub pv_gen: u32,
    pub aflags: AFlags,
    pub dirty: bool,
    pub queue: PageQueue,
    /// Cache policy set through `page_set_memattr`.
    pub memattr: Option<CacheAttr>,
}

pub(crate) struct PageQueues {
    pub pool: PvPool,
    md: Vec<FrameMd>,
    active: VecDeque<FrameNumber>,
    inactive: VecDeque<FrameNumber>,
}

impl PageQueues {
    pub fn new(pool: PvPool, managed_frames: usize) -> Self {
        Self {
            pool,
            md: (0..managed_frames).map(|_| FrameMd::default()).collect(),
            active: VecDeque::new(),
            inactive: VecDeque::new(),
        }
    }

    #[inline]
    pub fn md(&self, idx: usize) -> &FrameMd {
        &self.md[idx]
    }

    #[inline]
    pub fn md_mut(&mut self, idx: usize) -> &mut FrameMd {
        &mut self.md[idx]
    }

    pub fn link(&mut self, idx: usize, h: PvHandle) {
        let md = &mut self.md[idx];
        md.pv.push(h);
        md.pv_gen = md.pv_gen.wrapping_add(1);
    }

    /// # Panics
    /// If `h` is not on the frame's list.
    pub fn unlink(&mut self, idx: usize, h: PvHandle) {
        let md = &mut self.md[idx];
        let pos = md.pv.iter().position(|&x| x == h);
        let Some(pos) = pos else {
            panic!("reverse-mapping record {h:?} missing from its frame list");
        };
        md.pv.remove(pos);
        md.pv_gen = md.pv_gen.wrapping_add(1);
        if md.pv.is_empty() {
            md.aflags.remove(AFlags::WRITEABLE);
        }
    }

    /// Moves a frame to the tail of `queue`.
    pub fn set_queue(&mut self, idx: usize, frame: FrameNumber, queue: PageQueue) {
        let old = core::mem::replace(&mut self.md[idx].queue, queue);
        match old {
            PageQueue::Active => self.active.retain(|&f| f != frame),
            PageQueue::Inactive => self.inactive.retain(|&f| f != frame),
            PageQueue::None => {}
        }
        match queue {
            PageQueue::Active => self.active.push_back(frame),
            PageQueue::Inactive => self.inactive.push_back(frame),
            PageQueue::None => {}
        }
    }

    /// Frames on `queue`, head first.
    pub fn queue_frames(&self, queue: PageQueue) -> Vec<FrameNumber> {
        match queue {
            PageQueue::Active => self.active.iter().copied().collect(),
            PageQueue::Inactive => self.inactive.iter().copied().collect(),
            PageQueue::None => Vec::new(),
        }
    }
}
