//! Kernel-space mappings: growth of the kernel table, unmanaged kernel
//! entries (`kenter` and friends) and device mappings.

use crate::error::PmapError;
use crate::frame::FrameClass;
use crate::pmap::CpuContext;
use crate::pte::{CacheAttr, PtEntry};
use kernel_info::memory::{
    DIRECT_MAP_SIZE, KERNEL_BASE, KERNEL_MAX_ADDRESS, KSEG0_BASE, KSEG1_BASE, SEGMENT_SIZE,
    is_kernel_mapped,
};
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress, align_up};
use log::debug;

impl CpuContext<'_> {
    /// Makes sure kernel table pages cover every address below `limit`.
    ///
    /// Rounds up to a whole segment and never shrinks.
    ///
    /// # Panics
    /// When the page-table reserve runs out.
    pub fn grow_kernel(&self, limit: VirtualAddress) {
        let kernel = &self.pmap.kernel;
        let mut tables = self.lock_space(kernel);
        let limit = align_up(limit.as_u64(), SEGMENT_SIZE).min(KERNEL_MAX_ADDRESS);
        let mut va = tables.kernel_end.as_u64().max(KERNEL_BASE);
        if va >= limit {
            return;
        }
        while va < limit {
            self.pmap
                .install_kernel_segment(&mut tables.table, VirtualAddress::new(va));
            va += SEGMENT_SIZE;
        }
        tables.kernel_end = VirtualAddress::new(limit);
        debug!("grow_kernel: kernel table now ends at {:#x}", limit);
    }

    /// First kernel address not yet covered by [`grow_kernel`](Self::grow_kernel).
    #[must_use]
    pub fn kernel_end(&self) -> VirtualAddress {
        self.lock_space(&self.pmap.kernel).kernel_end
    }

    /// Maps `pa` at `va` in the kernel with the frame's cache policy.
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress) {
        let frame = pa.frame();
        let attr = match self.pmap.frames.classify(frame) {
            FrameClass::Managed(idx) => self.lock_queues().md(idx).memattr,
            FrameClass::Unmanaged => None,
        }
        .unwrap_or_else(|| self.pmap.frames.default_attr(frame));
        self.kenter_attr(va, pa, attr);
    }

    /// Maps `pa` at `va` in the kernel, valid, writable and global, without
    /// a reverse-mapping record.
    ///
    /// # Panics
    /// When `va` lies beyond the grown kernel table.
    pub fn kenter_attr(&self, va: VirtualAddress, pa: PhysicalAddress, attr: CacheAttr) {
        debug_assert!(
            va.is_page_aligned() && is_kernel_mapped(va.as_u64()),
            "kenter: bad kernel address {va}"
        );
        let kernel = &self.pmap.kernel;
        let mut tables = self.lock_space(kernel);
        let new = kernel_pte(pa.frame(), attr);
        let Some(e) = tables.table.entry_mut(va) else {
            panic!("kenter: {va} is beyond the kernel table");
        };
        let old = core::mem::replace(e, new);
        if old.valid() && old != new {
            self.update_page(kernel, va, new);
        }
    }

    /// Removes a mapping made with [`kenter`](Self::kenter).
    pub fn kremove(&self, va: VirtualAddress) {
        let kernel = &self.pmap.kernel;
        let mut tables = self.lock_space(kernel);
        let Some(e) = tables.table.entry_mut(va) else {
            return;
        };
        if e.valid() {
            self.pmap.cache.dcache_wbinv_range(va, PAGE_SIZE);
        }
        *e = PtEntry::invalid_global();
        self.invalidate_page(kernel, va);
    }

    /// Maps `frames` at consecutive pages starting at `va`, invalidating
    /// the range once.
    pub fn qenter(&self, va: VirtualAddress, frames: &[FrameNumber]) {
        let attrs: alloc::vec::Vec<CacheAttr> = {
            let q = self.lock_queues();
            frames
                .iter()
                .map(|&f| match self.pmap.frames.classify(f) {
                    FrameClass::Managed(idx) => q.md(idx).memattr,
                    FrameClass::Unmanaged => None,
                }
                .unwrap_or_else(|| self.pmap.frames.default_attr(f)))
                .collect()
        };

        let kernel = &self.pmap.kernel;
        let mut tables = self.lock_space(kernel);
        let mut cur = va;
        for (&frame, &attr) in frames.iter().zip(&attrs) {
            let Some(e) = tables.table.entry_mut(cur) else {
                panic!("qenter: {cur} is beyond the kernel table");
            };
            *e = kernel_pte(frame, attr);
            cur += PAGE_SIZE;
        }
        self.invalidate_range(kernel, va, cur);
    }

    /// Undoes [`qenter`](Self::qenter) for `count` pages.
    pub fn qremove(&self, va: VirtualAddress, count: usize) {
        let kernel = &self.pmap.kernel;
        let mut tables = self.lock_space(kernel);
        let mut cur = va;
        for _ in 0..count {
            if let Some(e) = tables.table.entry_mut(cur) {
                *e = PtEntry::invalid_global();
            }
            cur += PAGE_SIZE;
        }
        self.invalidate_range(kernel, va, cur);
    }

    /// Switches every valid kernel mapping in `[va, va + size)` to `attr`,
    /// then writes back and invalidates the data cache over the range.
    ///
    /// Unmapped pages are skipped.
    ///
    /// # Errors
    /// [`PmapError::OutsideKernel`] unless the range lies within the kernel
    /// map below the window area.
    pub fn change_attr(&self, va: VirtualAddress, size: u64, attr: CacheAttr) -> Result<(), PmapError> {
        let raw = va.as_u64();
        let Some(end) = raw
            .checked_add(size)
            .filter(|&end| is_kernel_mapped(raw) && end <= KERNEL_MAX_ADDRESS)
        else {
            return Err(PmapError::OutsideKernel(va));
        };
        let start = va.page_base();
        let end = VirtualAddress::new(align_up(end, PAGE_SIZE));

        let kernel = &self.pmap.kernel;
        {
            let mut tables = self.lock_space(kernel);
            for (seg_start, seg_end) in tables.table.populated_runs(start, end) {
                let mut run: Option<(VirtualAddress, VirtualAddress)> = None;
                let mut cur = seg_start;
                while cur < seg_end {
                    if let Some(e) = tables.table.entry_mut(cur)
                        && e.valid()
                        && e.cache_attr() != attr
                    {
                        e.set_cache_attr(attr);
                        run = Some((run.map_or(cur, |r| r.0), cur + PAGE_SIZE));
                    } else if let Some((a, b)) = run.take() {
                        self.invalidate_range(kernel, a, b);
                    }
                    cur += PAGE_SIZE;
                }
                if let Some((a, b)) = run {
                    self.invalidate_range(kernel, a, b);
                }
            }
        }

        self.pmap.cache.dcache_wbinv_range(va, size);
        debug!("change_attr {va} +{size:#x} -> {attr:?}");
        Ok(())
    }

    /// Physical address behind a kernel virtual address.
    #[must_use]
    pub fn kextract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let raw = va.as_u64();
        if (KSEG0_BASE..KERNEL_BASE).contains(&raw) {
            return Some(PhysicalAddress::new((raw - KSEG0_BASE) % DIRECT_MAP_SIZE));
        }
        if !is_kernel_mapped(raw) {
            return None;
        }
        let tables = self.lock_space(&self.pmap.kernel);
        let e = tables.table.entry(va.page_base()).filter(|e| e.valid())?;
        Some(e.frame().base() + va.page_offset())
    }

    /// Uncached access to device memory through the direct segment.
    ///
    /// # Errors
    /// [`PmapError::OutOfReach`] if the range is not below the direct-map
    /// limit.
    #[allow(clippy::unused_self)]
    pub fn mapdev(&self, pa: PhysicalAddress, size: u64) -> Result<VirtualAddress, PmapError> {
        match pa.as_u64().checked_add(size) {
            Some(end) if end <= DIRECT_MAP_SIZE => Ok(VirtualAddress::new(KSEG1_BASE + pa.as_u64())),
            _ => Err(PmapError::OutOfReach(pa)),
        }
    }

    /// Releases a [`mapdev`](Self::mapdev) mapping; the direct segment
    /// needs no teardown.
    #[allow(clippy::unused_self)]
    pub fn unmapdev(&self, va: VirtualAddress, size: u64) {
        debug_assert!(
            va.as_u64() >= KSEG1_BASE && va.as_u64() + size <= KSEG1_BASE + DIRECT_MAP_SIZE,
            "unmapdev: {va} was not handed out by mapdev"
        );
    }
}

fn kernel_pte(frame: FrameNumber, attr: CacheAttr) -> PtEntry {
    PtEntry::new()
        .with_valid(true)
        .with_dirty(true)
        .with_global(true)
        .with_referenced(true)
        .with_frame(frame)
        .with_cache_attr(attr)
}
