//! Scoped per-CPU windows onto physical memory.
//!
//! Frames below the direct-map limit are reached through `kseg0`. Anything
//! higher borrows one of this CPU's window slots for the lifetime of a
//! [`PhysWindow`]; the slot is a kernel VA whose translation is only ever
//! loaded into this CPU's TLB.

use crate::pmap::CpuContext;
use crate::pte::{CacheAttr, PtEntry};
use crate::smp::TlbAction;
use kernel_info::memory::{DIRECT_MAP_SIZE, KERNEL_ASID, KSEG0_BASE, WINDOW_BASE, WINDOW_SLOTS};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::CriticalGuard;

/// A temporary kernel mapping of one physical page.
///
/// Runs inside this CPU's critical section. Dropping it unmaps the slot.
pub struct PhysWindow<'p> {
    ctx: CpuContext<'p>,
    va: VirtualAddress,
    slot: Option<usize>,
    _cs: CriticalGuard<'p>,
}

impl PhysWindow<'_> {
    /// Kernel address of the mapped page, offset included.
    #[inline]
    #[must_use]
    pub const fn va(&self) -> VirtualAddress {
        self.va
    }

    /// Whether the mapping uses a window slot rather than the direct map.
    #[inline]
    #[must_use]
    pub const fn is_windowed(&self) -> bool {
        self.slot.is_some()
    }
}

impl Drop for PhysWindow<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot else { return };
        let ctx = self.ctx;
        let page = self.va.page_base();
        debug_assert!(ctx.cpu.critical.is_active(), "{:?}: window released with interrupts on", ctx.id());
        {
            let mut tables = ctx.lock_space(&ctx.pmap.kernel);
            if let Some(e) = tables.table.entry_mut(page) {
                *e = PtEntry::invalid_global();
            }
            TlbAction::Page {
                va: page,
                asid: KERNEL_ASID,
            }
            .apply(&mut ctx.cpu.tlb.lock());
        }
        ctx.cpu.windows.lock()[slot] = false;
    }
}

impl<'p> CpuContext<'p> {
    /// Maps the page containing `pa` for the lifetime of the guard.
    ///
    /// # Panics
    /// When every window slot of this CPU is already in use.
    #[must_use]
    pub fn map_phys(&self, pa: PhysicalAddress) -> PhysWindow<'p> {
        let cpu: &'p crate::cpu::PerCpu = self.cpu;
        let cs = cpu.critical.enter();

        if pa.as_u64() < DIRECT_MAP_SIZE {
            return PhysWindow {
                ctx: *self,
                va: VirtualAddress::new(KSEG0_BASE + pa.as_u64()),
                slot: None,
                _cs: cs,
            };
        }

        let slot = {
            debug_assert!(cpu.critical.is_active(), "{:?}: window slot with interrupts on", self.id());
            let mut slots = cpu.windows.lock();
            let Some(slot) = slots.iter().position(|used| !used) else {
                panic!("{:?}: all {WINDOW_SLOTS} physical window slots in use", self.id());
            };
            slots[slot] = true;
            slot
        };

        let index = (self.id().index() * WINDOW_SLOTS + slot) as u64;
        let page = VirtualAddress::new(WINDOW_BASE + index * PAGE_SIZE);
        let pte = PtEntry::new()
            .with_valid(true)
            .with_dirty(true)
            .with_global(true)
            .with_referenced(true)
            .with_frame(pa.frame())
            .with_cache_attr(CacheAttr::Cacheable);
        {
            let mut tables = self.lock_space(&self.pmap.kernel);
            match tables.table.entry_mut(page) {
                Some(e) => *e = pte,
                None => panic!("window segment missing from the kernel table"),
            }
            TlbAction::Page {
                va: page,
                asid: KERNEL_ASID,
            }
            .apply(&mut cpu.tlb.lock());
        }

        PhysWindow {
            ctx: *self,
            va: page + pa.page_offset(),
            slot: Some(slot),
            _cs: cs,
        }
    }

    /// Maps two pages at once, as a copy needs.
    #[must_use]
    pub fn map_phys_pair(&self, src: PhysicalAddress, dst: PhysicalAddress) -> (PhysWindow<'p>, PhysWindow<'p>) {
        (self.map_phys(src), self.map_phys(dst))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::PmapConfig;
    use crate::pmap::Pmap;
    use kernel_info::boot::PhysRegion;
    use kernel_memory_addresses::PhysicalAddress;

    fn pmap() -> Pmap {
        Pmap::bootstrap(PmapConfig::default(), &[PhysRegion::new(0, 0x0100_0000)]).unwrap()
    }

    #[test]
    fn windows_run_with_interrupts_off() {
        let pmap = pmap();
        let cpu = pmap.cpu(0);
        {
            let high = cpu.map_phys(PhysicalAddress::new(0x4000_0000));
            assert!(high.is_windowed());
            let low = cpu.map_phys(PhysicalAddress::new(0x2000));
            assert_eq!(cpu.cpu.critical.depth(), 2);
            drop(low);
            assert!(cpu.cpu.critical.is_active());
        }
        assert!(!cpu.cpu.critical.is_active());
        assert!(cpu.cpu.windows.lock().iter().all(|used| !used));
    }

    #[test]
    fn activation_leaves_the_critical_section_balanced() {
        let pmap = pmap();
        let cpu = pmap.cpu(0);
        let s = pmap.create();
        cpu.activate(&s);
        cpu.activate(pmap.kernel());
        cpu.deactivate();
        assert_eq!(cpu.cpu.critical.depth(), 0);
        assert!(!s.is_active_on(cpu.id()));
    }
}
