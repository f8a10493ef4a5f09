//! Address-space tags.
//!
//! Every CPU hands out tags independently. A space remembers, per CPU, the
//! tag it was given and the generation it was given in; the tag is only
//! still its own while that generation is current. When a CPU runs out of
//! tags it flushes its non-global TLB entries and starts a new generation,
//! invalidating every tag it handed out before.

use crate::tlb::SoftTlb;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::KERNEL_ASID;
use log::debug;

/// A hardware address-space identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(pub u16);

impl Asid {
    pub const KERNEL: Self = Self(KERNEL_ASID);
}

/// One space's (tag, generation) pair on one CPU.
///
/// Generation 0 never occurs in a live allocator, so it marks the pair as
/// stale: the next activation on that CPU must allocate a fresh tag.
#[derive(Debug, Default)]
pub struct AsidSlot(AtomicU64);

impl AsidSlot {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn load(&self) -> (Asid, u32) {
        let v = self.0.load(Ordering::SeqCst);
        (Asid(v as u16), (v >> 16) as u32)
    }

    #[inline]
    pub fn store(&self, asid: Asid, generation: u32) {
        self.0
            .store(u64::from(generation) << 16 | u64::from(asid.0), Ordering::SeqCst);
    }

    /// Forces reallocation on the next activation; the tag bits are kept so
    /// an in-flight activation can still be chased.
    #[inline]
    pub fn mark_stale(&self) {
        self.0.fetch_and(0xffff, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_current(&self, generation: u32) -> bool {
        let (_, g) = self.load();
        g != 0 && g == generation
    }
}

/// Per-CPU allocator state. Only touched with the owning CPU's critical
/// section entered.
#[derive(Debug)]
pub struct AsidAllocator {
    next: u16,
    generation: u32,
    max: u16,
}

impl AsidAllocator {
    #[must_use]
    pub const fn new(max: u16) -> Self {
        Self {
            next: 1,
            generation: 1,
            max,
        }
    }

    #[inline]
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns a tag for the space owning `slot`, reusing the one it already
    /// has if it is still current on this CPU.
    pub fn acquire(&mut self, slot: &AsidSlot, tlb: &mut SoftTlb) -> Asid {
        let (asid, generation) = slot.load();
        if generation != 0 && generation == self.generation {
            return asid;
        }

        if self.next == self.max {
            tlb.invalidate_all_user();
            self.generation = self.generation.wrapping_add(1);
            if self.generation == 0 {
                self.generation = 1;
            }
            self.next = 1;
            debug!("asid rollover, generation {}", self.generation);
        }

        let asid = Asid(self.next);
        self.next += 1;
        slot.store(asid, self.generation);
        asid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::PtEntry;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn current_tag_is_reused() {
        let mut a = AsidAllocator::new(4);
        let mut tlb = SoftTlb::new(4);
        let s = AsidSlot::new();
        let first = a.acquire(&s, &mut tlb);
        assert_eq!(first, Asid(1));
        assert_eq!(a.acquire(&s, &mut tlb), first);
        s.mark_stale();
        assert_eq!(s.load(), (Asid(1), 0));
        assert_eq!(a.acquire(&s, &mut tlb), Asid(2));
    }

    #[test]
    fn exhaustion_flushes_and_starts_a_generation() {
        let mut a = AsidAllocator::new(3);
        let mut tlb = SoftTlb::new(4);
        let slots: [AsidSlot; 3] = Default::default();

        assert_eq!(a.acquire(&slots[0], &mut tlb), Asid(1));
        assert_eq!(a.acquire(&slots[1], &mut tlb), Asid(2));
        tlb.write(VirtualAddress::new(0x1000), 2, PtEntry::new().with_valid(true));

        assert_eq!(a.acquire(&slots[2], &mut tlb), Asid(1));
        assert_eq!(a.generation(), 2);
        assert!(tlb.read_all().is_empty());
        assert!(!slots[0].is_current(a.generation()));
    }

    #[test]
    fn generation_skips_zero_on_wrap() {
        let mut a = AsidAllocator {
            next: 2,
            generation: u32::MAX,
            max: 2,
        };
        let mut tlb = SoftTlb::new(1);
        a.acquire(&AsidSlot::new(), &mut tlb);
        assert_eq!(a.generation(), 1);
    }
}
