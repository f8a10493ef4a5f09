//! Per-processor state.

use crate::asid::AsidAllocator;
use crate::config::PmapConfig;
use crate::smp::IpiRequest;
use crate::space::AddressSpace;
use crate::tlb::SoftTlb;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{MAX_CPUS, WINDOW_SLOTS};
use kernel_sync::{CriticalSection, Mailbox, SpinMutex};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(usize);

impl CpuId {
    /// # Panics
    /// If `id` is not below [`MAX_CPUS`].
    #[must_use]
    pub const fn new(id: usize) -> Self {
        assert!(id < MAX_CPUS, "cpu id out of range");
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    #[inline]
    const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of CPUs as a bitmask.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & cpu.bit() != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS).filter(move |&i| self.0 & (1 << i) != 0).map(CpuId)
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub(crate) struct PerCpu {
    pub id: CpuId,
    /// "Interrupts disabled" nesting on this CPU.
    pub critical: CriticalSection,
    pub asid: SpinMutex<AsidAllocator>,
    /// Lock-free copy of the allocator generation, read by other CPUs when
    /// they decide whether a space's tag is live here.
    pub generation: AtomicU32,
    pub current: SpinMutex<Option<Arc<AddressSpace>>>,
    pub tlb: SpinMutex<SoftTlb>,
    pub mailbox: Mailbox<IpiRequest>,
    pub windows: SpinMutex<[bool; WINDOW_SLOTS]>,
}

impl PerCpu {
    pub fn new(id: CpuId, config: &PmapConfig) -> Self {
        let asid = AsidAllocator::new(config.max_asid);
        let generation = AtomicU32::new(asid.generation());
        Self {
            id,
            critical: CriticalSection::new(),
            asid: SpinMutex::new(asid),
            generation,
            current: SpinMutex::new(None),
            tlb: SpinMutex::new(SoftTlb::new(config.tlb_entries)),
            mailbox: Mailbox::new(),
            windows: SpinMutex::new([false; WINDOW_SLOTS]),
        }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_set_membership() {
        let s = CpuSet::from_bits(1 | (1 << 63));
        assert!(s.contains(CpuId::new(63)));
        assert!(!s.contains(CpuId::new(1)));
        assert_eq!(s.iter().collect::<alloc::vec::Vec<_>>(), [CpuId::new(0), CpuId::new(63)]);
        assert!(CpuSet::EMPTY.is_empty());
    }
}
