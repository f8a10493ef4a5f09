//! Address spaces.

use crate::asid::{Asid, AsidSlot};
use crate::cpu::{CpuId, CpuSet};
use crate::ptp::TableFrame;
use crate::pv::PvHandle;
use crate::table::TranslationTable;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_info::memory::{KERNEL_BASE, is_kernel_mapped, is_user};
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinMutex;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::KERNEL {
            f.write_str("space:kernel")
        } else {
            write!(f, "space:{}", self.0)
        }
    }
}

/// Everything guarded by the space lock.
pub(crate) struct SpaceTables {
    pub table: TranslationTable,
    /// Per-space side of the reverse map, keyed by virtual address.
    pub pv: BTreeMap<VirtualAddress, PvHandle>,
    /// Frame backing the segment directory.
    pub directory: Option<TableFrame>,
    /// End of the kernel VA covered by table pages; unused for user spaces.
    pub kernel_end: VirtualAddress,
    pub released: bool,
}

/// One virtual address space: the kernel's, or a process's.
///
/// Only obtainable from [`Pmap::create`](crate::Pmap::create) (or
/// [`Pmap::kernel`](crate::Pmap::kernel)).
pub struct AddressSpace {
    id: SpaceId,
    pub(crate) tables: SpinMutex<SpaceTables>,
    active: AtomicU64,
    pub(crate) asids: Box<[AsidSlot]>,
    resident: AtomicUsize,
    wired: AtomicUsize,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, cpus: usize, directory: TableFrame) -> Self {
        let kernel = id == SpaceId::KERNEL;
        Self {
            id,
            tables: SpinMutex::new(SpaceTables {
                table: TranslationTable::new(kernel),
                pv: BTreeMap::new(),
                directory: Some(directory),
                kernel_end: VirtualAddress::new(KERNEL_BASE),
                released: false,
            }),
            active: AtomicU64::new(0),
            asids: (0..cpus).map(|_| AsidSlot::new()).collect(),
            resident: AtomicUsize::new(0),
            wired: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> SpaceId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.id == SpaceId::KERNEL
    }

    /// Valid translations installed through `enter`.
    #[inline]
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn wired_count(&self) -> usize {
        self.wired.load(Ordering::Relaxed)
    }

    /// CPUs currently running with this space.
    #[inline]
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::SeqCst))
    }

    #[inline]
    #[must_use]
    pub fn is_active_on(&self, cpu: CpuId) -> bool {
        self.active_cpus().contains(cpu)
    }

    /// The (tag, generation) pair this space last got on `cpu`; generation
    /// 0 means it has none.
    #[must_use]
    pub fn asid_on(&self, cpu: CpuId) -> (Asid, u32) {
        self.asids[cpu.index()].load()
    }

    /// Whether `va` belongs to the part of the address map this space owns.
    #[must_use]
    pub fn covers(&self, va: VirtualAddress) -> bool {
        if self.is_kernel() {
            is_kernel_mapped(va.as_u64())
        } else {
            is_user(va.as_u64())
        }
    }

    pub(crate) fn set_active(&self, cpu: CpuId) {
        self.active.fetch_or(1 << cpu.index(), Ordering::SeqCst);
    }

    pub(crate) fn clear_active(&self, cpu: CpuId) {
        self.active.fetch_and(!(1 << cpu.index()), Ordering::SeqCst);
    }

    pub(crate) fn resident_inc(&self) {
        self.resident.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resident_dec(&self) {
        let prev = self.resident.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "{:?} resident count underflow", self.id);
    }

    pub(crate) fn wired_inc(&self) {
        self.wired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn wired_dec(&self) {
        let prev = self.wired.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "{:?} wired count underflow", self.id);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("resident", &self.resident_count())
            .field("wired", &self.wired_count())
            .field("active", &self.active_cpus())
            .finish_non_exhaustive()
    }
}
