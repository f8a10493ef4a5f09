//! The translation manager and its per-CPU entry point.

use crate::asid::Asid;
use crate::cache::{CacheOps, NoCacheOps};
use crate::config::{MIN_TABLE_FRAMES, PmapConfig};
use crate::cpu::{CpuId, PerCpu};
use crate::error::{ConfigError, PmapError};
use crate::frame::{FrameClass, FrameTable};
use crate::ptp::{self, FrameSource, PtpSlab, ReservedFrames};
use crate::pte::PtEntry;
use crate::pv::{InactiveFirst, PvPool, PvStats, VictimSelector};
use crate::queues::{AFlags, PageQueues};
use crate::space::{AddressSpace, SpaceId, SpaceTables};
use crate::table::TranslationTable;
use crate::tlb::TlbEntry;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::boot::{PhysRegion, normalize};
use kernel_info::memory::{
    DIRECT_MAP_SIZE, KERNEL_BASE, KSEG0_BASE, SEGMENT_SIZE, WINDOW_BASE, is_kernel_mapped,
    is_user, segment_index,
};
use kernel_memory_addresses::{FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::{MutexGuard, RawSpin, RawTicket, SpinMutex, TicketMutex};
use log::{debug, info, trace};

pub(crate) type SpaceGuard<'a> = MutexGuard<'a, SpaceTables, RawSpin>;
pub(crate) type QueueGuard<'a> = MutexGuard<'a, PageQueues, RawTicket>;

/// Physical-map state shared by every CPU.
///
/// Created once by [`Pmap::bootstrap`]. All operations that take a space
/// or the frame-queue lock go through a [`CpuContext`] obtained from
/// [`Pmap::cpu`], so that a CPU waiting for a lock keeps answering
/// shootdown requests.
pub struct Pmap {
    config: PmapConfig,
    pub(crate) frames: FrameTable,
    pub(crate) queues: TicketMutex<PageQueues>,
    pub(crate) slab: SpinMutex<PtpSlab>,
    pub(crate) cpus: Box<[PerCpu]>,
    pub(crate) kernel: Arc<AddressSpace>,
    next_space: AtomicU32,
    pub(crate) cache: Box<dyn CacheOps>,
    pub(crate) victims: Box<dyn VictimSelector>,
}

impl Pmap {
    /// Sets up the translation manager over the physical memory map.
    ///
    /// The page-table frame reserve is carved from the top of the lowest
    /// direct-mapped RAM region; everything else becomes managed memory.
    /// The kernel space gets its first segment and the window segment.
    ///
    /// # Errors
    /// Any [`ConfigError`] from validation or from sizing against `ram`.
    pub fn bootstrap(config: PmapConfig, ram: &[PhysRegion]) -> Result<Self, ConfigError> {
        config.validate()?;
        let regions = normalized(ram);

        let low = regions
            .iter()
            .find(|r| r.start.as_u64() < DIRECT_MAP_SIZE)
            .ok_or(ConfigError::NoDirectMappedRam)?;
        let top = low.end.as_u64().min(DIRECT_MAP_SIZE);
        let want = config.ptp_frames as u64 * PAGE_SIZE;
        if top - low.start.as_u64() < want {
            return Err(ConfigError::TableReserve(config.ptp_frames));
        }
        let reserved = PhysRegion::new(top - want, top);
        let source = ReservedFrames::new(reserved.first_frame(), config.ptp_frames);

        Self::assemble(config, &regions, reserved, Box::new(source))
    }

    /// Like [`bootstrap`](Self::bootstrap), but page-table frames come from
    /// `source` and all of `ram` is managed.
    ///
    /// `ptp_frames` is only validated, not reserved.
    ///
    /// # Errors
    /// Any [`ConfigError`] from validation, or
    /// [`ConfigError::TooFewTableFrames`] when `source` cannot supply the
    /// kernel tables.
    pub fn bootstrap_with_frames(
        config: PmapConfig,
        ram: &[PhysRegion],
        source: impl FrameSource + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let regions = normalized(ram);
        Self::assemble(config, &regions, PhysRegion::default(), Box::new(source))
    }

    fn assemble(
        config: PmapConfig,
        regions: &[PhysRegion],
        reserved: PhysRegion,
        source: Box<dyn FrameSource>,
    ) -> Result<Self, ConfigError> {
        let frames = FrameTable::new(regions, reserved);
        let capacity = config.pv_capacity_for(frames.managed_count());
        if capacity == 0 {
            return Err(ConfigError::EmptyPvPool);
        }

        let mut slab = PtpSlab::new(source);
        if slab.available() < MIN_TABLE_FRAMES {
            return Err(ConfigError::TooFewTableFrames(slab.available()));
        }
        let directory = slab
            .take(PtEntry::new())
            .ok_or(ConfigError::TooFewTableFrames(0))?;
        let kernel = Arc::new(AddressSpace::new(SpaceId::KERNEL, config.cpus, directory));
        let cpus = (0..config.cpus)
            .map(|i| PerCpu::new(CpuId::new(i), &config))
            .collect();

        let pmap = Self {
            config,
            queues: TicketMutex::new(PageQueues::new(PvPool::new(capacity), frames.managed_count())),
            frames,
            slab: SpinMutex::new(slab),
            cpus,
            kernel,
            next_space: AtomicU32::new(1),
            cache: Box::new(NoCacheOps),
            victims: Box::new(InactiveFirst),
        };

        {
            let mut tables = pmap.kernel.tables.lock();
            pmap.install_kernel_segment(&mut tables.table, VirtualAddress::new(KERNEL_BASE));
            pmap.install_kernel_segment(&mut tables.table, VirtualAddress::new(WINDOW_BASE));
            tables.kernel_end = VirtualAddress::new(KERNEL_BASE + SEGMENT_SIZE);
        }

        info!(
            "pmap: {} cpus, {} managed frames, {} pv records (high water {}), {} table frames",
            pmap.config.cpus,
            pmap.frames.managed_count(),
            capacity,
            9 * (capacity / 10),
            pmap.table_frames_available(),
        );
        Ok(pmap)
    }

    /// Replaces the cache maintenance hooks.
    #[must_use]
    pub fn with_cache_ops(mut self, ops: impl CacheOps + 'static) -> Self {
        self.cache = Box::new(ops);
        self
    }

    /// Replaces the reclamation order.
    #[must_use]
    pub fn with_victim_selector(mut self, selector: impl VictimSelector + 'static) -> Self {
        self.victims = Box::new(selector);
        self
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// The context for CPU `id`.
    ///
    /// # Panics
    /// If `id` is not a configured CPU.
    #[must_use]
    pub fn cpu(&self, id: usize) -> CpuContext<'_> {
        assert!(id < self.cpus.len(), "cpu {id} is not configured");
        CpuContext {
            pmap: self,
            cpu: &self.cpus[id],
        }
    }

    /// The kernel address space.
    #[inline]
    #[must_use]
    pub const fn kernel(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Creates an empty user address space.
    ///
    /// # Panics
    /// When no frame is left for its segment directory.
    #[must_use]
    pub fn create(&self) -> Arc<AddressSpace> {
        match self.try_create() {
            Ok(space) => space,
            Err(e) => panic!("cannot create address space: {e}"),
        }
    }

    /// Non-blocking [`create`](Self::create).
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] when no directory frame is left.
    pub fn try_create(&self) -> Result<Arc<AddressSpace>, PmapError> {
        let directory = self
            .slab
            .lock()
            .take(PtEntry::new())
            .ok_or(PmapError::ResourceShortage)?;
        let id = SpaceId::new(self.next_space.fetch_add(1, Ordering::Relaxed));
        debug!("pmap: created {id:?}");
        Ok(Arc::new(AddressSpace::new(id, self.config.cpus, directory)))
    }

    /// Pins `frame` so reclamation leaves its mappings alone.
    pub fn hold(&self, frame: FrameNumber) {
        self.frames.hold(frame);
    }

    pub fn unhold(&self, frame: FrameNumber) {
        self.frames.unhold(frame);
    }

    #[must_use]
    pub fn hold_count(&self, frame: FrameNumber) -> u32 {
        self.frames.hold_count(frame)
    }

    #[must_use]
    pub fn is_managed(&self, frame: FrameNumber) -> bool {
        self.frames.is_managed(frame)
    }

    /// Page-table frames that can still be handed out.
    #[must_use]
    pub fn table_frames_available(&self) -> usize {
        self.slab.lock().available()
    }

    /// Hooks a kernel table page, filled with invalid-global entries, into
    /// the segment containing `va`; a populated segment is left alone.
    pub(crate) fn install_kernel_segment(&self, table: &mut TranslationTable, va: VirtualAddress) {
        if table.locate(va).is_some() {
            return;
        }
        let Some(backing) = self.slab.lock().take(PtEntry::invalid_global()) else {
            panic!("out of page-table pages growing the kernel to {va}");
        };
        table.install(segment_index(va.as_u64()), backing, 0);
    }

    /// Clears the translation for `va`, releasing its record and one
    /// reference on its table page. Returns the old entry if it was valid.
    ///
    /// The caller invalidates the TLB before dropping the space lock.
    pub(crate) fn remove_pte(
        &self,
        space: &AddressSpace,
        tables: &mut SpaceTables,
        q: &mut PageQueues,
        va: VirtualAddress,
    ) -> Option<PtEntry> {
        let empty = tables.table.empty_entry();
        let slot = tables.table.entry_mut(va)?;
        if !slot.valid() {
            return None;
        }
        let old = core::mem::replace(slot, empty);

        if old.wired() {
            space.wired_dec();
        }
        space.resident_dec();

        if old.managed() {
            let FrameClass::Managed(idx) = self.frames.classify(old.frame()) else {
                panic!("managed entry at {va} points at unmanaged {:?}", old.frame());
            };
            let Some(h) = tables.pv.remove(&va) else {
                panic!("missing reverse-mapping record for {va} in {:?}", space.id());
            };
            q.unlink(idx, h);
            q.pool.remove(h);

            let md = q.md_mut(idx);
            if old.is_modified() {
                md.dirty = true;
            }
            if old.referenced() {
                md.aflags |= AFlags::REFERENCED;
            }
        }

        if !space.is_kernel()
            && let Some(h) = tables.table.locate(va)
        {
            ptp::release(&mut tables.table, h, &self.slab);
        }

        trace!("remove {:?} {va} (was {:?})", space.id(), old.frame());
        Some(old)
    }
}

fn normalized(ram: &[PhysRegion]) -> Vec<PhysRegion> {
    let mut regions = ram.to_vec();
    let n = normalize(&mut regions);
    regions.truncate(n);
    regions
}

/// One CPU's view of the [`Pmap`].
///
/// Cheap to copy. Every operation runs "on" this CPU: local TLB work is
/// applied directly, remote CPUs are reached through their mailboxes, and
/// lock waits keep draining this CPU's own mailbox.
#[derive(Clone, Copy)]
pub struct CpuContext<'p> {
    pub(crate) pmap: &'p Pmap,
    pub(crate) cpu: &'p PerCpu,
}

impl<'p> CpuContext<'p> {
    #[inline]
    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.cpu.id
    }

    #[inline]
    #[must_use]
    pub const fn pmap(&self) -> &'p Pmap {
        self.pmap
    }

    /// Handles every queued shootdown request. Returns how many ran.
    pub fn service_ipis(&self) -> usize {
        let cpu = self.cpu;
        cpu.mailbox.drain(|req| {
            req.action.apply(&mut cpu.tlb.lock());
            req.done.signal();
        })
    }

    pub(crate) fn lock_space<'a>(&self, space: &'a AddressSpace) -> SpaceGuard<'a> {
        space.tables.lock_polling(|| {
            self.service_ipis();
        })
    }

    pub(crate) fn lock_queues(&self) -> QueueGuard<'p> {
        self.pmap.queues.lock_polling(|| {
            self.service_ipis();
        })
    }

    /// Switches this CPU to `space`, allocating it a tag if its old one is
    /// no longer current here.
    pub fn activate(&self, space: &Arc<AddressSpace>) {
        let cpu = self.cpu;
        let mut current = cpu.current.lock_critical(&cpu.critical);
        if let Some(old) = current.take() {
            old.clear_active(cpu.id);
        }

        space.set_active(cpu.id);
        let asid = if space.is_kernel() {
            Asid::KERNEL
        } else {
            debug_assert!(cpu.critical.is_active(), "{:?}: tag allocation with interrupts on", cpu.id);
            let mut alloc = cpu.asid.lock();
            let mut tlb = cpu.tlb.lock();
            let asid = alloc.acquire(&space.asids[cpu.id.index()], &mut tlb);
            cpu.generation.store(alloc.generation(), Ordering::SeqCst);
            asid
        };
        cpu.tlb.lock().set_entryhi(asid.0);
        *current = Some(Arc::clone(space));
        trace!("{:?} activated {:?} with {asid:?}", cpu.id, space.id());
    }

    /// Leaves the current space; only kernel addresses translate afterwards.
    pub fn deactivate(&self) {
        let cpu = self.cpu;
        if let Some(old) = cpu.current.lock_critical(&cpu.critical).take() {
            old.clear_active(cpu.id);
        }
        cpu.tlb.lock().set_entryhi(Asid::KERNEL.0);
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<AddressSpace>> {
        self.cpu.current.lock().clone()
    }

    pub(crate) fn is_current(&self, space: &AddressSpace) -> bool {
        self.cpu
            .current
            .lock()
            .as_ref()
            .is_some_and(|s| s.id() == space.id())
    }

    /// This CPU's tag generation.
    #[must_use]
    pub fn asid_generation(&self) -> u32 {
        self.cpu.generation()
    }

    /// Snapshot of this CPU's TLB.
    #[must_use]
    pub fn tlb_entries(&self) -> Vec<TlbEntry> {
        self.cpu.tlb.lock().read_all()
    }

    /// Record pool counters.
    #[must_use]
    pub fn pv_stats(&self) -> PvStats {
        self.lock_queues().pool.stats()
    }

    /// Performs a load or store the way the hardware would: TLB lookup,
    /// refill from the page tables on a miss, and a modify trap on a store
    /// through an entry without `D`.
    ///
    /// Direct-mapped addresses translate without the TLB.
    ///
    /// # Errors
    /// [`PmapError::Unmapped`] for a missing translation and
    /// [`PmapError::ProtectionFault`] for a store to a read-only page.
    pub fn access(&self, va: VirtualAddress, write: bool) -> Result<PhysicalAddress, PmapError> {
        let raw = va.as_u64();
        if (KSEG0_BASE..KERNEL_BASE).contains(&raw) {
            return Ok(PhysicalAddress::new((raw - KSEG0_BASE) % DIRECT_MAP_SIZE));
        }

        let space = if is_user(raw) {
            self.current().ok_or(PmapError::Unmapped(va))?
        } else if is_kernel_mapped(raw) {
            Arc::clone(&self.pmap.kernel)
        } else {
            return Err(PmapError::Unmapped(va));
        };

        let page = va.page_base();
        let asid = self.cpu.tlb.lock().entryhi();
        let cached = self.cpu.tlb.lock().probe(page, asid);
        let pte = match cached {
            Some(e) => e.pte,
            None => self.refill(&space, page, asid)?,
        };

        if write && !pte.dirty() {
            self.emulate_modified(&space, page)?;
        }
        Ok(pte.frame().base() + va.page_offset())
    }

    fn refill(&self, space: &AddressSpace, va: VirtualAddress, asid: u16) -> Result<PtEntry, PmapError> {
        let mut guard = self.lock_space(space);
        let Some(e) = guard.table.entry_mut(va) else {
            return Err(PmapError::Unmapped(va));
        };
        if !e.valid() {
            return Err(PmapError::Unmapped(va));
        }
        e.set_referenced(true);
        let pte = *e;
        self.cpu.tlb.lock().write(va, asid, pte);
        Ok(pte)
    }
}
