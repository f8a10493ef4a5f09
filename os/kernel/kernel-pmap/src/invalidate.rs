//! TLB shootdown.
//!
//! Kernel translations are global, so they are invalidated on every CPU
//! under the kernel tag. A user space only has live TLB entries on CPUs
//! where it is active *and* its tag is from the current generation; those
//! CPUs get the invalidation, every other CPU just forgets the space's tag
//! so the next activation there starts clean.

use crate::asid::Asid;
use crate::config::IpiDelivery;
use crate::cpu::CpuId;
use crate::pmap::CpuContext;
use crate::pte::PtEntry;
use crate::smp::{IpiRequest, TlbAction};
use crate::space::AddressSpace;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::Completion;

impl CpuContext<'_> {
    /// Drops the cached translation of one page everywhere it may live.
    pub fn invalidate_page(&self, space: &AddressSpace, va: VirtualAddress) {
        self.shootdown(space, |asid| TlbAction::Page { va, asid: asid.0 });
    }

    /// Half-open range form of [`invalidate_page`](Self::invalidate_page).
    pub fn invalidate_range(&self, space: &AddressSpace, start: VirtualAddress, end: VirtualAddress) {
        debug_assert!(start <= end);
        if start == end {
            return;
        }
        self.shootdown(space, |asid| TlbAction::Range {
            start,
            end,
            asid: asid.0,
        });
    }

    /// Every translation of `space`; for the kernel, the whole TLB.
    pub fn invalidate_all(&self, space: &AddressSpace) {
        let kernel = space.is_kernel();
        self.shootdown(space, |asid| {
            if kernel {
                TlbAction::Flush
            } else {
                TlbAction::Asid(asid.0)
            }
        });
    }

    /// Rewrites a cached translation in place instead of dropping it.
    pub fn update_page(&self, space: &AddressSpace, va: VirtualAddress, pte: PtEntry) {
        self.shootdown(space, |asid| TlbAction::Update {
            va,
            asid: asid.0,
            pte,
        });
    }

    fn shootdown(&self, space: &AddressSpace, action: impl Fn(Asid) -> TlbAction) {
        let mut targets: Vec<(CpuId, TlbAction)> = Vec::new();

        if space.is_kernel() {
            for cpu in self.pmap.cpus.iter() {
                targets.push((cpu.id, action(Asid::KERNEL)));
            }
        } else {
            for cpu in self.pmap.cpus.iter() {
                let slot = &space.asids[cpu.id.index()];
                if space.is_active_on(cpu.id) && slot.is_current(cpu.generation()) {
                    targets.push((cpu.id, action(slot.load().0)));
                    continue;
                }
                slot.mark_stale();
                // An activation that raced past the check above may still
                // be running with the old tag.
                if space.is_active_on(cpu.id) {
                    targets.push((cpu.id, action(slot.load().0)));
                }
            }
        }

        self.call_on(&targets);
    }

    /// Runs each action on its CPU and returns once all of them ran.
    fn call_on(&self, targets: &[(CpuId, TlbAction)]) {
        let mailbox = self.pmap.config().ipi == IpiDelivery::Mailbox;
        let posted = targets
            .iter()
            .filter(|(cpu, _)| mailbox && *cpu != self.cpu.id)
            .count();
        let done = Arc::new(Completion::new(posted));

        for &(cpu, action) in targets {
            let target = &self.pmap.cpus[cpu.index()];
            if cpu == self.cpu.id || !mailbox {
                action.apply(&mut target.tlb.lock());
            } else {
                target.mailbox.post(IpiRequest {
                    action,
                    done: Arc::clone(&done),
                });
            }
        }

        done.wait(|| {
            self.service_ipis();
        });
    }
}
