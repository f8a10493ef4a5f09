//! Per-CPU software TLB.
//!
//! Stands in for the hardware TLB of one processor: a small, fully
//! associative array of `(vpn, asid) -> entry` translations with
//! round-robin replacement. Entries whose PTE has `G` set match every ASID.

use crate::pte::PtEntry;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpn: u64,
    pub asid: u16,
    pub pte: PtEntry,
}

impl TlbEntry {
    #[inline]
    #[must_use]
    pub const fn matches(&self, vpn: u64, asid: u16) -> bool {
        self.vpn == vpn && (self.pte.global() || self.asid == asid)
    }
}

pub struct SoftTlb {
    slots: Vec<Option<TlbEntry>>,
    victim: usize,
    entryhi: u16,
}

impl SoftTlb {
    #[must_use]
    pub fn new(entries: usize) -> Self {
        Self {
            slots: vec![None; entries],
            victim: 0,
            entryhi: 0,
        }
    }

    /// The ASID the CPU is currently running with.
    #[inline]
    #[must_use]
    pub const fn entryhi(&self) -> u16 {
        self.entryhi
    }

    #[inline]
    pub const fn set_entryhi(&mut self, asid: u16) {
        self.entryhi = asid;
    }

    #[must_use]
    pub fn probe(&self, va: VirtualAddress, asid: u16) -> Option<TlbEntry> {
        let vpn = va.vpn();
        self.slots.iter().flatten().find(|e| e.matches(vpn, asid)).copied()
    }

    /// Installs a translation, replacing any entry for the same page.
    pub fn write(&mut self, va: VirtualAddress, asid: u16, pte: PtEntry) {
        let entry = TlbEntry {
            vpn: va.vpn(),
            asid,
            pte,
        };
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_some_and(|e| e.matches(entry.vpn, asid)))
            .or_else(|| self.slots.iter().position(Option::is_none))
            .unwrap_or_else(|| {
                let v = self.victim;
                self.victim = (v + 1) % self.slots.len();
                v
            });
        self.slots[slot] = Some(entry);
    }

    pub fn invalidate_address(&mut self, va: VirtualAddress, asid: u16) {
        let vpn = va.vpn();
        for s in &mut self.slots {
            if s.is_some_and(|e| e.matches(vpn, asid)) {
                *s = None;
            }
        }
    }

    /// Drops every non-global entry tagged `asid`.
    pub fn invalidate_asid(&mut self, asid: u16) {
        for s in &mut self.slots {
            if s.is_some_and(|e| !e.pte.global() && e.asid == asid) {
                *s = None;
            }
        }
    }

    pub fn invalidate_all_user(&mut self) {
        for s in &mut self.slots {
            if s.is_some_and(|e| !e.pte.global()) {
                *s = None;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        self.slots.fill(None);
    }

    /// Rewrites the cached copy of a translation, if one is present.
    pub fn update(&mut self, va: VirtualAddress, asid: u16, pte: PtEntry) {
        let vpn = va.vpn();
        for e in self.slots.iter_mut().flatten() {
            if e.matches(vpn, asid) {
                e.pte = pte;
            }
        }
    }

    /// Snapshot of every live entry.
    #[must_use]
    pub fn read_all(&self) -> Vec<TlbEntry> {
        self.slots.iter().flatten().copied().collect()
    }
}
