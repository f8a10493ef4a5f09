//! Cross-CPU TLB shootdown messages.

use crate::pte::PtEntry;
use crate::tlb::SoftTlb;
use alloc::sync::Arc;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use kernel_sync::Completion;

/// Work one CPU performs on its own TLB on behalf of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbAction {
    Page {
        va: VirtualAddress,
        asid: u16,
    },
    /// Half-open, page-aligned range.
    Range {
        start: VirtualAddress,
        end: VirtualAddress,
        asid: u16,
    },
    /// Every non-global entry of one tag.
    Asid(u16),
    /// Everything, global entries included.
    Flush,
    Update {
        va: VirtualAddress,
        asid: u16,
        pte: PtEntry,
    },
}

impl TlbAction {
    pub fn apply(self, tlb: &mut SoftTlb) {
        match self {
            Self::Page { va, asid } => tlb.invalidate_address(va, asid),
            Self::Range { start, end, asid } => {
                let mut va = start;
                while va < end {
                    tlb.invalidate_address(va, asid);
                    va += PAGE_SIZE;
                }
            }
            Self::Asid(asid) => tlb.invalidate_asid(asid),
            Self::Flush => tlb.invalidate_all(),
            Self::Update { va, asid, pte } => tlb.update(va, asid, pte),
        }
    }
}

/// A request sitting in a target CPU's mailbox.
pub struct IpiRequest {
    pub action: TlbAction,
    pub done: Arc<Completion>,
}
