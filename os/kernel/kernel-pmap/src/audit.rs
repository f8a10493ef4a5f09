//! Consistency checks across the page tables, the reverse map and the
//! per-space counters.
//!
//! Meant for tests and debug builds; it takes every lock it needs, one
//! space at a time, and reports the first discrepancy found.

use crate::frame::FrameClass;
use crate::pmap::CpuContext;
use crate::space::{AddressSpace, SpaceId};
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use kernel_info::memory::SEGMENT_SHIFT;
use kernel_memory_addresses::{FrameNumber, PAGE_SHIFT, VirtualAddress};

/// A broken bookkeeping invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    #[error("{space:?}: managed mapping at {va} has no reverse-mapping record")]
    MissingRecord { space: SpaceId, va: VirtualAddress },
    #[error("{space:?}: record for {va} has no valid managed mapping behind it")]
    OrphanRecord { space: SpaceId, va: VirtualAddress },
    #[error("reverse-mapping indexes disagree about {frame:?}")]
    IndexMismatch { frame: FrameNumber },
    #[error("{space:?}: table page for segment {segment} has wire count {found}, expected {expected}")]
    WireCount {
        space: SpaceId,
        segment: usize,
        expected: u32,
        found: u32,
    },
    #[error("{space:?}: resident count {found}, {expected} valid mappings")]
    Resident {
        space: SpaceId,
        expected: usize,
        found: usize,
    },
    #[error("{space:?}: wired count {found}, {expected} wired mappings")]
    Wired {
        space: SpaceId,
        expected: usize,
        found: usize,
    },
    #[error("{space:?}: table frame {frame:?} already backs another table")]
    SharedTableFrame { space: SpaceId, frame: FrameNumber },
}

impl CpuContext<'_> {
    /// Cross-checks `spaces` against each other and against the frame
    /// metadata.
    ///
    /// The kernel space is exempt from the wire and counter checks: its
    /// table pages are never freed and `kenter` mappings go uncounted.
    ///
    /// # Errors
    /// The first [`AuditError`] encountered.
    pub fn audit(&self, spaces: &[&Arc<AddressSpace>]) -> Result<(), AuditError> {
        let mut table_frames = BTreeSet::new();
        for space in spaces {
            self.audit_space(space, &mut table_frames)?;
        }
        self.audit_frames()
    }

    fn audit_space(&self, space: &AddressSpace, table_frames: &mut BTreeSet<FrameNumber>) -> Result<(), AuditError> {
        let id = space.id();
        let tables = self.lock_space(space);
        let q = self.lock_queues();
        let user = !space.is_kernel();

        let backing = tables
            .directory
            .iter()
            .map(|d| d.frame)
            .chain(tables.table.pages().map(|(_, page)| page.frame()));
        for frame in backing {
            if !table_frames.insert(frame) {
                return Err(AuditError::SharedTableFrame { space: id, frame });
            }
        }

        let mut resident = 0;
        let mut wired = 0;
        for (_, page) in tables.table.pages() {
            let base = (page.segment as u64) << SEGMENT_SHIFT;
            let mut valid = 0;
            for (i, e) in page.entries().iter().enumerate() {
                if !e.valid() {
                    continue;
                }
                valid += 1;
                if e.wired() {
                    wired += 1;
                }
                if !e.managed() {
                    continue;
                }
                let va = VirtualAddress::new(base | ((i as u64) << PAGE_SHIFT));
                let Some(&h) = tables.pv.get(&va) else {
                    return Err(AuditError::MissingRecord { space: id, va });
                };
                let Some(rec) = q.pool.get(h) else {
                    return Err(AuditError::IndexMismatch { frame: e.frame() });
                };
                if rec.space.id() != id || rec.va != va || rec.frame != e.frame() {
                    return Err(AuditError::IndexMismatch { frame: e.frame() });
                }
            }
            resident += valid as usize;
            if user && page.wire_count != valid {
                return Err(AuditError::WireCount {
                    space: id,
                    segment: page.segment,
                    expected: valid,
                    found: page.wire_count,
                });
            }
        }

        for &va in tables.pv.keys() {
            let backed = tables.table.entry(va).is_some_and(|e| e.valid() && e.managed());
            if !backed {
                return Err(AuditError::OrphanRecord { space: id, va });
            }
        }

        if user {
            if space.resident_count() != resident {
                return Err(AuditError::Resident {
                    space: id,
                    expected: resident,
                    found: space.resident_count(),
                });
            }
            if space.wired_count() != wired {
                return Err(AuditError::Wired {
                    space: id,
                    expected: wired,
                    found: space.wired_count(),
                });
            }
        }
        Ok(())
    }

    /// Every pooled record is on its frame's list, and the lists hold
    /// nothing else.
    fn audit_frames(&self) -> Result<(), AuditError> {
        let q = self.lock_queues();
        for (h, rec) in q.pool.iter() {
            let FrameClass::Managed(idx) = self.pmap.frames.classify(rec.frame) else {
                return Err(AuditError::IndexMismatch { frame: rec.frame });
            };
            if !q.md(idx).pv.contains(&h) {
                return Err(AuditError::IndexMismatch { frame: rec.frame });
            }
        }
        let listed: usize = (0..self.pmap.frames.managed_count())
            .map(|idx| q.md(idx).pv.len())
            .sum();
        if listed != q.pool.stats().in_use {
            return Err(AuditError::IndexMismatch {
                frame: FrameNumber::new(0),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PmapConfig;
    use crate::pmap::Pmap;
    use kernel_info::boot::PhysRegion;

    #[test]
    fn a_frame_backing_two_tables_is_reported() {
        let pmap = Pmap::bootstrap(PmapConfig::default(), &[PhysRegion::new(0, 0x0100_0000)]).unwrap();
        let cpu = pmap.cpu(0);
        let (a, b) = (pmap.create(), pmap.create());
        cpu.audit(&[pmap.kernel(), &a, &b]).unwrap();

        let stolen = a.tables.lock().directory.as_ref().map(|d| d.frame).unwrap();
        if let Some(d) = b.tables.lock().directory.as_mut() {
            d.frame = stolen;
        }
        assert_eq!(
            cpu.audit(&[&a, &b]),
            Err(AuditError::SharedTableFrame {
                space: b.id(),
                frame: stolen
            })
        );
    }
}
