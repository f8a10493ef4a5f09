//! Runtime tunables handed to [`Pmap::bootstrap`](crate::Pmap::bootstrap).
//!
//! Compile-time layout (page size, segment size, the KSEG windows) lives in
//! [`kernel_info::memory`]; everything here is a policy knob that differs
//! between machines or test setups.

use crate::error::ConfigError;
use kernel_info::memory::{HW_ASID_COUNT, MAX_CPUS};

/// Page-table frames needed before the first user space exists: the kernel
/// directory, the first kernel segment and the window segment.
pub const MIN_TABLE_FRAMES: usize = 3;

/// How cross-CPU invalidations reach their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpiDelivery {
    /// The initiator applies the action to the target's TLB directly.
    ///
    /// For single-threaded harnesses where no thread services remote
    /// mailboxes.
    #[default]
    Inline,
    /// Requests are posted to the target's mailbox and the initiator waits
    /// for every acknowledgment. Every CPU must be serviced by a thread.
    Mailbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapConfig {
    /// Processors taking part in invalidation rendezvous.
    pub cpus: usize,
    /// Tags per generation, tag 0 included; at most the hardware width.
    pub max_asid: u16,
    /// Sizing hint for the mapping-record pool.
    pub max_procs: usize,
    /// Sizing hint for the mapping-record pool.
    pub pages_per_proc: usize,
    /// Overrides the computed pool capacity. Tests use this to force
    /// reclamation.
    pub pv_capacity: Option<usize>,
    /// Frames reserved at bootstrap for page-table pages and directories.
    pub ptp_frames: usize,
    /// Entries per software TLB.
    pub tlb_entries: usize,
    pub ipi: IpiDelivery,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            max_asid: HW_ASID_COUNT,
            max_procs: 64,
            pages_per_proc: 200,
            pv_capacity: None,
            ptp_frames: 256,
            tlb_entries: 64,
            ipi: IpiDelivery::Inline,
        }
    }
}

impl PmapConfig {
    /// Rejects parameters the translation manager cannot run with.
    ///
    /// # Errors
    /// Returns the first offending parameter as a [`ConfigError`].
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::CpuCount(self.cpus));
        }
        if self.max_asid < 2 || self.max_asid > HW_ASID_COUNT {
            return Err(ConfigError::AsidRange(self.max_asid));
        }
        if let Some(0) = self.pv_capacity {
            return Err(ConfigError::EmptyPvPool);
        }
        if self.tlb_entries == 0 {
            return Err(ConfigError::EmptyTlb);
        }
        if self.ptp_frames < MIN_TABLE_FRAMES {
            return Err(ConfigError::TooFewTableFrames(self.ptp_frames));
        }
        Ok(())
    }

    /// Pool capacity for `managed_frames` frames of pageable memory.
    #[must_use]
    pub const fn pv_capacity_for(&self, managed_frames: usize) -> usize {
        match self.pv_capacity {
            Some(n) => n,
            None => self
                .max_procs
                .saturating_mul(self.pages_per_proc)
                .saturating_add(managed_frames),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(PmapConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let base = PmapConfig::default();
        let cases = [
            (PmapConfig { cpus: 0, ..base }, ConfigError::CpuCount(0)),
            (PmapConfig { cpus: 65, ..base }, ConfigError::CpuCount(65)),
            (PmapConfig { max_asid: 1, ..base }, ConfigError::AsidRange(1)),
            (PmapConfig { max_asid: 257, ..base }, ConfigError::AsidRange(257)),
            (PmapConfig { pv_capacity: Some(0), ..base }, ConfigError::EmptyPvPool),
            (PmapConfig { tlb_entries: 0, ..base }, ConfigError::EmptyTlb),
            (PmapConfig { ptp_frames: 2, ..base }, ConfigError::TooFewTableFrames(2)),
        ];
        for (cfg, err) in cases {
            assert_eq!(cfg.validate(), Err(err));
        }
    }

    #[test]
    fn capacity_counts_processes_and_frames() {
        let cfg = PmapConfig {
            max_procs: 4,
            pages_per_proc: 10,
            ..PmapConfig::default()
        };
        assert_eq!(cfg.pv_capacity_for(8), 48);
        assert_eq!(PmapConfig { pv_capacity: Some(3), ..cfg }.pv_capacity_for(8), 3);
    }
}
