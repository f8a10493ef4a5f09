use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Failures a translation-manager call can report back to its caller.
///
/// Only non-blocking callers ever see [`PmapError::ResourceShortage`]; a
/// blocking call that runs out of resources panics instead. The fault
/// variants come out of the dirty/reference emulation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    #[error("out of page-table pages or mapping records")]
    ResourceShortage,
    #[error("write through read-only mapping at {0}")]
    ProtectionFault(VirtualAddress),
    #[error("no valid mapping at {0}")]
    Unmapped(VirtualAddress),
    #[error("physical address {0} lies outside the direct-mapped range")]
    OutOfReach(PhysicalAddress),
    #[error("range at {0} is not inside the kernel map")]
    OutsideKernel(VirtualAddress),
}

/// Rejected bootstrap parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cpu count {0} is outside the supported range")]
    CpuCount(usize),
    #[error("max_asid {0} must be at least 2 and fit the hardware tag width")]
    AsidRange(u16),
    #[error("the mapping-record pool needs a nonzero capacity")]
    EmptyPvPool,
    #[error("the software TLB needs at least one entry")]
    EmptyTlb,
    #[error("no usable RAM below the direct-map limit")]
    NoDirectMappedRam,
    #[error("{0} page-table frames cannot hold the kernel and window tables")]
    TooFewTableFrames(usize),
    #[error("not enough direct-mapped RAM to reserve {0} page-table frames")]
    TableReserve(usize),
}
