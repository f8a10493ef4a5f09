//! Data- and instruction-cache maintenance hooks.

use kernel_memory_addresses::VirtualAddress;

/// Cache maintenance the translation manager needs from the platform.
///
/// Called with the owning space locked; implementations must not call back
/// into the translation manager.
pub trait CacheOps: Send + Sync {
    /// Write back and invalidate the data cache for `[va, va + len)`.
    fn dcache_wbinv_range(&self, va: VirtualAddress, len: u64);

    /// Make instruction fetches observe prior stores to `[va, va + len)`.
    fn icache_sync_range(&self, va: VirtualAddress, len: u64) {
        let _ = (va, len);
    }
}

/// Coherent caches, or a harness that does not model them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCacheOps;

impl CacheOps for NoCacheOps {
    fn dcache_wbinv_range(&self, _va: VirtualAddress, _len: u64) {}
}
