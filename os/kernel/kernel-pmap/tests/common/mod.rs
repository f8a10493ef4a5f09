#![allow(dead_code)]

use kernel_info::boot::PhysRegion;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_pmap::{Pmap, PmapConfig};

/// 16 MiB of RAM at physical zero; the page-table reserve comes off its top.
pub const RAM_END: u64 = 0x0100_0000;

pub fn pmap() -> Pmap {
    pmap_with(PmapConfig::default())
}

pub fn pmap_with(config: PmapConfig) -> Pmap {
    Pmap::bootstrap(config, &[PhysRegion::new(0, RAM_END)]).expect("bootstrap")
}

pub const fn va(raw: u64) -> VirtualAddress {
    VirtualAddress::new(raw)
}

pub const fn frame(n: u64) -> FrameNumber {
    FrameNumber::new(n)
}
