mod common;

use common::{frame, pmap, va};
use kernel_info::memory::{
    DIRECT_MAP_SIZE, KERNEL_BASE, KSEG0_BASE, KSEG1_BASE, SEGMENT_SIZE, WINDOW_BASE, WINDOW_END,
};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_pmap::{CacheAttr, CacheOps, PmapError};
use std::sync::{Arc, Mutex};

#[test]
fn grow_kernel_is_idempotent() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    assert_eq!(cpu.kernel_end(), va(KERNEL_BASE + SEGMENT_SIZE));
    let before = pmap.table_frames_available();

    cpu.grow_kernel(va(KERNEL_BASE + 2 * SEGMENT_SIZE + 1));
    assert_eq!(cpu.kernel_end(), va(KERNEL_BASE + 3 * SEGMENT_SIZE));
    assert_eq!(pmap.table_frames_available(), before - 2);

    cpu.grow_kernel(va(KERNEL_BASE + 3 * SEGMENT_SIZE));
    cpu.grow_kernel(va(KERNEL_BASE));
    assert_eq!(cpu.kernel_end(), va(KERNEL_BASE + 3 * SEGMENT_SIZE));
    assert_eq!(pmap.table_frames_available(), before - 2);
}

#[test]
fn kenter_kextract_kremove() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let kva = va(KERNEL_BASE + 0x5000);
    let pa = PhysicalAddress::new(0x0080_0000);

    cpu.kenter(kva, pa);
    assert_eq!(cpu.kextract(kva), Some(pa));
    assert_eq!(cpu.kextract(kva + 0x123), Some(pa + 0x123));
    assert_eq!(cpu.access(kva + 8, true), Ok(pa + 8));

    cpu.kenter(kva, PhysicalAddress::new(0x0090_0000));
    assert_eq!(cpu.access(kva, false), Ok(PhysicalAddress::new(0x0090_0000)));

    cpu.kremove(kva);
    assert_eq!(cpu.kextract(kva), None);
    assert_eq!(cpu.access(kva, false), Err(PmapError::Unmapped(kva)));
    cpu.audit(&[pmap.kernel()]).unwrap();
}

#[test]
fn kenter_attr_sets_the_cache_policy() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let kva = va(KERNEL_BASE + 0x6000);
    cpu.kenter_attr(kva, PhysicalAddress::new(0x1000_0000), CacheAttr::Uncached);
    cpu.access(kva, false).unwrap();
    let cached = cpu
        .tlb_entries()
        .into_iter()
        .find(|e| e.vpn == kva.vpn())
        .expect("refilled entry");
    assert_eq!(cached.pte.cache_attr(), CacheAttr::Uncached);
    assert!(cached.pte.global());
}

#[test]
#[should_panic(expected = "beyond the kernel table")]
fn kenter_past_the_grown_table_panics() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    cpu.kenter(va(KERNEL_BASE + 4 * SEGMENT_SIZE), PhysicalAddress::new(0x1000));
}

#[test]
fn qenter_maps_consecutive_pages() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let base = va(KERNEL_BASE + 0x10_0000);
    let frames = [frame(0x200), frame(0x7), frame(0x333)];

    cpu.qenter(base, &frames);
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(cpu.kextract(base + i as u64 * PAGE_SIZE), Some(f.base()));
    }

    cpu.qremove(base, frames.len());
    for i in 0..frames.len() {
        assert_eq!(cpu.kextract(base + i as u64 * PAGE_SIZE), None);
    }
}

#[test]
fn kextract_resolves_direct_segments() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    assert_eq!(
        cpu.kextract(va(KSEG0_BASE + 0x4321)),
        Some(PhysicalAddress::new(0x4321))
    );
    assert_eq!(
        cpu.kextract(va(KSEG1_BASE + 0x10)),
        Some(PhysicalAddress::new(0x10))
    );
    assert_eq!(cpu.kextract(va(0x1000)), None);
}

#[test]
fn mapdev_uses_the_uncached_segment() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let regs = PhysicalAddress::new(0x1F00_0000);
    let mapped = cpu.mapdev(regs, 0x1000).unwrap();
    assert_eq!(mapped, va(KSEG1_BASE + 0x1F00_0000));
    cpu.unmapdev(mapped, 0x1000);

    let far = PhysicalAddress::new(DIRECT_MAP_SIZE - 0x800);
    assert_eq!(cpu.mapdev(far, 0x1000), Err(PmapError::OutOfReach(far)));
}

#[test]
fn low_frames_use_the_direct_map() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let w = cpu.map_phys(PhysicalAddress::new(0x3000 + 0x44));
    assert!(!w.is_windowed());
    assert_eq!(w.va(), va(KSEG0_BASE + 0x3044));
}

#[test]
fn high_frames_borrow_a_window_slot() {
    let pmap = pmap_two_cpus();
    let cpu = pmap.cpu(1);
    let pa = PhysicalAddress::new(0x4000_0000 + 0x10);

    let page = {
        let w = cpu.map_phys(pa);
        assert!(w.is_windowed());
        let page = w.va().page_base();
        assert!((WINDOW_BASE..WINDOW_END).contains(&page.as_u64()));
        assert_eq!(w.va().page_offset(), 0x10);
        assert_eq!(cpu.kextract(w.va()), Some(pa));
        assert_eq!(cpu.access(w.va(), true), Ok(pa));
        page
    };

    assert_eq!(cpu.kextract(page), None);
    assert!(cpu.tlb_entries().iter().all(|e| e.vpn != page.vpn()));
}

#[test]
fn window_pairs_use_distinct_slots() {
    let pmap = pmap_two_cpus();
    let cpu0 = pmap.cpu(0);
    let cpu1 = pmap.cpu(1);
    let src = PhysicalAddress::new(0x4000_0000);
    let dst = PhysicalAddress::new(0x5000_0000);

    let (a, b) = cpu0.map_phys_pair(src, dst);
    let c = cpu1.map_phys(src);
    assert_ne!(a.va(), b.va());
    assert_ne!(a.va(), c.va());
    assert_eq!(cpu0.kextract(b.va()), Some(dst));
    drop((a, b, c));

    // Slots come back once released.
    let again = cpu0.map_phys(dst);
    assert!(again.is_windowed());
}

#[test]
#[should_panic(expected = "window slots in use")]
fn exhausting_window_slots_panics() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let high = PhysicalAddress::new(0x4000_0000);
    let _a = cpu.map_phys(high);
    let _b = cpu.map_phys(high);
    let _c = cpu.map_phys(high);
}

fn pmap_two_cpus() -> kernel_pmap::Pmap {
    common::pmap_with(kernel_pmap::PmapConfig {
        cpus: 2,
        ..kernel_pmap::PmapConfig::default()
    })
}

struct RecordedFlushes(Arc<Mutex<Vec<(VirtualAddress, u64)>>>);

impl CacheOps for RecordedFlushes {
    fn dcache_wbinv_range(&self, va: VirtualAddress, len: u64) {
        self.0.lock().unwrap().push((va, len));
    }
}

#[test]
fn change_attr_rewrites_mapped_kernel_pages() {
    let flushes = Arc::new(Mutex::new(Vec::new()));
    let pmap = pmap().with_cache_ops(RecordedFlushes(Arc::clone(&flushes)));
    let cpu = pmap.cpu(0);
    let base = va(KERNEL_BASE + 0x8000);
    cpu.kenter(base, PhysicalAddress::new(0x0080_0000));
    cpu.kenter(base + PAGE_SIZE, PhysicalAddress::new(0x0080_1000));
    cpu.access(base, false).unwrap();

    cpu.change_attr(base, 3 * PAGE_SIZE, CacheAttr::Uncached).unwrap();
    assert!(cpu.tlb_entries().iter().all(|e| e.vpn != base.vpn()));
    cpu.access(base, false).unwrap();
    let cached = cpu
        .tlb_entries()
        .into_iter()
        .find(|e| e.vpn == base.vpn())
        .expect("refilled entry");
    assert_eq!(cached.pte.cache_attr(), CacheAttr::Uncached);

    assert_eq!(cpu.kextract(base + PAGE_SIZE), Some(PhysicalAddress::new(0x0080_1000)));
    assert_eq!(cpu.kextract(base + 2 * PAGE_SIZE), None);
    assert!(flushes.lock().unwrap().contains(&(base, 3 * PAGE_SIZE)));
}

#[test]
fn change_attr_stays_inside_the_kernel_map() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    for (at, size) in [
        (va(KSEG0_BASE), PAGE_SIZE),
        (va(WINDOW_BASE), PAGE_SIZE),
        (va(WINDOW_BASE - PAGE_SIZE), 2 * PAGE_SIZE),
        (va(KERNEL_BASE), u64::MAX),
    ] {
        assert_eq!(
            cpu.change_attr(at, size, CacheAttr::Uncached),
            Err(PmapError::OutsideKernel(at))
        );
    }
}
