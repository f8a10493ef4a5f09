mod common;

use common::{frame, pmap_with, va};
use kernel_info::memory::KERNEL_BASE;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_pmap::{EnterFlags, IpiDelivery, PageQueue, PmapConfig, PmapError, Protection};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

fn config(cpus: usize, ipi: IpiDelivery) -> PmapConfig {
    PmapConfig {
        cpus,
        ipi,
        ..PmapConfig::default()
    }
}

#[test]
fn remote_tlb_is_shot_down_through_its_mailbox() {
    let pmap = pmap_with(config(2, IpiDelivery::Mailbox));
    let s = pmap.create();
    pmap.cpu(0)
        .enter(&s, va(0x1000), frame(0x100), Protection::RW, EnterFlags::empty())
        .unwrap();

    let loaded = Barrier::new(2);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            let cpu = pmap.cpu(1);
            cpu.activate(&s);
            cpu.access(va(0x1000), false).unwrap();
            loaded.wait();
            while !stop.load(Ordering::Acquire) {
                cpu.service_ipis();
                thread::yield_now();
            }
            cpu.deactivate();
        });

        loaded.wait();
        let cpu0 = pmap.cpu(0);
        let remote = pmap.cpu(1);
        assert!(remote.tlb_entries().iter().any(|e| e.vpn == va(0x1000).vpn()));

        cpu0.remove(&s, va(0x1000), va(0x2000));
        assert!(
            remote.tlb_entries().iter().all(|e| e.vpn != va(0x1000).vpn()),
            "remove returned before cpu1 dropped its entry"
        );
        stop.store(true, Ordering::Release);
    });
}

#[test]
fn inline_delivery_reaches_every_cpu_for_kernel_entries() {
    let pmap = pmap_with(config(3, IpiDelivery::Inline));
    let kva = va(KERNEL_BASE + 0x7000);
    let pa = PhysicalAddress::new(0x0040_0000);
    pmap.cpu(0).kenter(kva, pa);

    for id in 0..3 {
        assert_eq!(pmap.cpu(id).access(kva, false), Ok(pa));
    }

    pmap.cpu(2).kremove(kva);
    for id in 0..3 {
        assert!(pmap.cpu(id).tlb_entries().is_empty());
    }
}

#[test]
fn idle_cpus_are_not_interrupted() {
    let pmap = pmap_with(config(4, IpiDelivery::Mailbox));
    let cpu = pmap.cpu(0);
    let s = pmap.create();
    cpu.activate(&s);
    cpu.enter(&s, va(0x1000), frame(0x100), Protection::RW, EnterFlags::empty())
        .unwrap();
    cpu.access(va(0x1000), false).unwrap();

    // Nobody services cpus 1-3; a shootdown aimed at them would hang here.
    cpu.remove(&s, va(0x1000), va(0x2000));
    assert!(cpu.tlb_entries().is_empty());
    assert_eq!(s.active_cpus().iter().count(), 1);
}

#[test]
fn concurrent_spaces_sharing_frames_stay_consistent() {
    const CPUS: usize = 4;
    const ROUNDS: u64 = 50;
    const PAGES: u64 = 8;

    let pmap = pmap_with(config(CPUS, IpiDelivery::Mailbox));
    let spaces: Vec<_> = (0..CPUS).map(|_| pmap.create()).collect();
    let start = Barrier::new(CPUS);

    thread::scope(|scope| {
        for (id, space) in spaces.iter().enumerate() {
            let pmap = &pmap;
            let start = &start;
            scope.spawn(move || {
                let cpu = pmap.cpu(id);
                cpu.activate(space);
                start.wait();
                for round in 0..ROUNDS {
                    for p in 0..PAGES {
                        let v = va(0x0010_0000 + p * PAGE_SIZE);
                        // Every space maps the same few frames.
                        let f = frame(0x400 + (p + round) % PAGES);
                        cpu.enter(space, v, f, Protection::RW, EnterFlags::ACCESS_READ)
                            .unwrap();
                        cpu.access(v, round % 2 == 0).unwrap();
                    }
                    if round % 3 == 0 {
                        cpu.protect(
                            space,
                            va(0x0010_0000),
                            va(0x0010_0000 + PAGES * PAGE_SIZE),
                            Protection::READ,
                        );
                    }
                    if round % 5 == 0 {
                        cpu.remove(space, va(0x0010_0000), va(0x0010_0000 + 4 * PAGE_SIZE));
                    }
                }
                cpu.deactivate();
            });
        }
    });

    let cpu = pmap.cpu(0);
    let all: Vec<_> = spaces.iter().collect();
    cpu.audit(&all).unwrap();
    for space in &spaces {
        assert_eq!(space.resident_count(), PAGES as usize);
    }

    for space in &spaces {
        cpu.remove(space, va(0x0010_0000), va(0x0010_0000 + PAGES * PAGE_SIZE));
        cpu.release(space);
    }
    assert_eq!(cpu.pv_stats().in_use, 0);
}

#[test]
fn frame_walks_race_with_mappers_under_record_pressure() {
    const WORKERS: usize = 3;
    const ROUNDS: u64 = 100;
    const PAGES: u64 = 8;

    let pmap = pmap_with(PmapConfig {
        pv_capacity: Some(12),
        ..config(WORKERS + 1, IpiDelivery::Mailbox)
    });
    let shared: Vec<_> = (0..PAGES).map(|p| frame(0x500 + p)).collect();
    for &f in &shared {
        pmap.cpu(0).set_page_queue(f, PageQueue::Active);
    }
    let spaces: Vec<_> = (0..WORKERS).map(|_| pmap.create()).collect();
    let start = Barrier::new(WORKERS + 1);
    let finished = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for (i, space) in spaces.iter().enumerate() {
            let (pmap, start, finished, stop, shared) = (&pmap, &start, &finished, &stop, &shared);
            scope.spawn(move || {
                let cpu = pmap.cpu(i + 1);
                cpu.activate(space);
                start.wait();
                for round in 0..ROUNDS {
                    for (p, &f) in shared.iter().enumerate() {
                        let v = va(0x0020_0000 + p as u64 * PAGE_SIZE);
                        match cpu.enter(space, v, f, Protection::RW, EnterFlags::NOSLEEP) {
                            Ok(()) | Err(PmapError::ResourceShortage) => {}
                            Err(e) => panic!("enter {v}: {e}"),
                        }
                        // cpu0 may have torn the mapping down already.
                        match cpu.access(v, round % 2 == 0) {
                            Ok(_) | Err(PmapError::Unmapped(_)) => {}
                            Err(e) => panic!("access {v}: {e}"),
                        }
                        cpu.service_ipis();
                    }
                }
                cpu.deactivate();
                finished.fetch_add(1, Ordering::AcqRel);
                while !stop.load(Ordering::Acquire) {
                    cpu.service_ipis();
                    thread::yield_now();
                }
            });
        }

        let cpu = pmap.cpu(0);
        start.wait();
        while finished.load(Ordering::Acquire) < WORKERS {
            for &f in &shared {
                cpu.remove_all(f);
                let _ = cpu.is_modified(f);
                cpu.clear_reference(f);
            }
        }
        stop.store(true, Ordering::Release);
    });

    let cpu = pmap.cpu(0);
    let all: Vec<_> = spaces.iter().collect();
    cpu.audit(&all).unwrap();
    assert!(cpu.pv_stats().in_use <= 12);

    for space in &spaces {
        cpu.remove(space, va(0x0020_0000), va(0x0020_0000 + PAGES * PAGE_SIZE));
        cpu.release(space);
    }
    assert_eq!(cpu.pv_stats().in_use, 0);
    for &f in &shared {
        assert!(!cpu.page_is_mapped(f));
    }
}
