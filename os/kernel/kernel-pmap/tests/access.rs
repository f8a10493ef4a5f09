mod common;

use common::{frame, pmap, pmap_with, va};
use kernel_info::memory::{KSEG0_BASE, KSEG1_BASE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_pmap::{Asid, EnterFlags, PmapConfig, PmapError, Protection};

#[test]
fn first_store_goes_through_modify_emulation() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let s = pmap.create();
    let f = frame(0xA0);
    cpu.enter(&s, va(0x1000), f, Protection::RW, EnterFlags::ACCESS_READ)
        .unwrap();
    cpu.activate(&s);

    assert_eq!(cpu.access(va(0x1010), false), Ok(f.base() + 0x10));
    assert!(!cpu.is_modified(f));

    assert_eq!(cpu.access(va(0x1010), true), Ok(f.base() + 0x10));
    assert!(cpu.is_modified(f));
    let cached = cpu
        .tlb_entries()
        .into_iter()
        .find(|e| e.vpn == va(0x1000).vpn())
        .expect("cached translation");
    assert!(cached.pte.dirty());
}

#[test]
fn stores_to_read_only_pages_fault() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let s = pmap.create();
    cpu.enter(&s, va(0x1000), frame(0xA1), Protection::RW, EnterFlags::ACCESS_WRITE)
        .unwrap();
    cpu.activate(&s);
    cpu.access(va(0x1000), true).unwrap();

    cpu.protect(&s, va(0x1000), va(0x2000), Protection::READ);
    assert_eq!(
        cpu.access(va(0x1000), true),
        Err(PmapError::ProtectionFault(va(0x1000)))
    );
    assert!(cpu.access(va(0x1000), false).is_ok());
}

#[test]
fn tlb_never_outlives_a_replaced_translation() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let s = pmap.create();
    cpu.enter(&s, va(0x1000), frame(0xA2), Protection::RW, EnterFlags::empty())
        .unwrap();
    cpu.activate(&s);
    assert_eq!(cpu.access(va(0x1000), false), Ok(frame(0xA2).base()));

    cpu.enter(&s, va(0x1000), frame(0xA3), Protection::RW, EnterFlags::empty())
        .unwrap();
    assert_eq!(cpu.access(va(0x1000), false), Ok(frame(0xA3).base()));

    cpu.remove(&s, va(0x1000), va(0x2000));
    assert_eq!(cpu.access(va(0x1000), false), Err(PmapError::Unmapped(va(0x1000))));
}

#[test]
fn user_addresses_need_an_active_space() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let s = pmap.create();
    cpu.enter(&s, va(0x1000), frame(0xA4), Protection::READ, EnterFlags::empty())
        .unwrap();
    assert_eq!(cpu.access(va(0x1000), false), Err(PmapError::Unmapped(va(0x1000))));

    cpu.activate(&s);
    assert!(cpu.access(va(0x1000), false).is_ok());
    assert_eq!(cpu.current().map(|c| c.id()), Some(s.id()));

    cpu.deactivate();
    assert!(cpu.current().is_none());
    assert_eq!(cpu.access(va(0x1000), false), Err(PmapError::Unmapped(va(0x1000))));
}

#[test]
fn direct_segments_bypass_the_tlb() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    assert_eq!(
        cpu.access(va(KSEG0_BASE + 0x1234), true),
        Ok(PhysicalAddress::new(0x1234))
    );
    assert_eq!(
        cpu.access(va(KSEG1_BASE + 0x5000), false),
        Ok(PhysicalAddress::new(0x5000))
    );
    assert!(cpu.tlb_entries().is_empty());
}

#[test]
fn spaces_get_distinct_tags() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let spaces: Vec<_> = (0..5).map(|_| pmap.create()).collect();

    let mut tags = Vec::new();
    for s in &spaces {
        cpu.activate(s);
        let (asid, generation) = s.asid_on(cpu.id());
        assert_eq!(generation, cpu.asid_generation());
        assert_ne!(asid, Asid::KERNEL);
        tags.push(asid);
    }
    tags.sort_by_key(|a| a.0);
    tags.dedup();
    assert_eq!(tags.len(), spaces.len());

    // Reactivation within the generation keeps the tag.
    let before = spaces[0].asid_on(cpu.id());
    cpu.activate(&spaces[0]);
    assert_eq!(spaces[0].asid_on(cpu.id()), before);
}

#[test]
fn tag_exhaustion_starts_a_new_generation() {
    let pmap = pmap_with(PmapConfig {
        max_asid: 3,
        ..PmapConfig::default()
    });
    let cpu = pmap.cpu(0);
    let s1 = pmap.create();
    let s2 = pmap.create();
    let s3 = pmap.create();
    cpu.enter(&s1, va(0x1000), frame(0xB0), Protection::READ, EnterFlags::empty())
        .unwrap();

    cpu.activate(&s1);
    cpu.access(va(0x1000), false).unwrap();
    cpu.activate(&s2);
    assert_eq!(cpu.asid_generation(), 1);
    assert_eq!(s2.asid_on(cpu.id()), (Asid(2), 1));

    cpu.activate(&s3);
    assert_eq!(cpu.asid_generation(), 2);
    assert_eq!(s3.asid_on(cpu.id()), (Asid(1), 2));
    assert!(
        cpu.tlb_entries().iter().all(|e| e.pte.global()),
        "user entries are flushed on rollover"
    );

    // s1 still carries its generation-1 tag and must not reuse it.
    cpu.activate(&s1);
    assert_eq!(s1.asid_on(cpu.id()), (Asid(2), 2));
    assert_eq!(cpu.access(va(0x1000), false), Ok(frame(0xB0).base()));
}

#[test]
fn invalidating_an_idle_space_forgets_its_tag() {
    let pmap = pmap();
    let cpu = pmap.cpu(0);
    let s1 = pmap.create();
    let s2 = pmap.create();
    cpu.enter(&s1, va(0x1000), frame(0xB1), Protection::READ, EnterFlags::empty())
        .unwrap();
    cpu.activate(&s1);
    cpu.activate(&s2);
    assert!(!s1.is_active_on(cpu.id()));

    cpu.remove(&s1, va(0x1000), va(0x2000));
    assert_eq!(s1.asid_on(cpu.id()).1, 0, "tag marked stale");

    cpu.activate(&s1);
    assert_eq!(s1.asid_on(cpu.id()), (Asid(3), 1));
}
