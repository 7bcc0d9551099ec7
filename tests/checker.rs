//! The structural checker and repair pass.

use std::sync::atomic::Ordering;

use mmap_trie::check::{check, check_region, repair};
use mmap_trie::trie::ptr::{NodeType, State, TriePtr};
use mmap_trie::MmapFile;

#[test]
fn clean_trie_checks_clean() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    for i in 0..500u64 {
        w.insert(i * 7, i).unwrap();
    }
    let report = check(&trie.current(db.area()).unwrap()).unwrap();
    assert!(report.is_clean(), "faults: {:?}", report.errors);
    assert_eq!(report.valid_entries, 500);
    assert!(report.corruption.is_none());

    assert!(check_region(db.area(), 1, 32, false, false).unwrap());
}

/// Point a trie's root at a zeroed piece of the region: the node decodes
/// as an illegal zero-slot branching node.
fn corrupt_root(db: &MmapFile, id: u32) {
    let area = db.area();
    let root_offset = area.trie_alloc.trie_offset(id).unwrap();
    let bogus = TriePtr::indirect(NodeType::DenseBranch, State::CopyOnWrite, 4096, 3, 0, 0);
    area.region()
        .pinned(|| {
            area.region()
                .atomic_u64(root_offset)?
                .store(bogus.bits(), Ordering::Release);
            Ok(())
        })
        .unwrap();
}

#[test]
fn corruption_is_detected_and_bounded() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..50u64 {
            w.insert(i, i).unwrap();
        }
    }
    corrupt_root(&db, 1);

    let report = check(&trie.current(db.area()).unwrap()).unwrap();
    assert!(!report.is_clean());
    assert!(report.corruption.is_some());
    assert!(!check_region(db.area(), 1, 32, false, false).unwrap());
}

#[test]
fn repair_rebuilds_from_survivors() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..50u64 {
            w.insert(i, i).unwrap();
        }
    }
    corrupt_root(&db, 1);

    // Nothing survives a corrupt root; the repaired trie is empty but
    // structurally sound and writable again.
    let kept = repair(&trie, db.area()).unwrap();
    assert_eq!(kept, 0);
    let v = trie.current(db.area()).unwrap();
    assert!(check(&v).unwrap().is_clean());
    assert_eq!(v.size().unwrap(), 0);
    drop(v);

    let w = trie.mutate(db.area()).unwrap();
    for i in 0..10u64 {
        assert!(w.insert(i, i).unwrap().1);
    }
    assert!(check(&trie.current(db.area()).unwrap()).unwrap().is_clean());
}

#[test]
fn repair_preserves_clean_tries() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..100u64 {
            w.insert(i, i).unwrap();
        }
    }
    let kept = repair(&trie, db.area()).unwrap();
    assert_eq!(kept, 100, "a clean trie keeps all its entries");
    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 100);
    for i in 0..100u64 {
        assert_eq!(v.get(&i).unwrap(), Some(i));
    }
}
