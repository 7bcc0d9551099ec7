//! Transactional versions: in-place mutation, commit, rollback and the
//! three-way merge.

use mmap_trie::trie::gc_list::GcList;
use mmap_trie::trie::node::{self, LocalNode};
use mmap_trie::trie::ptr::{NodeType, State, TriePtr};
use mmap_trie::{MemoryAllocator, MmapFile, TrieKey};

fn assert_all_state(area: &MemoryAllocator, ptr: TriePtr, state: State) {
    if ptr.is_null() {
        return;
    }
    assert_eq!(ptr.state(), state, "node {ptr:?}");
    if ptr.node_type() == NodeType::InlineTerm {
        return;
    }
    let shape = area.region().pinned(|| node::local(area, ptr)).unwrap();
    if let LocalNode::Branch { branches, .. } = shape {
        for (_, child, _) in branches {
            assert_all_state(area, child, state);
        }
    }
}

#[test]
fn change_state_converts_the_whole_subtree() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..300u64 {
            w.insert(i * 11, i).unwrap();
        }
    }
    let area = db.area();
    let v = trie.current(area).unwrap();
    let root = v.root();
    assert_all_state(area, root, State::CopyOnWrite);

    let mut gc = GcList::new();
    let in_place = area
        .region()
        .pinned(|| node::change_state(area, root, State::InPlace, &mut gc))
        .unwrap();
    assert_all_state(area, in_place, State::InPlace);

    // The converted tree holds exactly the same entries.
    let mut entries = Vec::new();
    area.region()
        .pinned(|| {
            entries.clear();
            node::gather_values(area, in_place, &mmap_trie::KeyFragment::empty(), &mut entries)
        })
        .unwrap();
    assert_eq!(entries.len(), 300);

    // The private copy is unpublished; it and its gc record just go away.
    area.region()
        .pinned(|| node::deallocate_subtree(area, in_place))
        .unwrap();
}

#[test]
fn fast_path_commit() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();

    let mut tx = trie.transaction(db.area()).unwrap();
    for i in 0..50u64 {
        assert!(tx.insert(i, i).unwrap());
    }
    assert_eq!(tx.size().unwrap(), 50, "the transaction sees its own writes");
    // Not visible outside before commit.
    assert_eq!(trie.current(db.area()).unwrap().size().unwrap(), 0);

    let deallocs = tx.commit().unwrap();
    assert!(deallocs.is_empty());
    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 50);
    for i in 0..50u64 {
        assert_eq!(v.get(&i).unwrap(), Some(i));
    }
}

#[test]
fn replace_and_remove_report_old_values() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        w.insert(1u64, 10).unwrap();
        w.insert(2u64, 20).unwrap();
        w.insert(3u64, 30).unwrap();
    }

    let mut tx = trie.transaction(db.area()).unwrap();
    assert_eq!(tx.replace(1u64, 11).unwrap(), (true, 10));
    assert_eq!(tx.remove(2u64).unwrap(), (true, 20));
    assert!(!tx.replace(9u64, 99).unwrap().0);
    assert!(!tx.remove(9u64).unwrap().0);

    let deallocs = tx.commit().unwrap();
    let mut got: Vec<(u64, u64)> = deallocs
        .iter()
        .map(|(k, v)| (k.as_u64(), *v))
        .collect();
    got.sort_unstable();
    assert_eq!(got, vec![(1, 10), (2, 20)]);

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.get(&1u64).unwrap(), Some(11));
    assert_eq!(v.get(&2u64).unwrap(), None);
    assert_eq!(v.get(&3u64).unwrap(), Some(30));
}

#[test]
fn rollback_discards_everything() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        w.insert(1u64, 10).unwrap();
    }

    let mut tx = trie.transaction(db.area()).unwrap();
    tx.insert(2u64, 20).unwrap();
    tx.replace(1u64, 11).unwrap();
    let inserted = tx.rollback(true).unwrap();
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].0.as_u64(), 2);
    assert_eq!(inserted[0].1, 20);

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 1);
    assert_eq!(v.get(&1u64).unwrap(), Some(10));
}

#[test]
fn implicit_rollback_on_drop() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let mut tx = trie.transaction(db.area()).unwrap();
        tx.insert(1u64, 1).unwrap();
        // dropped without commit
    }
    assert!(trie.current(db.area()).unwrap().is_empty().unwrap());
}

#[test]
fn three_way_merge_with_conflicts() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();

    let key = |s: &str| TrieKey::from(s);

    // Transaction starts from the empty root.
    let mut tx = trie.transaction(db.area()).unwrap();

    // A concurrent writer moves the live root: {a -> 1, b -> 2}.
    {
        let w = trie.mutate(db.area()).unwrap();
        w.insert("a", 1).unwrap();
        w.insert("b", 2).unwrap();
    }

    // The transaction inserts {a -> 3, c -> 4}.
    assert!(tx.insert("a", 3).unwrap());
    assert!(tx.insert("c", 4).unwrap());

    // Conflicting inserts resolve to max(theirs, ours).
    let deallocs = tx
        .commit_with(
            &|_k, _base, theirs, ours| theirs.max(ours),
            &|_k, _base, _theirs| true,
        )
        .unwrap();

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.get(&"a").unwrap(), Some(3), "max(1, 3)");
    assert_eq!(v.get(&"b").unwrap(), Some(2), "their non-conflicting write");
    assert_eq!(v.get(&"c").unwrap(), Some(4), "our non-conflicting write");
    assert_eq!(v.size().unwrap(), 3);

    // The displaced live value of "a" is reported for cleanup.
    assert!(deallocs.iter().any(|(k, v)| *k == key("a") && *v == 1));
}

#[test]
fn merge_remove_conflicts() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        w.insert("x", 1).unwrap();
        w.insert("y", 2).unwrap();
    }

    let mut tx = trie.transaction(db.area()).unwrap();

    // Theirs bumps both values while the transaction removes them.
    {
        let w = trie.mutate(db.area()).unwrap();
        w.compare_and_swap("x", 1, 10).unwrap();
        w.compare_and_swap("y", 2, 20).unwrap();
    }
    tx.remove("x").unwrap();
    tx.remove("y").unwrap();

    // Keep the removal of x, abandon the removal of y.
    tx.commit_with(&|_, _, theirs, _| theirs, &|k, _base, _theirs| {
        k.as_string() == "x"
    })
    .unwrap();

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.get(&"x").unwrap(), None, "kept removal");
    assert_eq!(v.get(&"y").unwrap(), Some(20), "abandoned removal");
}

#[test]
fn try_commit_fails_when_root_moved() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();

    let mut tx = trie.transaction(db.area()).unwrap();
    tx.insert(1u64, 1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        w.insert(2u64, 2).unwrap();
    }
    let (committed, _) = tx.try_commit().unwrap();
    assert!(!committed, "root moved; try_commit must not merge");

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 1);
    assert_eq!(v.get(&2u64).unwrap(), Some(2));
}

#[test]
fn transaction_clear() {
    let db = MmapFile::anonymous(0).unwrap();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..20u64 {
            w.insert(i, i).unwrap();
        }
    }
    let mut tx = trie.transaction(db.area()).unwrap();
    tx.clear().unwrap();
    tx.insert(99u64, 99).unwrap();
    tx.commit().unwrap();

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 1);
    assert_eq!(v.get(&99u64).unwrap(), Some(99));
}
