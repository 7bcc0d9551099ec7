//! Basic single-threaded trie behaviour over an anonymous region.

use mmap_trie::{MmapFile, TrieKey};

fn db() -> MmapFile {
    MmapFile::anonymous(0).expect("anonymous database")
}

#[test]
fn linear_insert_find_remove() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();

    const N: u64 = 1000;
    for i in 0..N {
        let (v, inserted) = w.insert(i, i).unwrap();
        assert!(inserted, "fresh insert of {i}");
        assert_eq!(v, i);
    }
    assert_eq!(w.size().unwrap(), N);

    for i in 0..N {
        assert_eq!(w.get(&i).unwrap(), Some(i), "find({i})");
    }

    // Iteration yields keys in numeric order.
    let all = w.to_vec().unwrap();
    assert_eq!(all.len(), N as usize);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k.as_u64(), i as u64);
        assert_eq!(*v, i as u64);
    }

    // Remove in reverse order, checking size as we go.
    for i in (0..N).rev() {
        let (found, old) = w.remove(i).unwrap();
        assert!(found, "remove({i})");
        assert_eq!(old, i);
        assert_eq!(w.size().unwrap(), i);
    }
    assert!(w.is_empty().unwrap());
}

#[test]
fn duplicate_insert_and_idempotent_remove() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();

    assert!(w.insert(7u64, 100).unwrap().1);
    let (existing, inserted) = w.insert(7u64, 200).unwrap();
    assert!(!inserted, "second insert of the same key must fail");
    assert_eq!(existing, 100);
    assert_eq!(w.get(&7u64).unwrap(), Some(100));

    assert_eq!(w.remove(7u64).unwrap(), (true, 100));
    assert_eq!(w.remove(7u64).unwrap().0, false, "remove is idempotent");
}

#[test]
fn string_and_binary_keys() {
    let db = db();
    let trie = db.create_trie(2).unwrap();
    let w = trie.mutate(db.area()).unwrap();

    let words = ["", "a", "ab", "abc", "abd", "b", "hello world", "hello!"];
    for (i, word) in words.iter().enumerate() {
        assert!(w.insert(*word, i as u64).unwrap().1);
    }
    for (i, word) in words.iter().enumerate() {
        assert_eq!(w.get(word).unwrap(), Some(i as u64), "find({word:?})");
    }

    // Lexicographic iteration order.
    let mut sorted = words.to_vec();
    sorted.sort_unstable();
    let got: Vec<String> = w
        .to_vec()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k.as_string())
        .collect();
    assert_eq!(got, sorted);

    let blob: &[u8] = &[0u8, 0, 1, 255, 3];
    assert!(w.insert(blob, 42).unwrap().1);
    assert_eq!(w.get(&blob).unwrap(), Some(42));
    assert_eq!(
        TrieKey::from(blob).as_bytes(),
        blob,
        "binary keys round-trip"
    );
}

#[test]
fn long_keys_spill_to_heap_storage() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();

    let long_a = "x".repeat(200);
    let long_b = format!("{}{}", "x".repeat(199), "y");
    let long_c = "z".repeat(1000);
    assert!(w.insert(long_a.as_str(), 1).unwrap().1);
    assert!(w.insert(long_b.as_str(), 2).unwrap().1);
    assert!(w.insert(long_c.as_str(), 3).unwrap().1);

    assert_eq!(w.get(&long_a.as_str()).unwrap(), Some(1));
    assert_eq!(w.get(&long_b.as_str()).unwrap(), Some(2));
    assert_eq!(w.get(&long_c.as_str()).unwrap(), Some(3));
    assert_eq!(w.size().unwrap(), 3);

    assert_eq!(w.remove(long_b.as_str()).unwrap(), (true, 2));
    assert_eq!(w.get(&long_a.as_str()).unwrap(), Some(1));
    assert_eq!(w.get(&long_c.as_str()).unwrap(), Some(3));
}

#[test]
fn bounds_and_iterators() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    for i in (0..100u64).map(|i| i * 10) {
        w.insert(i, i).unwrap();
    }
    let v = trie.current(db.area()).unwrap();

    let it = v.lower_bound(&TrieKey::from(250u64)).unwrap();
    assert_eq!(it.key().unwrap().as_u64(), 250);
    let it = v.lower_bound(&TrieKey::from(255u64)).unwrap();
    assert_eq!(it.key().unwrap().as_u64(), 260);
    let it = v.upper_bound(&TrieKey::from(250u64)).unwrap();
    assert_eq!(it.key().unwrap().as_u64(), 260);

    let it = v.lower_bound(&TrieKey::from(10_000u64)).unwrap();
    assert!(!it.valid(), "past-the-end lower bound");

    // Random access by entry number.
    let mut it = v.begin().unwrap();
    it.advance(42);
    assert_eq!(it.entry_num(), 42);
    assert_eq!(it.key().unwrap().as_u64(), 420);
    it.advance(-2);
    assert_eq!(it.key().unwrap().as_u64(), 400);
    it.advance(-1000);
    assert_eq!(it.entry_num(), 0, "advance clamps at the ends");

    let begin = v.begin().unwrap();
    let end = v.end().unwrap();
    assert_eq!(begin.distance_to(&end), 100);

    let found = v.find(&TrieKey::from(500u64)).unwrap().unwrap();
    assert_eq!(found.entry_num(), 50);
    assert_eq!(found.value().unwrap(), 500);
    assert!(v.find(&TrieKey::from(505u64)).unwrap().is_none());
}

#[test]
fn compare_and_swap_and_remove() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    w.insert(1u64, 10).unwrap();

    // Mismatched expectation: reports the current value, changes nothing.
    assert_eq!(w.compare_and_swap(1u64, 99, 11).unwrap(), (true, 10));
    assert_eq!(w.get(&1u64).unwrap(), Some(10));
    // Matched: swaps.
    assert_eq!(w.compare_and_swap(1u64, 10, 11).unwrap(), (true, 10));
    assert_eq!(w.get(&1u64).unwrap(), Some(11));
    // Absent key.
    assert!(!w.compare_and_swap(2u64, 0, 1).unwrap().0);

    assert_eq!(w.compare_and_remove(1u64, 99).unwrap(), (true, 11));
    assert_eq!(w.get(&1u64).unwrap(), Some(11), "mismatch must not remove");
    assert_eq!(w.compare_and_remove(1u64, 11).unwrap(), (true, 11));
    assert_eq!(w.get(&1u64).unwrap(), None);
}

#[test]
fn clear_and_reuse() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    for i in 0..50u64 {
        w.insert(i, i).unwrap();
    }
    w.clear().unwrap();
    assert!(w.is_empty().unwrap());
    assert!(w.insert(1u64, 1).unwrap().1);
    assert_eq!(w.size().unwrap(), 1);
}

#[test]
fn memory_is_reclaimed_after_removal() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let baseline = db.area().node_alloc.bytes_outstanding();

    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..200u64 {
            w.insert(i, i).unwrap();
        }
        for i in 0..200u64 {
            w.remove(i).unwrap();
        }
    }
    // Deferred reclamation runs once the epoch fully drains.
    db.region().gc_lock(1).unwrap().defer_barrier();

    assert_eq!(
        db.area().node_alloc.bytes_outstanding(),
        baseline,
        "all node storage must come back after removal"
    );
}

#[test]
fn multiple_tries_are_independent() {
    let db = db();
    let t1 = db.create_trie(1).unwrap();
    let t2 = db.create_trie(2).unwrap();
    let w1 = t1.mutate(db.area()).unwrap();
    let w2 = t2.mutate(db.area()).unwrap();

    w1.insert(1u64, 100).unwrap();
    w2.insert(1u64, 200).unwrap();
    assert_eq!(w1.get(&1u64).unwrap(), Some(100));
    assert_eq!(w2.get(&1u64).unwrap(), Some(200));
    w1.remove(1u64).unwrap();
    assert_eq!(w2.get(&1u64).unwrap(), Some(200));

    assert!(db.create_trie(1).is_err(), "duplicate trie id");
    assert!(db.trie(9).is_err(), "unallocated trie id");
}

#[test]
fn direct_mem_usage_matches_allocator_accounting() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..300u64 {
            w.insert(i, i).unwrap();
        }
        // Long keys pull in out-of-line key storage too.
        for i in 0..20u64 {
            let key = format!("{}-{i}", "long".repeat(40));
            w.insert(key.as_str(), i).unwrap();
        }
    }
    // Flush the nodes displaced by rebuilds along the way.
    db.region().gc_lock(1).unwrap().defer_barrier();

    let stats = trie.current(db.area()).unwrap().stats().unwrap();
    assert_eq!(
        stats.total_bytes,
        db.area().node_alloc.bytes_outstanding(),
        "per-node direct usage must sum to the allocator's outstanding bytes"
    );
}

#[test]
fn stats_reflect_the_tree() {
    let db = db();
    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    for i in 0..500u64 {
        w.insert(i * 3, i).unwrap();
    }
    let stats = w.stats().unwrap();
    assert_eq!(stats.values, 500);
    assert!(stats.node_count >= 1);
    assert!(stats.total_bytes > 0);
    assert_eq!(stats.max_key_bits, 64);
}
