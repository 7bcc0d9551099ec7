//! Concurrent writers and readers over one trie.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mmap_trie::MmapFile;

#[test]
fn parallel_disjoint_inserts() {
    let db = Arc::new(MmapFile::anonymous(0).unwrap());
    let trie = db.create_trie(1).unwrap();

    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 200;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let w = trie.mutate(db.area()).unwrap();
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                let (_, inserted) = w.insert(key, key * 10).unwrap();
                assert!(inserted, "thread {t} inserting {key}");
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), THREADS * PER_THREAD);
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(v.get(&key).unwrap(), Some(key * 10), "key {key}");
    }
}

#[test]
fn racing_inserts_of_the_same_keys() {
    let db = Arc::new(MmapFile::anonymous(0).unwrap());
    let trie = db.create_trie(1).unwrap();

    const KEYS: u64 = 100;
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let w = trie.mutate(db.area()).unwrap();
            let mut wins = 0;
            for key in 0..KEYS {
                if w.insert(key, t).unwrap().1 {
                    wins += 1;
                }
            }
            wins
        }));
    }
    let total_wins: u64 = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>().iter().sum();
    assert_eq!(total_wins, KEYS, "each key is inserted exactly once");

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), KEYS);
    for key in 0..KEYS {
        assert!(v.get(&key).unwrap().unwrap() < 4);
    }
}

#[test]
fn readers_see_consistent_snapshots_during_writes() {
    let db = Arc::new(MmapFile::anonymous(0).unwrap());
    let trie = db.create_trie(1).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    const N: u64 = 400;

    let writer = {
        let db = db.clone();
        std::thread::spawn(move || {
            let w = trie.mutate(db.area()).unwrap();
            for i in 0..N {
                w.insert(i, i).unwrap();
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..3 {
        let db = db.clone();
        let stop = stop.clone();
        readers.push(std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                // Each version is one immutable snapshot: its contents must
                // be internally consistent no matter what the writer does.
                let v = trie.current(db.area()).unwrap();
                let size = v.size().unwrap();
                let all = v.to_vec().unwrap();
                assert_eq!(all.len() as u64, size);
                for w in all.windows(2) {
                    assert!(w[0].0 < w[1].0, "iteration out of order");
                }
                for (k, val) in &all {
                    assert_eq!(k.as_u64(), *val);
                }
            }
        }));
    }

    writer.join().unwrap();
    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), N);
}

#[test]
fn concurrent_removals_remove_each_key_once() {
    let db = Arc::new(MmapFile::anonymous(0).unwrap());
    let trie = db.create_trie(1).unwrap();
    {
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..300u64 {
            w.insert(i, i).unwrap();
        }
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let w = trie.mutate(db.area()).unwrap();
            let mut removed = 0u64;
            for i in 0..300u64 {
                if w.remove(i).unwrap().0 {
                    removed += 1;
                }
            }
            removed
        }));
    }
    let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 300, "every key removed exactly once across threads");
    assert!(trie.current(db.area()).unwrap().is_empty().unwrap());
}

#[test]
fn string_allocator_is_safe_under_contention() {
    let db = Arc::new(MmapFile::anonymous(0).unwrap());

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            let area = db.area();
            let mut blocks = Vec::new();
            for i in 0..40u64 {
                let size = 4096 + (i % 7) * 512;
                let offset = area.allocate_string(size).unwrap();
                area.region()
                    .pinned(|| {
                        let p = area.region().bytes(offset, size)?;
                        unsafe { std::ptr::write_bytes(p, t, size as usize) };
                        Ok(())
                    })
                    .unwrap();
                blocks.push((offset, size));
            }
            // Verify nobody scribbled over our blocks, then free them.
            for (offset, size) in blocks {
                area.region()
                    .pinned(|| {
                        let p = area.region().bytes(offset, size)?;
                        for j in 0..size as usize {
                            assert_eq!(unsafe { *p.add(j) }, t);
                        }
                        Ok(())
                    })
                    .unwrap();
                area.deallocate_string(offset).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(db.area().string_alloc.bytes_outstanding(), 0);
}
