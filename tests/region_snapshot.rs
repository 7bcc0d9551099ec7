//! File-backed regions: reopening, snapshots, growth and permissions.

use mmap_trie::{MmapFile, Permissions, ResMode, TrieKey};
use rand::prelude::*;

#[test]
fn create_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.mmap");

    {
        let db = MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).unwrap();
        let trie = db.create_trie(1).unwrap();
        let w = trie.mutate(db.area()).unwrap();
        for i in 0..100u64 {
            w.insert(i, i * 2).unwrap();
        }
        db.snapshot().unwrap();
    }

    let db = MmapFile::open(&path, ResMode::Open, Permissions::READ_WRITE, 0).unwrap();
    let trie = db.trie(1).unwrap();
    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.size().unwrap(), 100);
    for i in 0..100u64 {
        assert_eq!(v.get(&i).unwrap(), Some(i * 2));
    }
}

#[test]
fn open_modes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("modes.mmap");

    assert!(
        MmapFile::open(&path, ResMode::Open, Permissions::READ_WRITE, 0).is_err(),
        "Open on a missing file"
    );
    {
        let db =
            MmapFile::open(&path, ResMode::CreateOpen, Permissions::READ_WRITE, 0).unwrap();
        db.create_trie(1).unwrap();
        db.snapshot().unwrap();
    }
    assert!(
        MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).is_err(),
        "Create on an existing file"
    );
    let db = MmapFile::open(&path, ResMode::CreateOpen, Permissions::READ_WRITE, 0).unwrap();
    assert!(db.trie(1).is_ok(), "CreateOpen preserves existing state");
}

#[test]
fn snapshot_round_trips_random_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.mmap");
    let mut rng = StdRng::seed_from_u64(0xDA5DB);

    let mut expect: Vec<(u64, u64)> = (0..5000)
        .map(|_| (rng.gen::<u64>(), rng.gen::<u64>()))
        .collect();
    expect.sort_unstable();
    expect.dedup_by_key(|(k, _)| *k);

    {
        let db = MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).unwrap();
        let trie = db.create_trie(3).unwrap();
        let w = trie.mutate(db.area()).unwrap();
        for (k, v) in &expect {
            assert!(w.insert(*k, *v).unwrap().1);
        }
        let written = db.snapshot().unwrap();
        assert!(written > 0);
    }

    let db = MmapFile::open(&path, ResMode::Open, Permissions::READ_WRITE, 0).unwrap();
    let trie = db.trie(3).unwrap();
    let v = trie.current(db.area()).unwrap();
    let got = v.to_vec().unwrap();
    assert_eq!(got.len(), expect.len());
    for ((gk, gv), (ek, ev)) in got.iter().zip(expect.iter()) {
        assert_eq!(gk.as_u64(), *ek);
        assert_eq!(gv, ev);
    }

    // The reopened trie checks clean.
    let report = mmap_trie::check::check(&v).unwrap();
    assert!(report.is_clean(), "faults: {:?}", report.errors);
    assert_eq!(report.valid_entries, expect.len() as u64);
}

#[test]
fn region_grows_under_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.mmap");
    let db = MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).unwrap();
    let initial = db.region().len();

    let trie = db.create_trie(1).unwrap();
    let w = trie.mutate(db.area()).unwrap();
    // Push enough long-string keys through to outgrow the initial mapping.
    for i in 0..2000u64 {
        let key = format!("key-{i:06}-{}", "pad".repeat(20));
        w.insert(key.as_str(), i).unwrap();
    }
    assert!(db.region().len() >= initial);
    assert_eq!(w.size().unwrap(), 2000);

    // Spot check after growth: offsets derived before stay valid.
    for i in (0..2000u64).step_by(97) {
        let key = format!("key-{i:06}-{}", "pad".repeat(20));
        assert_eq!(w.get(&key.as_str()).unwrap(), Some(i));
    }
}

#[test]
fn read_only_open_can_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.mmap");
    {
        let db = MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).unwrap();
        let trie = db.create_trie(1).unwrap();
        let w = trie.mutate(db.area()).unwrap();
        w.insert(5u64, 50).unwrap();
        db.snapshot().unwrap();
    }
    let db = MmapFile::open(&path, ResMode::Open, Permissions::READ, 0).unwrap();
    let trie = db.trie(1).unwrap();
    let v = trie.current(db.area()).unwrap();
    assert_eq!(v.get(&5u64).unwrap(), Some(50));
}

#[test]
fn anonymous_regions_refuse_snapshots() {
    let db = MmapFile::anonymous(0).unwrap();
    assert!(db.snapshot().is_err());
}

#[test]
fn unlink_removes_backing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone.mmap");
    let db = MmapFile::open(&path, ResMode::Create, Permissions::READ_WRITE, 0).unwrap();
    assert!(path.exists());
    db.unlink().unwrap();
    assert!(!path.exists());
}

#[test]
fn keys_survive_as_trie_keys() {
    // Numeric order is bit-string order after the big-endian swap.
    let mut keys: Vec<u64> = vec![0, 1, 255, 256, 65535, 1 << 32, u64::MAX];
    let mut frags: Vec<_> = keys.iter().map(|k| TrieKey::from(*k).to_fragment()).collect();
    frags.sort();
    keys.sort_unstable();
    let back: Vec<u64> = frags
        .iter()
        .map(|f| TrieKey::from_fragment(f).as_u64())
        .collect();
    assert_eq!(back, keys);
}
