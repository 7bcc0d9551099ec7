//! Page, node and string allocator behaviour.

use mmap_trie::page::{page_size_for_order, PageType, PAGE_SIZE};
use mmap_trie::MmapFile;

#[test]
fn page_allocation_is_aligned_and_reusable() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let pa = area.page_alloc.clone();

    area.region()
        .pinned(|| {
            let p1 = pa.allocate_page(1)?;
            let p2 = pa.allocate_page(1)?;
            assert_ne!(p1.offset, p2.offset);
            assert_eq!(p1.offset % PAGE_SIZE, 0);
            assert_eq!(p2.offset % PAGE_SIZE, 0);

            pa.deallocate_page(p1)?;
            let p3 = pa.allocate_page(1)?;
            assert_eq!(p3.offset, p1.offset, "freed page is reused first");
            Ok(())
        })
        .unwrap();
}

#[test]
fn higher_order_pages() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let pa = area.page_alloc.clone();

    area.region()
        .pinned(|| {
            let p = pa.allocate_page_of_type(2, PageType::Page4M)?;
            assert_eq!(p.order, 2);
            assert_eq!(p.offset % page_size_for_order(2), 0, "4 MiB alignment");
            // The page is fully backed.
            assert!(area.region().len() >= p.end_offset());
            pa.deallocate_page(p)?;
            Ok(())
        })
        .unwrap();
}

#[test]
fn node_slots_round_trip_every_size_class() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let na = &area.node_alloc;
    let baseline = na.bytes_outstanding();

    area.region()
        .pinned(|| {
            let mut blocks = Vec::new();
            for &size in &[8u64, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256] {
                for _ in 0..10 {
                    let offset = na.allocate(size, None)?;
                    assert_eq!(offset % 8, 0, "slots are at least 8-byte aligned");
                    // Slots must be writable over their whole extent.
                    let p = area.region().bytes(offset, size)?;
                    unsafe { std::ptr::write_bytes(p, 0xCD, size as usize) };
                    blocks.push((offset, size));
                }
            }
            // No overlap between any two live slots.
            for (i, (o1, s1)) in blocks.iter().enumerate() {
                for (o2, s2) in blocks.iter().skip(i + 1) {
                    assert!(
                        o1 + s1 <= *o2 || o2 + s2 <= *o1,
                        "slots overlap: {o1:#x}+{s1} and {o2:#x}+{s2}"
                    );
                }
            }
            for (offset, size) in blocks {
                na.deallocate(offset, size)?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(na.bytes_outstanding(), baseline);
}

#[test]
fn odd_sizes_round_up_to_a_class() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    area.region()
        .pinned(|| {
            let o = area.node_alloc.allocate(9, None)?;
            area.node_alloc.deallocate(o, 9)?;
            assert!(area.node_alloc.allocate(257, None).is_err());
            Ok(())
        })
        .unwrap();
}

#[test]
fn small_strings_round_trip() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();

    let mut strings = Vec::new();
    for len in [1u64, 7, 16, 100, 200] {
        let offset = area.allocate_string(len).unwrap();
        assert_eq!(area.string_size(offset).unwrap(), len);
        area.region()
            .pinned(|| {
                let p = area.region().bytes(offset, len)?;
                unsafe { std::ptr::write_bytes(p, b'x', len as usize) };
                Ok(())
            })
            .unwrap();
        strings.push(offset);
    }
    for offset in strings {
        area.deallocate_string(offset).unwrap();
    }
}

#[test]
fn string_overflow_is_detected() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let offset = area.allocate_string(32).unwrap();
    // Clobber the sentinel right past the payload.
    area.region()
        .pinned(|| {
            let p = area.region().bytes(offset + 32, 1)?;
            unsafe { *p = 0xEE };
            Ok(())
        })
        .unwrap();
    assert!(
        area.deallocate_string(offset).is_err(),
        "clobbered sentinel must fail the free"
    );
}

#[test]
fn large_strings_coalesce_back_into_pages() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let sa = &area.string_alloc;

    const N: usize = 20;
    const SIZE: u64 = 8 * 1024;

    let mut blocks = Vec::new();
    for i in 0..N {
        let offset = area.allocate_string(SIZE).unwrap();
        area.region()
            .pinned(|| {
                let p = area.region().bytes(offset, SIZE)?;
                unsafe { std::ptr::write_bytes(p, i as u8, SIZE as usize) };
                Ok(())
            })
            .unwrap();
        blocks.push(offset);
    }
    assert_eq!(sa.bytes_outstanding(), N as u64 * (SIZE + 8 + 2));

    // Payloads stay intact while neighbours come and go.
    for (i, offset) in blocks.iter().enumerate() {
        area.region()
            .pinned(|| {
                let p = area.region().bytes(*offset, SIZE)?;
                for j in 0..SIZE as usize {
                    assert_eq!(unsafe { *p.add(j) }, i as u8);
                }
                Ok(())
            })
            .unwrap();
    }

    // Free in interleaved order: evens, then odds.
    for offset in blocks.iter().step_by(2) {
        area.deallocate_string(*offset).unwrap();
    }
    for offset in blocks.iter().skip(1).step_by(2) {
        area.deallocate_string(*offset).unwrap();
    }

    assert_eq!(sa.bytes_outstanding(), 0);
    assert_eq!(
        sa.bytes_private(),
        0,
        "a fully freed page must go back to the page allocator"
    );
    let leftovers = sa.dump_free_list(area).unwrap();
    assert!(
        leftovers.is_empty(),
        "free list should be empty after full coalescing, got:\n{leftovers}"
    );
}

#[test]
fn accounting_aggregates() {
    let db = MmapFile::anonymous(0).unwrap();
    let area = db.area();
    let before = area.bytes_outstanding();
    let offset = area.allocate_string(5000).unwrap();
    assert!(area.bytes_outstanding() > before);
    area.deallocate_string(offset).unwrap();
    assert_eq!(area.bytes_outstanding(), before);
}
