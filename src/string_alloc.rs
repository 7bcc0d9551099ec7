//! Variable-size allocation with a trie-backed free list.
//!
//! Small blocks delegate to the node allocator. Larger ones carve space
//! from pages obtained through the page allocator; the unallocated tails
//! are tracked in a dedicated trie (`offset -> FreeValue`), where a
//! non-zero order marks the start of an allocated page and bounds
//! coalescing. All free-list updates go through the trie's lock-free CAS
//! primitives, so concurrent allocators interleave safely; a deallocation
//! sweeping an outdated view may merely miss a merge opportunity, which a
//! later deallocation recovers.
//!
//! Every block is laid out `[size: 8 bytes][payload][sentinel 0x5A x1-2]`;
//! the offset handed to callers points just past the size word.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use log::warn;

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::node_alloc::MAX_NODE_SIZE;
use crate::page::{order_for_size, page_size_for_order, Page};
use crate::trie::Trie;
use crate::trie_alloc::MAX_TRIE_ID;

/// The free-list trie lives under the last id of the registry.
pub const FREE_LIST_TRIE_ID: u32 = MAX_TRIE_ID;

const SENTINEL: u8 = 0x5A;

/// A free-list entry's value: `order:3 | size:61`. Entries with a non-zero
/// order are page markers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FreeValue {
    bits: u64,
}

impl FreeValue {
    pub fn new(size: u64, order: i32) -> FreeValue {
        debug_assert!(size < 1 << 61 && (0..8).contains(&order));
        FreeValue {
            bits: (size << 3) | order as u64,
        }
    }

    pub fn from_bits(bits: u64) -> FreeValue {
        FreeValue { bits }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn size(&self) -> u64 {
        self.bits >> 3
    }

    pub fn order(&self) -> i32 {
        (self.bits & 7) as i32
    }

    pub fn is_page_marker(&self) -> bool {
        self.order() != 0
    }

    fn shrunk_by(&self, amount: u64) -> FreeValue {
        FreeValue::new(self.size() - amount, self.order())
    }
}

/// Size as stored: payload + 8-byte header + sentinels, padded to even.
fn adjust_string_size(size: u64) -> (u64, u64) {
    let with_header = size + 8;
    let sentinel_bytes = if with_header & 1 != 0 { 1 } else { 2 };
    (with_header + sentinel_bytes, sentinel_bytes)
}

pub struct StringAllocator {
    free_list: Trie,
    bytes_allocated: AtomicU64,
    bytes_deallocated: AtomicU64,
    /// Free-list bytes we hold that the page allocator thinks are in use.
    bytes_private: AtomicI64,
}

impl StringAllocator {
    pub fn new(free_list: Trie) -> StringAllocator {
        StringAllocator {
            free_list,
            bytes_allocated: AtomicU64::new(0),
            bytes_deallocated: AtomicU64::new(0),
            bytes_private: AtomicI64::new(0),
        }
    }

    pub fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn bytes_deallocated(&self) -> u64 {
        self.bytes_deallocated.load(Ordering::Relaxed)
    }

    pub fn bytes_outstanding(&self) -> u64 {
        self.bytes_allocated() - self.bytes_deallocated()
    }

    pub fn bytes_private(&self) -> i64 {
        self.bytes_private.load(Ordering::Relaxed)
    }

    /// Size of the string at `offset` (as requested at allocation).
    pub fn string_size(&self, area: &MemoryAllocator, offset: u64) -> Result<u64> {
        area.region()
            .pinned(|| Ok(unsafe { area.region().at::<u64>(offset - 8)?.read_unaligned() }))
    }

    /// Write the header and sentinels; returns the caller-visible offset.
    fn pack(
        &self,
        area: &MemoryAllocator,
        offset: u64,
        size: u64,
        sentinel_bytes: u64,
    ) -> Result<u64> {
        area.region().pinned(|| {
            unsafe {
                area.region().at::<u64>(offset)?.write_unaligned(size);
                let s = area.region().bytes(offset + 8 + size, sentinel_bytes)?;
                std::ptr::write_bytes(s, SENTINEL, sentinel_bytes as usize);
            }
            Ok(offset + 8)
        })
    }

    /// Read back the header and verify the sentinels; returns the block
    /// offset and adjusted size.
    fn unpack(
        &self,
        area: &MemoryAllocator,
        offset: u64,
        expected_size: Option<u64>,
    ) -> Result<(u64, u64)> {
        area.region().pinned(|| {
            let block = offset - 8;
            let size = unsafe { area.region().at::<u64>(block)?.read_unaligned() };
            if let Some(expected) = expected_size {
                if expected != size {
                    return Err(Error::Logical("string size does not match its header"));
                }
            }
            let (adj, sentinel_bytes) = adjust_string_size(size);
            let s = area.region().bytes(block + adj - sentinel_bytes, sentinel_bytes)?;
            for i in 0..sentinel_bytes as usize {
                if unsafe { *s.add(i) } != SENTINEL {
                    return Err(Error::Integrity {
                        offset,
                        detail: "string overflow detected (sentinel clobbered)",
                    });
                }
            }
            Ok((block, adj))
        })
    }

    /// Allocate `size` bytes; the returned offset points at the payload.
    pub fn allocate(&self, area: &MemoryAllocator, size: u64, hint: Option<u64>) -> Result<u64> {
        let (adj, sentinel_bytes) = adjust_string_size(size);

        if adj < MAX_NODE_SIZE {
            let offset = area.node_alloc.allocate(adj, hint)?;
            return self.pack(area, offset, size, sentinel_bytes);
        }

        // First fit from the back of the free list: newer pages sort last,
        // so their tails are preferred.
        for _attempt in 0..2 {
            let current = self.free_list.mutate(area)?;
            let entries = current.to_vec()?;

            let Some(fit) = entries
                .iter()
                .rev()
                .find(|(_, bits)| FreeValue::from_bits(*bits).size() >= adj)
            else {
                break;
            };
            let free_offset = fit.0.as_u64();
            let mut free_value = FreeValue::from_bits(fit.1);

            loop {
                // Carve from the back: the entry's offset is its key and
                // can't move, so only the size shrinks.
                let new_value = free_value.shrunk_by(adj);
                let (key_found, old_bits) =
                    current.compare_and_swap(free_offset, free_value.bits(), new_value.bits())?;

                // The block was merged away under us; rescan.
                if !key_found {
                    break;
                }
                if old_bits == free_value.bits() {
                    self.bytes_allocated.fetch_add(adj, Ordering::Relaxed);
                    self.bytes_private.fetch_sub(adj as i64, Ordering::Relaxed);
                    return self.pack(area, free_offset + new_value.size(), size, sentinel_bytes);
                }

                // Someone beat us to it; retry while there's still room.
                free_value = FreeValue::from_bits(old_bits);
                if free_value.size() < adj {
                    break;
                }
            }
        }

        // Nothing fits: back a fresh page and record its tail.
        let order = order_for_size(adj);
        let page = area.region().pinned(|| area.page_alloc.allocate_page(order))?;
        let free_value = FreeValue::new(page_size_for_order(order) - adj, order);

        let current = self.free_list.mutate(area)?;
        let (_, inserted) = current.insert(page.offset, free_value.bits())?;
        if !inserted {
            return Err(Error::Integrity {
                offset: page.offset,
                detail: "fresh page already had a free-list entry",
            });
        }

        self.bytes_allocated.fetch_add(adj, Ordering::Relaxed);
        self.bytes_private
            .fetch_add(free_value.size() as i64, Ordering::Relaxed);
        self.pack(area, page.offset + free_value.size(), size, sentinel_bytes)
    }

    /// Free the string at `offset`, coalescing with free neighbours and
    /// returning fully reassembled pages to the page allocator.
    pub fn deallocate(
        &self,
        area: &MemoryAllocator,
        offset: u64,
        expected_size: Option<u64>,
    ) -> Result<()> {
        let (block, adj) = self.unpack(area, offset, expected_size)?;

        if adj < MAX_NODE_SIZE {
            return area.node_alloc.deallocate(block, adj);
        }

        let current = self.free_list.mutate(area)?;
        let mut new_offset = block;
        let mut new_size = adj;

        // Sweep right: swallow adjacent free blocks until a page marker or
        // a gap.
        loop {
            let next_offset = new_offset + new_size;
            let Some(bits) = current.get(&next_offset)? else {
                break;
            };
            let next = FreeValue::from_bits(bits);
            if next.is_page_marker() {
                break;
            }
            // Removing by key is safe even when the value raced: the
            // offset identifies the same block.
            let (found, removed_bits) = current.remove(next_offset)?;
            if !found {
                break;
            }
            new_size += FreeValue::from_bits(removed_bits).size();
        }

        // Sweep left: merge at most one adjacent predecessor, remembering
        // the page marker when that's what it is.
        let mut page_offset = 0u64;
        let mut page_value = FreeValue::new(0, 0);
        let entries = current.to_vec()?;
        let idx = entries.partition_point(|(k, _)| k.as_u64() < new_offset);
        if idx > 0 {
            let (prev_key, prev_bits) = &entries[idx - 1];
            let prev_offset = prev_key.as_u64();
            let prev = FreeValue::from_bits(*prev_bits);
            if prev_offset + prev.size() == new_offset {
                let (found, old_bits) = current.compare_and_remove(prev_offset, prev.bits())?;
                if found && old_bits == prev.bits() {
                    if prev.is_page_marker() {
                        page_offset = prev_offset;
                        page_value = prev;
                    }
                    new_offset = prev_offset;
                    new_size += prev.size();
                }
            }
        }

        // Publish: a fully reassembled page goes back to the page
        // allocator, anything else becomes one consolidated entry.
        let page_order_size = page_size_for_order(page_value.order());
        if page_offset != 0 && new_size == page_order_size {
            self.bytes_private
                .fetch_sub((page_order_size - adj) as i64, Ordering::Relaxed);
            area.region().pinned(|| {
                area.page_alloc
                    .deallocate_page(Page::new(page_offset, page_value.order()))
            })?;
        } else {
            let order = if page_offset != 0 { page_value.order() } else { 0 };
            let value = FreeValue::new(new_size, order);
            let (_, inserted) = current.insert(new_offset, value.bits())?;
            if !inserted {
                warn!("free-list entry for 0x{new_offset:x} already present; leaking the block");
            }
            self.bytes_private.fetch_add(adj as i64, Ordering::Relaxed);
        }

        self.bytes_deallocated.fetch_add(adj, Ordering::Relaxed);
        Ok(())
    }

    /// Dump the free list (debugging aid).
    pub fn dump_free_list(&self, area: &MemoryAllocator) -> Result<String> {
        use std::fmt::Write;
        let current = self.free_list.current(area)?;
        let mut out = String::new();
        for (key, bits) in current.to_vec()? {
            let v = FreeValue::from_bits(bits);
            let _ = writeln!(
                out,
                "0x{:x}: size={} order={}",
                key.as_u64(),
                v.size(),
                v.order()
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_value_packing() {
        let v = FreeValue::new(123456, 3);
        assert_eq!(v.size(), 123456);
        assert_eq!(v.order(), 3);
        assert!(v.is_page_marker());
        assert_eq!(FreeValue::from_bits(v.bits()), v);
        assert!(!FreeValue::new(10, 0).is_page_marker());
        assert_eq!(v.shrunk_by(456).size(), 123000);
        assert_eq!(v.shrunk_by(456).order(), 3);
    }

    #[test]
    fn size_adjustment_is_even() {
        for size in 0..64u64 {
            let (adj, sentinels) = adjust_string_size(size);
            assert_eq!(adj % 2, 0, "size {size}");
            assert!(sentinels == 1 || sentinels == 2);
            assert_eq!(adj, size + 8 + sentinels);
        }
    }
}
