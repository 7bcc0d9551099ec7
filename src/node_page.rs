//! A 4 KiB page subdivided into fixed-size slots.
//!
//! The page's own header (magic, slot size and the fullness bitmap) sits in
//! the first few slots, which are pre-marked allocated so the slot indexes
//! stay uniform. Everything is driven through the shared [`FullBitmap`], so
//! slot allocation within a page is lock free.

use crate::bitmap::FullBitmap;
use crate::error::{Error, Result};
use crate::page::PAGE_SIZE;

pub const NODE_PAGE_MAGIC: u32 = 0xDC0B8326;

/// Header at the start of every node page. The bitmap is sized for the
/// smallest slot class (4096 / 8 = 512 slots).
#[repr(C)]
pub struct NodePage {
    magic: u32,
    node_size: u32,
    full: FullBitmap<8>,
}

impl NodePage {
    pub fn num_nodes(node_size: u32) -> u32 {
        PAGE_SIZE as u32 / node_size
    }

    /// Slots consumed by this header for the given slot size.
    pub fn metadata_nodes(node_size: u32) -> u32 {
        let md = std::mem::size_of::<NodePage>() as u32;
        (md + node_size - 1) / node_size
    }

    pub fn init(&mut self, node_size: u32) {
        self.magic = NODE_PAGE_MAGIC;
        self.node_size = node_size;
        self.full.init(Self::num_nodes(node_size), false);
        for i in 0..Self::metadata_nodes(node_size) {
            self.full.mark_allocated(i);
        }
    }

    pub fn valid(&self, node_size: u32) -> bool {
        self.magic == NODE_PAGE_MAGIC && self.node_size == node_size
    }

    /// Allocate a slot. Returns `(byte offset within the page, became_full)`
    /// or `None` when the page is full.
    pub fn allocate(&self) -> Result<Option<(u64, bool)>> {
        let Some((entry, now_full)) = self.full.allocate(0) else {
            return Ok(None);
        };
        if entry < Self::metadata_nodes(self.node_size) {
            return Err(Error::Integrity {
                offset: 0,
                detail: "allocated a header slot of a node page",
            });
        }
        Ok(Some((entry as u64 * self.node_size as u64, now_full)))
    }

    /// Mark a specific slot allocated. Returns `(offset, became_full)`.
    pub fn mark_allocated(&self, entry: u32) -> (u64, bool) {
        let now_full = self.full.mark_allocated(entry);
        (entry as u64 * self.node_size as u64, now_full)
    }

    pub fn is_allocated(&self, entry: u32) -> bool {
        self.full.is_allocated(entry)
    }

    pub fn entry_offset(&self, entry: u32) -> u64 {
        entry as u64 * self.node_size as u64
    }

    pub fn num_allocated(&self) -> u32 {
        self.full.num_full()
    }

    /// Free the slot at the given byte offset within the page. Returns true
    /// when the page transitioned from full to not-full.
    pub fn deallocate(&self, offset: u64) -> Result<bool> {
        let size = self.node_size as u64;
        let entry = offset / size;
        if entry * size != offset
            || entry < Self::metadata_nodes(self.node_size) as u64
            || entry >= Self::num_nodes(self.node_size) as u64
        {
            return Err(Error::Logical("node page free of an invalid slot"));
        }
        if !self.full.is_allocated(entry as u32) {
            return Err(Error::Logical("double free of a node page slot"));
        }
        Ok(self.full.mark_deallocated(entry as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(size: u32) -> Box<NodePage> {
        let mut p: Box<NodePage> = Box::new(unsafe { std::mem::zeroed() });
        p.init(size);
        p
    }

    #[test]
    fn header_slots_are_reserved() {
        for size in [8u32, 12, 64, 256] {
            let p = fresh(size);
            assert!(p.valid(size));
            let md = NodePage::metadata_nodes(size);
            for i in 0..md {
                assert!(p.is_allocated(i), "size {size} header slot {i}");
            }
            let (off, _) = p.allocate().unwrap().unwrap();
            assert_eq!(off, md as u64 * size as u64);
        }
    }

    #[test]
    fn fill_free_refill() {
        let p = fresh(64);
        let capacity = NodePage::num_nodes(64) - NodePage::metadata_nodes(64);
        let mut last = 0;
        for i in 0..capacity {
            let (off, full) = p.allocate().unwrap().unwrap();
            assert_eq!(full, i == capacity - 1);
            last = off;
        }
        assert!(p.allocate().unwrap().is_none());
        assert!(p.deallocate(last).unwrap());
        assert!(p.deallocate(last).is_err(), "double free must be caught");
        let (off, full) = p.allocate().unwrap().unwrap();
        assert_eq!(off, last);
        assert!(full);
    }

    #[test]
    fn bad_offsets_rejected() {
        let p = fresh(64);
        assert!(p.deallocate(63).is_err(), "unaligned");
        assert!(p.deallocate(0).is_err(), "header slot");
        assert!(p.deallocate(PAGE_SIZE).is_err(), "past the end");
    }
}
