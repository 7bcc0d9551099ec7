//! Page tables: the 4 KiB control structure describing 1024 subpages.
//!
//! Each page of order k+1 has a page table for its 1024 order-k subpages,
//! living at a fixed offset inside the page itself (see
//! [`crate::page_alloc`]). A table tracks which subpages are allocated,
//! their type byte, which ones (transitively) still contain a free page of
//! each order, and which ones still contain a free node-allocator slot of
//! each size class.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::bitmap::FullBitmap;
use crate::page::PageType;

pub const PT_MAGIC: u64 = 0x1293847673827334;

/// Number of node-allocator size classes tracked per table.
pub const NUM_SIZE_CLASSES: usize = 11;

#[repr(C)]
pub struct PageTable {
    magic: u64,
    order: u32,
    unused: u32,

    /// Which of our 1024 subpages are allocated.
    pub allocated: FullBitmap<16>,

    /// Type byte of each subpage.
    types: [u8; 1024],

    /// Bit clear when the subpage (transitively) contains a free page of
    /// order 1..=4. Initialized full: a fresh page offers nothing until it
    /// is split.
    pub full_levels: [FullBitmap<16>; 4],

    /// Bit clear when the subpage (transitively) contains a free node slot
    /// of the given size-class ordinal.
    pub full_nodes: [FullBitmap<16>; NUM_SIZE_CLASSES],
}

const _: () = assert!(std::mem::size_of::<PageTable>() <= 4096);

impl PageTable {
    /// Initialize in place for a table describing pages of `order`.
    pub fn init(&mut self, order: i32) {
        unsafe {
            std::ptr::write_bytes(
                self as *mut PageTable as *mut u8,
                0,
                std::mem::size_of::<PageTable>(),
            )
        };
        self.magic = PT_MAGIC;
        self.order = order as u32;
        self.allocated.init(1024, false);
        for bm in self.full_levels.iter_mut() {
            bm.init(1024, true);
        }
        for bm in self.full_nodes.iter_mut() {
            bm.init(1024, true);
        }
    }

    pub fn valid(&self) -> bool {
        self.magic == PT_MAGIC
    }

    pub fn order(&self) -> i32 {
        self.order as i32
    }

    fn type_byte(&self, page_num: u32) -> &AtomicU8 {
        unsafe { AtomicU8::from_ptr(&self.types[page_num as usize] as *const u8 as *mut u8) }
    }

    pub fn set_type(&self, page_num: u32, t: PageType) {
        assert!(page_num < 1024, "set_type: invalid page number");
        self.type_byte(page_num).store(t as u8, Ordering::Release);
    }

    pub fn get_type(&self, page_num: u32) -> PageType {
        assert!(page_num < 1024);
        PageType::from_byte(self.type_byte(page_num).load(Ordering::Acquire))
            .unwrap_or(PageType::Empty)
    }

    pub fn subpage_is_split(&self, page_num: u32) -> bool {
        self.get_type(page_num).is_split()
    }

    /// Allocate a free subpage. Returns `(page_num, became_full)`.
    pub fn allocate(&self, start_at: u32) -> Option<(u32, bool)> {
        self.allocated.allocate(start_at)
    }

    /// Mark a specific subpage allocated during initialization. Panics if
    /// the reservation fills the table (never legitimate at init time).
    pub fn reserve(&self, page_num: u32) {
        let filled = self.allocated.mark_allocated(page_num);
        assert!(!filled, "reserving a page filled the table");
    }

    /// Record that subpage `page_num` no longer holds any free page of
    /// `order`. Returns true when the relevant bitmap became full and the
    /// next level up must be updated too.
    pub fn mark_allocated(&self, page_num: u32, order: i32) -> bool {
        assert!(
            order >= 1 && (order as u32) < self.order,
            "mark_allocated at the page's own order goes through allocate()"
        );
        self.full_levels[order as usize - 1].mark_allocated(page_num)
    }

    /// Record that subpage `page_num` contains (transitively) a free page of
    /// `order`. When `order` equals this table's order the allocation bit
    /// itself is cleared; otherwise the per-order summary is. Returns true
    /// when the parent table must be updated as well.
    pub fn mark_deallocated(&self, page_num: u32, order: i32) -> bool {
        if order as u32 == self.order {
            self.set_type(page_num, PageType::Empty);
            debug_assert!(self.allocated.is_allocated(page_num));
            return self.allocated.mark_deallocated(page_num);
        }
        self.full_levels[order as usize - 1].mark_deallocated(page_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(order: i32) -> Box<PageTable> {
        let mut pt: Box<PageTable> = Box::new(unsafe { std::mem::zeroed() });
        pt.init(order);
        pt
    }

    #[test]
    fn init_state() {
        let pt = fresh(2);
        assert!(pt.valid());
        assert_eq!(pt.order(), 2);
        assert_eq!(pt.allocated.num_full(), 0);
        for i in 0..4 {
            assert_eq!(pt.full_levels[i].num_full(), 1024);
        }
        assert_eq!(pt.get_type(0), PageType::Empty);
    }

    #[test]
    fn allocate_and_types() {
        let pt = fresh(1);
        let (n, full) = pt.allocate(0).unwrap();
        assert!(!full);
        pt.set_type(n, PageType::Arena64);
        assert_eq!(pt.get_type(n), PageType::Arena64);
        assert!(!pt.mark_deallocated(n, 1));
        assert_eq!(pt.get_type(n), PageType::Empty);
    }

    #[test]
    fn level_summaries_propagate() {
        let pt = fresh(3);
        // A split subpage advertises free order-1 pages below it.
        assert!(pt.mark_deallocated(5, 1), "first free page flips the summary");
        assert!(!pt.mark_deallocated(6, 1));
        assert!(!pt.mark_allocated(5, 1));
        assert!(pt.mark_allocated(6, 1), "last free page flips it back");
    }
}
