//! Lock-free allocator for aligned fixed-size node slots.
//!
//! Sizes are rounded up to one of eleven classes between 8 and 256 bytes.
//! Each class has its own arena pages ([`crate::node_page::NodePage`]) and
//! its own 4-level tree of "contains a free slot of this size" bits inside
//! the page tables, so finding a slot is a handful of lock-free bit scans.
//! When the walk comes up empty a fresh arena page is allocated from the
//! page allocator and advertised up the tree.
//!
//! With the `sentinels` feature each logical slot triples its physical
//! size; the flanks are filled with 0xA5 / 0x5A and verified on free. This
//! changes the file format and is for debugging only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::node_page::NodePage;
use crate::page::{Page, PageType};
use crate::page_alloc::PageTableAllocator;

/// Supported slot sizes. Index in this table is the size-class ordinal used
/// by the page tables' `full_nodes` bitmaps and the `Arena*` page types.
pub const NODE_SIZES: [u32; 11] = [8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256];

pub const NODE_ALLOC_SENTINELS: bool = cfg!(feature = "sentinels");

/// Largest size the node allocator serves; bigger blocks go to the string
/// allocator's page-based path.
pub const MAX_NODE_SIZE: u64 = if NODE_ALLOC_SENTINELS { 64 } else { 256 };

const SENTINEL_FRONT: u8 = 0xA5;
const SENTINEL_BACK: u8 = 0x5A;

/// Round `size` up to the smallest supported class.
pub fn adjust_size(size: u64) -> Result<u64> {
    for s in NODE_SIZES {
        if size <= s as u64 {
            return Ok(s as u64);
        }
    }
    Err(Error::Logical("node allocation larger than the largest size class"))
}

/// Ordinal of an exact class size.
pub fn size_ordinal(size: u64) -> Result<usize> {
    NODE_SIZES
        .iter()
        .position(|&s| s as u64 == size)
        .ok_or(Error::Logical("invalid node size class"))
}

pub struct NodeAllocator {
    page_alloc: Arc<PageTableAllocator>,
    bytes_allocated: AtomicU64,
    bytes_deallocated: AtomicU64,
}

impl NodeAllocator {
    pub fn new(page_alloc: Arc<PageTableAllocator>) -> NodeAllocator {
        NodeAllocator {
            page_alloc,
            bytes_allocated: AtomicU64::new(0),
            bytes_deallocated: AtomicU64::new(0),
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

    fn node_page(&self, page: Page, size: u64) -> Result<&NodePage> {
        debug_assert_eq!(page.order, 1);
        let np = unsafe { &*self.page_alloc.region().at::<NodePage>(page.offset)? };
        if !np.valid(size as u32) {
            return Err(Error::Integrity {
                offset: page.offset,
                detail: "node page magic or slot size mismatch",
            });
        }
        Ok(np)
    }

    /// Allocate an aligned slot of at least `size` bytes (8..=256 without
    /// sentinels). The optional hint biases the table walk start for
    /// locality; `None` means no preference.
    pub fn allocate(&self, size: u64, hint: Option<u64>) -> Result<u64> {
        let (size, user_size) = if NODE_ALLOC_SENTINELS {
            (adjust_size(size.checked_mul(3).unwrap())?, size)
        } else {
            (adjust_size(size)?, size)
        };
        let ordinal = size_ordinal(size)?;
        let start_at = hint.map_or(0, |h| (h >> 12) as u32);

        for _ in 0..3 {
            let mut found = Page::new(0, 5);

            while found.order > 1 {
                let pt = self.page_alloc.get_page_table(found.subpage(0))?;
                let Some(subpage) = pt.full_nodes[ordinal].get_non_full_entry(start_at) else {
                    break;
                };
                found = found.subpage(subpage);

                if found.order == 1 {
                    let np = self.node_page(found, size)?;
                    let Some((local, need_update)) = np.allocate()? else {
                        break; // summary raced; start over
                    };
                    self.propagate_full(found, ordinal, need_update)?;
                    self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
                    return Ok(self.prepare_block(found.offset + local, user_size)?);
                }
            }
        }

        // Nothing free anywhere: open a fresh arena page for this class.
        let page = self
            .page_alloc
            .allocate_page_of_type(1, PageType::arena(ordinal as i32))?;
        let np = unsafe { &mut *self.page_alloc.region().at::<NodePage>(page.offset)? };
        np.init(size as u32);
        let (local, _) = np.allocate()?.ok_or(Error::Allocation { size, order: 1 })?;

        // Now advertise the page's remaining slots to the world.
        self.propagate_not_full(page, ordinal)?;
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Ok(self.prepare_block(page.offset + local, user_size)?)
    }

    /// Free a slot previously returned by [`NodeAllocator::allocate`]. The
    /// original (pre-rounding) size must be passed back.
    pub fn deallocate(&self, offset: u64, size: u64) -> Result<()> {
        let (size, offset) = if NODE_ALLOC_SENTINELS {
            self.check_sentinels(offset, size)?;
            (adjust_size(size.checked_mul(3).unwrap())?, offset - size)
        } else {
            (adjust_size(size)?, offset)
        };
        let ordinal = size_ordinal(size)?;

        let page = Page::containing(offset, 1);
        let local = offset - page.offset;

        // Poison freed slots so stale pointers surface fast.
        let p = self.page_alloc.region().bytes(offset, size)?;
        unsafe { std::ptr::write_bytes(p, 0xFF, size as usize) };

        let np = self.node_page(page, size)?;
        let need_update = np.deallocate(local)?;
        self.propagate_not_full_from(page, ordinal, need_update)?;

        self.bytes_deallocated.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a slot sized for `T` and move `value` into it.
    pub fn alloc_value<T>(&self, value: T) -> Result<u64> {
        let size = std::mem::size_of::<T>() as u64;
        let offset = self.allocate(size, None)?;
        let p = self.page_alloc.region().at::<T>(offset)?;
        unsafe { std::ptr::write(p, value) };
        Ok(offset)
    }

    /// Verify the sentinel flanks of a slot. No-op without the feature.
    pub fn check_sentinels(&self, offset: u64, size: u64) -> Result<()> {
        if !NODE_ALLOC_SENTINELS {
            return Ok(());
        }
        let front = self.page_alloc.region().bytes(offset - size, size)?;
        let back = self.page_alloc.region().bytes(offset + size, size)?;
        unsafe {
            for i in 0..size as usize {
                if *front.add(i) != SENTINEL_FRONT {
                    return Err(Error::Integrity {
                        offset,
                        detail: "node underflow detected (front sentinel)",
                    });
                }
                if *back.add(i) != SENTINEL_BACK {
                    return Err(Error::Integrity {
                        offset,
                        detail: "node overflow detected (back sentinel)",
                    });
                }
            }
        }
        Ok(())
    }

    fn prepare_block(&self, offset: u64, user_size: u64) -> Result<u64> {
        if !NODE_ALLOC_SENTINELS {
            return Ok(offset);
        }
        let front = self.page_alloc.region().bytes(offset, user_size)?;
        let back = self.page_alloc.region().bytes(offset + 2 * user_size, user_size)?;
        unsafe {
            std::ptr::write_bytes(front, SENTINEL_FRONT, user_size as usize);
            std::ptr::write_bytes(back, SENTINEL_BACK, user_size as usize);
        }
        Ok(offset + user_size)
    }

    /// Walk fullness up the tree after an allocation filled something.
    fn propagate_full(&self, mut page: Page, ordinal: usize, mut need_update: bool) -> Result<()> {
        while need_update && page.order < 5 {
            let index = PageTableAllocator::page_table_index(page, page.order);
            let pt = self.page_alloc.get_page_table(page)?;
            need_update = pt.full_nodes[ordinal].mark_allocated(index);
            page = page.superpage();
        }
        Ok(())
    }

    fn propagate_not_full(&self, page: Page, ordinal: usize) -> Result<()> {
        self.propagate_not_full_from(page, ordinal, true)
    }

    fn propagate_not_full_from(
        &self,
        mut page: Page,
        ordinal: usize,
        mut need_update: bool,
    ) -> Result<()> {
        while need_update && page.order < 5 {
            let index = PageTableAllocator::page_table_index(page, page.order);
            let pt = self.page_alloc.get_page_table(page)?;
            need_update = pt.full_nodes[ordinal].mark_deallocated(index);
            page = page.superpage();
        }
        Ok(())
    }
}
