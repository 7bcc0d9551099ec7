//! The five-level page-table allocator.
//!
//! One order-5 page spans the whole addressable universe and is always
//! split. Page tables are order-1 pages at deterministic offsets inside the
//! page they describe: within each 4 MiB block, subpage 5 is the L1 table;
//! subpage 4 is the L2 table when the block is the first of its 4 GiB page,
//! subpage 3 the L3 table when first of its 4 TiB page, subpage 2 the L4
//! table when first of the 4 PiB page. The region's first block also
//! reserves subpage 0 (metadata + the order-5 table) and subpage 1 (page
//! allocator scratch).
//!
//! Locating a free page of order k descends from the order-5 table through
//! the per-order "contains a free page of order k" bitmaps, allocating with
//! one CAS at the bottom and propagating fullness transitions back up.

use std::sync::Arc;

use log::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};
use crate::page::{page_size_for_order, Page, PageType, PAGE_SIZE};
use crate::page_table::PageTable;
use crate::region::Region;

pub const METADATA_MAGIC: u64 = 0x9d49f027a0293fc7;
pub const ALLOCATOR_VERSION: u32 = 1;
const ALLOCATOR_TYPE_PAGE_TABLE: u32 = 1;

/// Offset of the order-5 page table, inside the metadata page.
const L5_TABLE_OFFSET: u64 = 64;

/// Region metadata, at offset 0. The first eight bytes are a reserved
/// sentinel; the header proper starts at byte 8 and is covered by an xxh3
/// hash validated at open.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Metadata {
    reserved: u64,
    magic: u64,
    allocator_type: u32,
    version: u32,
    allocated_order5: u64,
    header_hash: u64,
}

const _: () = assert!(std::mem::size_of::<Metadata>() as u64 <= L5_TABLE_OFFSET);

impl Metadata {
    fn hashed_bytes(&self) -> &[u8] {
        // magic through allocated_order5
        &bytemuck::bytes_of(self)[8..32]
    }

    pub fn init(&mut self) {
        self.reserved = 0;
        self.magic = METADATA_MAGIC;
        self.allocator_type = ALLOCATOR_TYPE_PAGE_TABLE;
        self.version = ALLOCATOR_VERSION;
        self.allocated_order5 = 0;
        self.rehash();
    }

    pub fn rehash(&mut self) {
        self.header_hash = xxh3_64(self.hashed_bytes());
    }

    pub fn valid(&self) -> bool {
        self.magic == METADATA_MAGIC
            && self.version == ALLOCATOR_VERSION
            && self.header_hash == xxh3_64(self.hashed_bytes())
    }
}

pub struct PageTableAllocator {
    region: Arc<Region>,
}

impl PageTableAllocator {
    /// Wrap the region; `init` lays down the metadata page and splits the
    /// order-5 page. Must be called inside a region pin.
    pub fn new(region: Arc<Region>, init: bool) -> Result<PageTableAllocator> {
        let alloc = PageTableAllocator { region };
        if init {
            alloc.init()?;
        } else {
            alloc.validate()?;
        }
        Ok(alloc)
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn metadata(&self) -> Result<&Metadata> {
        Ok(unsafe { &*self.region.at::<Metadata>(0)? })
    }

    fn metadata_mut(&self) -> Result<&mut Metadata> {
        Ok(unsafe { &mut *self.region.at::<Metadata>(0)? })
    }

    fn init(&self) -> Result<()> {
        debug_assert!(self.region.is_pinned() > 0);
        self.region.ensure(0, 6 * PAGE_SIZE)?;

        let md = self.metadata_mut()?;
        md.init();
        debug_assert!(md.valid());

        // Split the one order-5 page so its tables exist.
        self.allocate_page_and_split(5, false)?;

        let md = self.metadata_mut()?;
        md.rehash();
        debug!("initialized page table allocator");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        debug_assert!(self.region.is_pinned() > 0);
        let md = self.metadata()?;
        if !md.valid() {
            return Err(Error::Integrity {
                offset: 0,
                detail: "region metadata magic or hash mismatch",
            });
        }
        Ok(())
    }

    /*************************************************************************/
    /* PAGE TABLE LOCATION                                                   */
    /*************************************************************************/

    /// Offset of the page table that covers `page` at the given order.
    pub fn page_table_offset(page: Page, order: i32) -> u64 {
        if order == 5 {
            return L5_TABLE_OFFSET;
        }
        let superpage = page.superpage_of_order(order + 1);
        superpage.offset + (6 - order as u64) * PAGE_SIZE
    }

    /// Index of `page` within its covering table at the given order.
    pub fn page_table_index(page: Page, order: i32) -> u32 {
        if order == 5 {
            return 0;
        }
        let superpage = page.superpage_of_order(order + 1);
        let idx = (page.offset - superpage.offset) / page_size_for_order(order);
        debug_assert!(idx < 1024);
        idx as u32
    }

    /// The (possibly uninitialized) table covering `page` at its own order.
    pub fn get_uninitialized_page_table(&self, page: Page, order: i32) -> Result<&PageTable> {
        let offset = Self::page_table_offset(page, order);
        Ok(unsafe { &*self.region.at::<PageTable>(offset)? })
    }

    /// The table covering `page` at its own order; must be initialized.
    pub fn get_page_table(&self, page: Page) -> Result<&PageTable> {
        self.get_page_table_at(page, page.order)
    }

    pub fn get_page_table_at(&self, page: Page, order: i32) -> Result<&PageTable> {
        let pt = self.get_uninitialized_page_table(page, order)?;
        if !pt.valid() || pt.order() != order {
            return Err(Error::Integrity {
                offset: Self::page_table_offset(page, order),
                detail: "page table magic or order mismatch",
            });
        }
        Ok(pt)
    }

    /*************************************************************************/
    /* ALLOCATION                                                            */
    /*************************************************************************/

    /// Allocate a page of the given order, splitting a parent if necessary.
    pub fn allocate_page(&self, order: i32) -> Result<Page> {
        debug_assert!(self.region.is_pinned() > 0);
        self.do_allocate_page(order, false)
    }

    /// Allocate a page and stamp its type byte.
    pub fn allocate_page_of_type(&self, order: i32, page_type: PageType) -> Result<Page> {
        let page = self.allocate_page(order)?;
        let pt = self.get_page_table(page)?;
        pt.set_type(Self::page_table_index(page, page.order), page_type);
        Ok(page)
    }

    fn do_allocate_page(&self, order: i32, to_split: bool) -> Result<Page> {
        if !(1..=5).contains(&order) {
            return Err(Error::Logical("page order out of range"));
        }

        if order == 5 {
            if !to_split {
                return Err(Error::Logical("the order-5 page may only be allocated to split"));
            }
            let md = self.metadata_mut()?;
            if md.allocated_order5 != 0 {
                return Err(Error::Logical("order-5 page already allocated"));
            }
            md.allocated_order5 = 1;
            md.rehash();
            return Ok(Page::new(0, 5));
        }
        if order == 1 && to_split {
            return Err(Error::Logical("can't split an order-1 page"));
        }

        let page_type = if to_split {
            PageType::split(order)
        } else {
            PageType::page(order)
        };

        let mut result = self.allocate_free_page(order)?;
        if !result.valid() {
            result = self.allocate_page_and_split(order + 1, true)?;
        }
        if !result.valid() {
            return Err(Error::Allocation {
                size: page_size_for_order(order),
                order,
            });
        }

        {
            let pt = self.get_page_table(result)?;
            let index = Self::page_table_index(result, result.order);
            if pt.get_type(index) != PageType::Empty {
                return Err(Error::Integrity {
                    offset: result.offset,
                    detail: "allocated page already has a type",
                });
            }
            pt.set_type(index, page_type);
        }

        // Plain pages must be backed before the caller touches them.
        if !to_split && result.end_offset() > self.region.len() {
            if let Err(e) = self.region.ensure(result.offset, result.length()) {
                // Don't leak the page while the resize signal unwinds.
                self.deallocate_page(result)?;
                return Err(e);
            }
        }

        Ok(result)
    }

    /// Allocate a page of `order` and split it, optionally returning one of
    /// the fresh subpages as allocated.
    fn allocate_page_and_split(&self, order: i32, allocate: bool) -> Result<Page> {
        let big = self.do_allocate_page(order, true)?;
        match self.split_page(big, allocate) {
            Ok(page) => Ok(page),
            Err(e) if e.is_resize() => {
                // The split didn't initialize anything; give the page back
                // before the pin loop unwinds.
                self.deallocate_page(big)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Split `page` into 1024 subpages, initializing the subpage table.
    pub fn split_page(&self, page: Page, allocate: bool) -> Result<Page> {
        assert!(page.order > 1, "can't split below order 1");

        // The first six subpages must be mapped before we can write tables.
        self.region.ensure(page.offset, 6 * PAGE_SIZE)?;

        let pt_offset = Self::page_table_offset(page.subpage(0), page.order - 1);
        let pt = unsafe { &mut *self.region.at::<PageTable>(pt_offset)? };
        pt.init(page.order - 1);
        let pt = &*pt;

        let mut result = Page::null();
        let num_free_pages;

        if page.order == 2 {
            // Order-2 split: some of the first six 4 KiB subpages carry
            // metadata or page tables, depending on whether this block is
            // the first at each higher order. Subpage 5 (the L1 table for
            // this block) is always reserved; the higher tables only exist
            // in the first block of the page they describe.
            let has_metadata = page.offset == 0;
            let has_l4 = page.offset == 0;
            let has_l3 = page.offset % page_size_for_order(4) == 0;
            let has_l2 = page.offset % page_size_for_order(3) == 0;

            let mut num_reserved = 0u32;
            if has_metadata {
                pt.reserve(0);
                pt.reserve(1);
                pt.set_type(0, PageType::Metadata);
                pt.set_type(1, PageType::PageAllocator);
                num_reserved += 2;
            } else if allocate {
                result = page.subpage(0);
                pt.reserve(0);
            }

            for (sub, present, t) in [
                (2u32, has_l4, PageType::L4Pte),
                (3, has_l3, PageType::L3Pte),
                (4, has_l2, PageType::L2Pte),
                (5, true, PageType::L1Pte),
            ] {
                if present {
                    pt.reserve(sub);
                    pt.set_type(sub, t);
                    num_reserved += 1;
                } else if !result.valid() && allocate {
                    result = page.subpage(sub);
                    pt.reserve(sub);
                }
            }

            if !result.valid() && allocate {
                result = page.subpage(6);
                pt.reserve(6);
            }

            num_free_pages = 1024 - num_reserved - u32::from(allocate);
        } else {
            // Higher orders: the first subpage is split all the way down so
            // the page tables have somewhere to live.
            pt.reserve(0);
            self.split_page(page.subpage(0), false)?;
            pt.set_type(0, PageType::split(page.order - 1));

            num_free_pages = 1023 - u32::from(allocate);
            if allocate {
                pt.reserve(1);
                result = page.subpage(1);
            }
        }

        self.notify_free_subpages(page, page.order - 1, num_free_pages as u64)?;
        Ok(result)
    }

    /// Descend the tables looking for a free page of `order`. Returns the
    /// null page when nothing is free (spurious failures possible under
    /// contention; callers fall back to splitting a fresh parent).
    fn allocate_free_page(&self, order: i32) -> Result<Page> {
        assert!((1..=4).contains(&order), "the order-5 page is always split");

        const NUM_ATTEMPTS: usize = 3;

        for _ in 0..NUM_ATTEMPTS {
            let mut page = Page::new(0, 5);

            let mut current_order = 5;
            while current_order > order {
                let pt = self.get_page_table(page.subpage(0))?;
                debug_assert_eq!(pt.order(), page.order - 1);

                if current_order == order + 1 {
                    // Bottom: allocate from this table directly.
                    let Some((page_num, mut full)) = pt.allocate(0) else {
                        break; // full; backtrack and retry
                    };
                    let result = page.subpage(page_num);

                    // Fullness crossed a boundary: tell each ancestor table.
                    while full && page.order < 5 {
                        let index = Self::page_table_index(page, page.order);
                        let ppt = self.get_page_table(page)?;
                        full = ppt.mark_allocated(index, result.order);
                        page = page.superpage();
                    }
                    return Ok(result);
                }

                // Not at the bottom: follow the per-order summary.
                let bitmap = &pt.full_levels[order as usize - 1];
                let Some(subpage) = bitmap.get_non_full_entry(0) else {
                    break; // full; backtrack and retry
                };
                debug_assert!(pt.subpage_is_split(subpage));
                page = page.subpage(subpage);
                current_order -= 1;
            }
        }
        Ok(Page::null())
    }

    /// Record that `page` (transitively) contains free subpages of `order`,
    /// clearing summary bits up the tree as needed.
    fn notify_free_subpages(&self, page: Page, order: i32, _num_free: u64) -> Result<()> {
        // The order-5 page is assumed to contain free subpages of all kinds.
        if page.order == 5 {
            return Ok(());
        }
        assert!(order >= 1 && order <= page.order);

        let subpage = Self::page_table_index(page, page.order);
        let pt = self.get_page_table(page)?;
        debug_assert_eq!(pt.order(), page.order);

        let need_propagation = pt.mark_deallocated(subpage, order);

        if need_propagation {
            self.notify_free_subpages(page.superpage(), order, _num_free)?;
        }
        Ok(())
    }

    /// Free a previously allocated page, propagating "not full" upward.
    pub fn deallocate_page(&self, page: Page) -> Result<()> {
        debug_assert!(self.region.is_pinned() > 0);
        if !(1..=4).contains(&page.order) {
            return Err(Error::Logical(
                "deallocate of invalid order (the order-5 page is permanent)",
            ));
        }

        let mut need_update = true;
        let mut order = page.order;
        while need_update && order < 5 {
            let pt = self.get_page_table_at(page, order)?;
            need_update = pt.mark_deallocated(Self::page_table_index(page, order), page.order);
            order += 1;
        }
        Ok(())
    }
}
