//! The memory allocator aggregate: everything needed to manipulate one
//! region, wired together. Construction order matters — the page tables
//! first, then the trie registry page, then the string allocator's free
//! list trie.

use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::page::{PageType, PAGE_SIZE};
use crate::page_alloc::PageTableAllocator;
use crate::node_alloc::NodeAllocator;
use crate::region::Region;
use crate::string_alloc::{StringAllocator, FREE_LIST_TRIE_ID};
use crate::trie::Trie;
use crate::trie_alloc::{TrieAllocator, MAX_TRIE_ID, MIN_TRIE_ID, TRIE_ALLOC_OFFSET};

pub struct MemoryAllocator {
    region: Arc<Region>,
    self_ref: Weak<MemoryAllocator>,
    pub page_alloc: Arc<PageTableAllocator>,
    pub node_alloc: NodeAllocator,
    pub trie_alloc: TrieAllocator,
    pub string_alloc: StringAllocator,
}

impl MemoryAllocator {
    /// Build the allocator over `region`; `init` writes a fresh layout.
    pub fn new(region: Arc<Region>, init: bool) -> Result<Arc<MemoryAllocator>> {
        let page_alloc = {
            let r = region.clone();
            Arc::new(region.pinned(move || PageTableAllocator::new(r.clone(), init))?)
        };

        if init {
            // The registry page is the first client page by construction.
            let pa = page_alloc.clone();
            let page =
                region.pinned(move || pa.allocate_page_of_type(1, PageType::Metadata))?;
            if page.offset != TRIE_ALLOC_OFFSET {
                return Err(Error::Integrity {
                    offset: page.offset,
                    detail: "trie registry page landed at an unexpected offset",
                });
            }
            region.ensure(0, TRIE_ALLOC_OFFSET + PAGE_SIZE)?;
        }

        let trie_alloc = TrieAllocator::new(region.clone(), init)?;
        let node_alloc = NodeAllocator::new(page_alloc.clone());

        if init {
            trie_alloc.allocate(FREE_LIST_TRIE_ID)?;
        }
        let free_list_offset = trie_alloc.trie_offset(FREE_LIST_TRIE_ID)?;
        let string_alloc = StringAllocator::new(Trie::new(FREE_LIST_TRIE_ID, free_list_offset));

        Ok(Arc::new_cyclic(|w| MemoryAllocator {
            region,
            self_ref: w.clone(),
            page_alloc,
            node_alloc,
            trie_alloc,
            string_alloc,
        }))
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// An owning handle to this allocator (used by deferred reclamation).
    pub fn arc(&self) -> Arc<MemoryAllocator> {
        self.self_ref
            .upgrade()
            .expect("allocator used after teardown")
    }

    /// Handle to an existing trie.
    pub fn trie(&self, id: u32) -> Result<Trie> {
        if !self.trie_alloc.is_allocated(id)? {
            return Err(Error::Logical("trie id is not allocated"));
        }
        Ok(Trie::new(id, self.trie_alloc.trie_offset(id)?))
    }

    /// Create a fresh, empty trie under `id`.
    pub fn create_trie(&self, id: u32) -> Result<Trie> {
        if id == FREE_LIST_TRIE_ID {
            return Err(Error::Logical("trie id is reserved for the free list"));
        }
        self.trie_alloc.allocate(id)?;
        self.trie(id)
    }

    /// Tear down a trie id (the trie should be cleared first).
    pub fn drop_trie(&self, id: u32) -> Result<()> {
        if id == FREE_LIST_TRIE_ID {
            return Err(Error::Logical("trie id is reserved for the free list"));
        }
        self.trie_alloc.deallocate(id)
    }

    /// Ids a caller may use for its own tries.
    pub fn client_trie_ids() -> std::ops::Range<u32> {
        MIN_TRIE_ID..MAX_TRIE_ID
    }

    /*************************************************************************/
    /* STRING ALLOCATION                                                     */
    /*************************************************************************/

    pub fn allocate_string(&self, size: u64) -> Result<u64> {
        self.string_alloc.allocate(self, size, None)
    }

    pub fn deallocate_string(&self, offset: u64) -> Result<()> {
        self.string_alloc.deallocate(self, offset, None)
    }

    pub fn string_size(&self, offset: u64) -> Result<u64> {
        self.string_alloc.string_size(self, offset)
    }

    /*************************************************************************/
    /* ACCOUNTING                                                            */
    /*************************************************************************/

    pub fn bytes_allocated(&self) -> u64 {
        self.node_alloc.bytes_allocated()
            + self.string_alloc.bytes_allocated()
            + self.trie_alloc.bytes_allocated()
    }

    pub fn bytes_deallocated(&self) -> u64 {
        self.node_alloc.bytes_deallocated()
            + self.string_alloc.bytes_deallocated()
            + self.trie_alloc.bytes_deallocated()
    }

    pub fn bytes_outstanding(&self) -> u64 {
        self.bytes_allocated() - self.bytes_deallocated()
    }

    /// Free-list bytes privately held by the string allocator.
    pub fn bytes_private(&self) -> i64 {
        self.string_alloc.bytes_private()
    }

    /// Permanently delete the backing resources.
    pub fn unlink(&self) -> Result<()> {
        self.region.unlink()
    }
}
