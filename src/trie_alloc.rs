//! The registry of named tries.
//!
//! A single 4 KiB page of 64-byte blocks at a fixed offset near the start
//! of the region. The first slots hold the page's own header plus a
//! reserved range; each remaining slot is one [`TrieBlock`] whose `root`
//! field is the trie's atomically-published root word. The page is
//! self-contained so a snapshot always captures every root consistently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::node_page::NodePage;
use crate::page::PAGE_SIZE;
use crate::region::Region;

/// Offset of the registry page: the first client-usable page after the
/// metadata pages and the first block's page tables.
pub const TRIE_ALLOC_OFFSET: u64 = 6 * PAGE_SIZE;

pub const TRIE_BLOCK_MAGIC: u64 = 0xF07111AA110A62A6;
pub const TRIE_VERSION_MAJOR: u32 = 1;
pub const TRIE_VERSION_MINOR: u32 = 0;

/// Ids 1..=MAX_TRIE_ID are valid; MAX_TRIE_ID itself is the string
/// allocator's free list.
pub const MIN_TRIE_ID: u32 = 1;
pub const MAX_TRIE_ID: u32 = 32;

/// Slots reserved ahead of the trie blocks: the node-page header plus a
/// reserved range kept for future metadata.
const BLOCK_SIZE: u32 = 64;
const RESERVED_SLOTS: u32 = 7;

/// One registry entry, padded to a cache line to avoid false sharing
/// between concurrently updated roots.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TrieBlock {
    version: u64,
    magic: u64,
    trie_type: u64,
    root: u64,
    reserved: [u64; 4],
}

const _: () = assert!(std::mem::size_of::<TrieBlock>() == 64);

impl TrieBlock {
    fn init(&mut self, trie_type: u64) {
        *self = bytemuck::Zeroable::zeroed();
        self.magic = TRIE_BLOCK_MAGIC;
        self.version = (TRIE_VERSION_MAJOR as u64) | ((TRIE_VERSION_MINOR as u64) << 32);
        self.trie_type = trie_type;
        self.root = 0;
    }

    fn trash(&mut self) {
        self.magic = !TRIE_BLOCK_MAGIC;
        self.version = !self.version;
        self.trie_type = !self.trie_type;
        self.root = 0;
    }

    fn validate(&self, offset: u64) -> Result<()> {
        if self.magic != TRIE_BLOCK_MAGIC {
            return Err(Error::Integrity {
                offset,
                detail: "corrupted trie block magic",
            });
        }
        let (major, minor) = ((self.version & 0xFFFF_FFFF) as u32, (self.version >> 32) as u32);
        if major != TRIE_VERSION_MAJOR || minor != TRIE_VERSION_MINOR {
            return Err(Error::Integrity {
                offset,
                detail: "unsupported trie block version",
            });
        }
        Ok(())
    }
}

pub struct TrieAllocator {
    region: Arc<Region>,
    offset: u64,
    bytes_allocated: AtomicU64,
    bytes_deallocated: AtomicU64,
}

fn trie_index(id: u32) -> Result<u32> {
    if !(MIN_TRIE_ID..=MAX_TRIE_ID).contains(&id) {
        return Err(Error::Logical("trie id out of bounds"));
    }
    Ok(RESERVED_SLOTS + id - 1)
}

impl TrieAllocator {
    /// Wrap the registry page; `init` lays it down from scratch. The
    /// page itself must already be allocated (see `MemoryAllocator::new`).
    pub fn new(region: Arc<Region>, init: bool) -> Result<TrieAllocator> {
        let alloc = TrieAllocator {
            region,
            offset: TRIE_ALLOC_OFFSET,
            bytes_allocated: AtomicU64::new(0),
            bytes_deallocated: AtomicU64::new(0),
        };
        if init {
            alloc.region.clone().pinned(|| {
                let page = alloc.page()?;
                #[allow(invalid_reference_casting)]
                let page = unsafe { &mut *(page as *const NodePage as *mut NodePage) };
                page.init(BLOCK_SIZE);
                // The header consumed the leading slots; pad the reserve out
                // to the fixed count.
                for i in NodePage::metadata_nodes(BLOCK_SIZE)..RESERVED_SLOTS {
                    page.mark_allocated(i);
                }
                Ok(())
            })?;
        }
        Ok(alloc)
    }

    fn page(&self) -> Result<&NodePage> {
        Ok(unsafe { &*self.region.at::<NodePage>(self.offset)? })
    }

    fn block_offset(&self, index: u32) -> Result<u64> {
        Ok(self.offset + self.page()?.entry_offset(index))
    }

    fn block(&self, index: u32) -> Result<&mut TrieBlock> {
        let offset = self.block_offset(index)?;
        Ok(unsafe { &mut *self.region.at::<TrieBlock>(offset)? })
    }

    /// True when a trie exists for `id`.
    pub fn is_allocated(&self, id: u32) -> Result<bool> {
        let index = trie_index(id)?;
        self.region.pinned(|| Ok(self.page()?.is_allocated(index)))
    }

    /// Create an empty trie under `id`, along with its gc lock.
    pub fn allocate(&self, id: u32) -> Result<()> {
        let index = trie_index(id)?;
        self.region.pinned(|| {
            let page = self.page()?;
            if page.is_allocated(index) {
                return Err(Error::Logical("trie id is already allocated"));
            }
            let (_, _) = page.mark_allocated(index);
            self.block(index)?.init(0);
            Ok(())
        })?;
        self.region.allocate_gc_lock(id)?;
        self.bytes_allocated
            .fetch_add(std::mem::size_of::<TrieBlock>() as u64, Ordering::Relaxed);
        debug!("allocated trie id {id}");
        Ok(())
    }

    /// Destroy the registry entry for `id` and unlink its gc lock. The
    /// trie's nodes are NOT touched; deallocating a non-empty trie leaks
    /// them (clear it first).
    pub fn deallocate(&self, id: u32) -> Result<()> {
        let index = trie_index(id)?;
        self.region.pinned(|| {
            let page = self.page()?;
            if !page.is_allocated(index) {
                return Err(Error::Logical("double free of a trie id"));
            }
            self.block(index)?.trash();
            page.deallocate(page.entry_offset(index))?;
            Ok(())
        })?;
        // Wait out every reader that might still walk the old trie.
        self.region.gc_lock(id)?.defer_barrier();
        self.region.unlink_gc_lock(id)?;
        self.bytes_deallocated
            .fetch_add(std::mem::size_of::<TrieBlock>() as u64, Ordering::Relaxed);
        debug!("deallocated trie id {id}");
        Ok(())
    }

    /// Offset of the trie's root word: a single aligned u64 the writers
    /// CAS and the readers load.
    pub fn trie_offset(&self, id: u32) -> Result<u64> {
        let index = trie_index(id)?;
        self.region.pinned(|| {
            let page = self.page()?;
            if !page.is_allocated(index) {
                return Err(Error::Logical("trie must be allocated first"));
            }
            let block_offset = self.block_offset(index)?;
            self.block(index)?.validate(block_offset)?;
            Ok(block_offset + std::mem::offset_of!(TrieBlock, root) as u64)
        })
    }

    /// Every allocated trie id.
    pub fn allocated_ids(&self) -> Result<Vec<u32>> {
        self.region.pinned(|| {
            let page = self.page()?;
            Ok((MIN_TRIE_ID..=MAX_TRIE_ID)
                .filter(|id| page.is_allocated(RESERVED_SLOTS + id - 1))
                .collect())
        })
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
}
