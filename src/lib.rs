//! An embeddable, memory-mapped, lock-free persistent key-value engine.
//!
//! The engine stores concurrent radix tries directly in a file-backed (or
//! anonymous) memory region: the file layout *is* the in-memory layout,
//! pointers are offsets, and reopening the database is just remapping the
//! file. Multiple independent tries share one allocator stack — a
//! five-level page table, fixed-size node arenas and a variable-size
//! string allocator whose free list is itself a trie.
//!
//! Readers are wait-free apart from epoch bookkeeping: they pin the region
//! and a trie's epoch, snapshot the root, and walk an immutable tree.
//! Writers build replacement subtrees copy-on-write and publish them with
//! a single CAS on the trie's root word. Transactions mutate a private
//! in-place mirror and reconcile through a three-way merge at commit.
//!
//! ```no_run
//! use mmap_trie::{MmapFile, Permissions, ResMode};
//!
//! let db = MmapFile::open("data.mmap", ResMode::CreateOpen,
//!                         Permissions::READ_WRITE, 0)?;
//! let trie = db.create_trie(1)?;
//! let w = trie.mutate(db.area())?;
//! w.insert(42u64, 7)?;
//! assert_eq!(w.get(&42u64)?, Some(7));
//! db.snapshot()?;
//! # Ok::<(), mmap_trie::Error>(())
//! ```

pub mod alloc;
pub mod bitmap;
pub mod check;
mod error;
pub mod gc;
pub mod key;
pub mod node_alloc;
pub mod node_page;
pub mod page;
pub mod page_alloc;
pub mod page_table;
pub mod region;
pub mod string_alloc;
pub mod trie;
pub mod trie_alloc;

use std::path::Path;
use std::sync::Arc;

pub use crate::alloc::MemoryAllocator;
pub use crate::error::{Error, Result};
pub use crate::key::{KeyFragment, TrieKey};
pub use crate::region::{Permissions, Region, ResMode};
pub use crate::trie::{
    ConstTrieVersion, MutableTrieVersion, TransactionalTrieVersion, Trie, TrieIterator,
    ValueDeallocList,
};

/// A database: one region plus its allocator stack.
pub struct MmapFile {
    area: Arc<MemoryAllocator>,
}

impl MmapFile {
    /// Open (or create) a file-backed database.
    ///
    /// `size_to_create` only applies when the file is created; pass 0 for
    /// the default minimum.
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: ResMode,
        perm: Permissions,
        size_to_create: u64,
    ) -> Result<MmapFile> {
        let region = Arc::new(Region::open(path, mode, perm, size_to_create)?);
        let init = region.was_created();
        Ok(MmapFile {
            area: MemoryAllocator::new(region, init)?,
        })
    }

    /// A purely in-memory database. Snapshots are unavailable.
    pub fn anonymous(size: u64) -> Result<MmapFile> {
        let region = Arc::new(Region::anonymous(size)?);
        Ok(MmapFile {
            area: MemoryAllocator::new(region, true)?,
        })
    }

    pub fn area(&self) -> &Arc<MemoryAllocator> {
        &self.area
    }

    pub fn region(&self) -> &Arc<Region> {
        self.area.region()
    }

    /// Handle to an existing trie.
    pub fn trie(&self, id: u32) -> Result<Trie> {
        self.area.trie(id)
    }

    /// Create an empty trie under `id`.
    pub fn create_trie(&self, id: u32) -> Result<Trie> {
        self.area.create_trie(id)
    }

    /// Remove a trie id from the registry (clear the trie first).
    pub fn drop_trie(&self, id: u32) -> Result<()> {
        self.area.drop_trie(id)
    }

    /// Flush a consistent point-in-time state to the backing file.
    /// Returns the number of bytes written.
    pub fn snapshot(&self) -> Result<u64> {
        self.area.region().snapshot()
    }

    /// Permanently delete the backing file and its lock sidecars.
    pub fn unlink(&self) -> Result<()> {
        self.area.unlink()
    }
}
