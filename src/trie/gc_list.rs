//! Per-mutation deferred reclamation record.
//!
//! One mutation attempt collects the nodes it displaced (`old`) and the
//! nodes it freshly allocated (`new`). On a successful root publication the
//! old nodes are retired through the trie's epoch lock, so readers that
//! still see the previous root keep valid memory; on failure or rollback
//! the new nodes are freed immediately (nothing else can reference them).

use std::sync::Arc;

use crate::alloc::MemoryAllocator;
use crate::gc::GcLock;
use crate::trie::node;
use crate::trie::ptr::TriePtr;

#[derive(Default)]
pub struct GcList {
    old_nodes: Vec<TriePtr>,
    new_nodes: Vec<TriePtr>,
}

impl GcList {
    pub fn new() -> GcList {
        GcList::default()
    }

    /// Record a node displaced by this mutation; freed once readers drain.
    pub fn add_old(&mut self, ptr: TriePtr) {
        if !ptr.is_null() {
            self.old_nodes.push(ptr);
        }
    }

    /// Record a node allocated by this mutation; freed if it rolls back.
    pub fn add_new(&mut self, ptr: TriePtr) {
        if !ptr.is_null() {
            self.new_nodes.push(ptr);
        }
    }

    /// A new node was deallocated before the mutation finished (e.g. a
    /// burst rebuilt it); drop it from the rollback set.
    pub fn forget_new(&mut self, ptr: TriePtr) {
        self.new_nodes.retain(|p| *p != ptr);
    }

    pub fn is_empty(&self) -> bool {
        self.old_nodes.is_empty() && self.new_nodes.is_empty()
    }

    /// Absorb another list (used to accumulate per-operation lists into a
    /// transaction's running record).
    pub fn merge(&mut self, mut other: GcList) {
        self.old_nodes.append(&mut other.old_nodes);
        self.new_nodes.append(&mut other.new_nodes);
    }

    /// Drop the displaced-node records without freeing them. Used on the
    /// merge commit path, where the displaced originals are either still
    /// referenced by the live root or were already retired by the writer
    /// that moved it.
    pub fn forget_old(&mut self) {
        self.old_nodes.clear();
    }

    /// The mutation published: retire the displaced nodes once every reader
    /// of `lock`'s current epoch has left.
    pub fn commit(mut self, area: &MemoryAllocator, lock: &GcLock) {
        self.new_nodes.clear();
        if self.old_nodes.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.old_nodes);
        let area: Arc<MemoryAllocator> = area.arc();
        lock.defer(Box::new(move || {
            let _ = area.region().pinned(|| {
                for ptr in &old {
                    if let Err(e) = node::deallocate_node(&area, *ptr) {
                        log::warn!("deferred node reclamation failed: {e}");
                    }
                }
                Ok(())
            });
        }));
    }

    /// The mutation failed: free everything it allocated.
    pub fn rollback(mut self, area: &MemoryAllocator) {
        let new = std::mem::take(&mut self.new_nodes);
        self.old_nodes.clear();
        let _ = area.region().pinned(|| {
            for ptr in &new {
                if let Err(e) = node::deallocate_node(area, *ptr) {
                    log::warn!("rollback node reclamation failed: {e}");
                }
            }
            Ok(())
        });
    }
}
