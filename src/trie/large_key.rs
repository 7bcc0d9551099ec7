//! The large-key terminal: up to three entries whose keys may be
//! arbitrarily long. Each entry owns a [`KeyFragmentRepr`], so long keys
//! chain out to 64-byte slots while the node itself stays small.

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::key::{KeyFragment, KeyFragmentRepr};
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::LocalNode;
use crate::trie::ptr::{NodeType, State, TriePtr};

pub const MAX_ENTRIES: usize = 3;
const ALIGN_BITS: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct LargeKeyEntry {
    value: u64,
    key: KeyFragmentRepr,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LargeKeyRepr {
    entries: [LargeKeyEntry; MAX_ENTRIES],
    size: u32,
    unused: u32,
}

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a LargeKeyRepr> {
    Ok(unsafe { &*area.region().at::<LargeKeyRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

/// Build a large-key terminal over sorted entries.
pub fn alloc(
    area: &MemoryAllocator,
    entries: &[(KeyFragment, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    debug_assert!((2..=MAX_ENTRIES).contains(&entries.len()));
    let mut r: LargeKeyRepr = bytemuck::Zeroable::zeroed();
    r.size = entries.len() as u32;
    for (i, (k, v)) in entries.iter().enumerate() {
        let key = match k.alloc_repr(area) {
            Ok(repr) => repr,
            Err(e) => {
                for e in &r.entries[..i] {
                    let _ = KeyFragment::dealloc_repr(&e.key, area);
                }
                return Err(e);
            }
        };
        r.entries[i] = LargeKeyEntry { value: *v, key };
    }
    let offset = match area.node_alloc.alloc_value(r) {
        Ok(o) => o,
        Err(e) => {
            for entry in &r.entries[..entries.len()] {
                let _ = KeyFragment::dealloc_repr(&entry.key, area);
            }
            return Err(e);
        }
    };
    let ptr = TriePtr::indirect(NodeType::LargeKeyTerm, state, offset, ALIGN_BITS, 0, 0);
    gc.add_new(ptr);
    Ok(ptr)
}

pub fn size(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    Ok(repr(area, ptr)?.size as u64)
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let r = repr(area, ptr)?;
    let mut entries = Vec::with_capacity(r.size as usize);
    for e in &r.entries[..r.size as usize] {
        entries.push((KeyFragment::load_repr(&e.key, area)?, e.value));
    }
    Ok(LocalNode::Terminal { entries })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    let r = *repr(area, ptr)?;
    for e in &r.entries[..r.size as usize] {
        KeyFragment::dealloc_repr(&e.key, area)?;
    }
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, 0),
        std::mem::size_of::<LargeKeyRepr>() as u64,
    )
}

pub fn direct_mem_usage(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let r = repr(area, ptr)?;
    let heap: u64 = r.entries[..r.size as usize]
        .iter()
        .map(|e| e.key.heap_usage())
        .sum();
    Ok(node_alloc::adjust_size(std::mem::size_of::<LargeKeyRepr>() as u64)? + heap)
}
