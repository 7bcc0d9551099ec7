//! The basic keyed terminal: one value plus a key too large for the
//! inline encoding. The key lives in a [`KeyFragmentRepr`], spilling to
//! chained 64-byte slots when it exceeds 64 bits.

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::key::{KeyFragment, KeyFragmentRepr};
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::LocalNode;
use crate::trie::ptr::{NodeType, State, TriePtr};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BasicKeyedRepr {
    value: u64,
    key: KeyFragmentRepr,
}

const ALIGN_BITS: u32 = 3;

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a BasicKeyedRepr> {
    Ok(unsafe { &*area.region().at::<BasicKeyedRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

pub fn alloc(
    area: &MemoryAllocator,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let key_repr = key.alloc_repr(area)?;
    let offset = match area.node_alloc.alloc_value(BasicKeyedRepr {
        value,
        key: key_repr,
    }) {
        Ok(o) => o,
        Err(e) => {
            let _ = KeyFragment::dealloc_repr(&key_repr, area);
            return Err(e);
        }
    };
    let ptr = TriePtr::indirect(NodeType::BasicKeyedTerm, state, offset, ALIGN_BITS, 0, 0);
    gc.add_new(ptr);
    Ok(ptr)
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let r = repr(area, ptr)?;
    let key = KeyFragment::load_repr(&r.key, area)?;
    Ok(LocalNode::Terminal {
        entries: vec![(key, r.value)],
    })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    let key = repr(area, ptr)?.key;
    KeyFragment::dealloc_repr(&key, area)?;
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, 0),
        std::mem::size_of::<BasicKeyedRepr>() as u64,
    )
}

pub fn direct_mem_usage(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let heap = repr(area, ptr)?.key.heap_usage();
    Ok(node_alloc::adjust_size(std::mem::size_of::<BasicKeyedRepr>() as u64)? + heap)
}
