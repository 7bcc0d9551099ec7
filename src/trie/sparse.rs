//! The sparse terminal: up to four entries whose keys share one length of
//! at most 64 bits, stored uncompressed as (key, value) words. The key
//! length and entry count live in the pointer's metadata bits
//! (`key_len:7 | size:3`), so the repr is exactly one cache line of
//! payload.

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::key::KeyFragment;
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::LocalNode;
use crate::trie::ptr::{NodeType, State, TriePtr};

pub const MAX_ENTRIES: usize = 4;

const ALIGN_BITS: u32 = 6;
const META_BITS: u32 = 10;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SparseEntry {
    key: u64,
    value: u64,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SparseRepr {
    entries: [SparseEntry; MAX_ENTRIES],
}

const _: () = assert!(std::mem::size_of::<SparseRepr>() == 64);

fn meta(key_len: u32, size: usize) -> u32 {
    debug_assert!(key_len <= 64 && (1..=MAX_ENTRIES).contains(&size));
    key_len | ((size as u32) << 7)
}

fn decode_meta(ptr: TriePtr) -> (u32, usize) {
    let m = ptr.meta(META_BITS);
    (m & 0x7F, (m >> 7) as usize)
}

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a SparseRepr> {
    Ok(unsafe { &*area.region().at::<SparseRepr>(ptr.offset(ALIGN_BITS, META_BITS))? })
}

/// Build a sparse terminal over sorted, uniform-length entries.
pub fn alloc(
    area: &MemoryAllocator,
    entries: &[(KeyFragment, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    debug_assert!((2..=MAX_ENTRIES).contains(&entries.len()));
    let key_len = entries[0].0.bits();
    let mut r: SparseRepr = bytemuck::Zeroable::zeroed();
    for (i, (k, v)) in entries.iter().enumerate() {
        debug_assert_eq!(k.bits(), key_len);
        r.entries[i] = SparseEntry {
            key: k.get_key(),
            value: *v,
        };
    }
    let offset = area.node_alloc.alloc_value(r)?;
    let ptr = TriePtr::indirect(
        NodeType::SparseTerm,
        state,
        offset,
        ALIGN_BITS,
        META_BITS,
        meta(key_len, entries.len()),
    );
    gc.add_new(ptr);
    Ok(ptr)
}

pub fn size(_area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    Ok(decode_meta(ptr).1 as u64)
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let (key_len, size) = decode_meta(ptr);
    let r = repr(area, ptr)?;
    let entries = r.entries[..size]
        .iter()
        .map(|e| (KeyFragment::new(e.key, key_len), e.value))
        .collect();
    Ok(LocalNode::Terminal { entries })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, META_BITS),
        std::mem::size_of::<SparseRepr>() as u64,
    )
}

pub fn direct_mem_usage(_area: &MemoryAllocator, _ptr: TriePtr) -> Result<u64> {
    node_alloc::adjust_size(std::mem::size_of::<SparseRepr>() as u64)
}
