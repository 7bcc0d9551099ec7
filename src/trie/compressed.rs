//! The compressed terminal: up to 255 uniform-length entries bit-packed
//! into seven words of payload.
//!
//! Keys are stored biased by `key_offset` so only the spread costs bits;
//! when the keys form a dense run (`key_offset + i`) they cost no bits at
//! all and only the values are stored. Entries that don't fit the payload
//! fall through to a branching node.

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::key::KeyFragment;
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::LocalNode;
use crate::trie::ptr::{NodeType, State, TriePtr};

pub const MAX_ENTRIES: usize = 255;
const DATA_WORDS: usize = 7;
const BITS_AVAIL: u32 = DATA_WORDS as u32 * 64;
const ALIGN_BITS: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CompressedRepr {
    key_len: u8,
    /// Zero means keys are implicit: `key_offset + index`.
    key_bits: u8,
    value_bits: u8,
    size: u8,
    key_offset: u32,
    data: [u64; DATA_WORDS],
}

const _: () = assert!(std::mem::size_of::<CompressedRepr>() == 64);

fn write_bits(data: &mut [u64; DATA_WORDS], pos: u32, val: u64, n: u32) {
    if n == 0 {
        return;
    }
    debug_assert!(pos + n <= BITS_AVAIL);
    let val = if n == 64 { val } else { val & ((1u64 << n) - 1) };
    let w = (pos / 64) as usize;
    let off = pos % 64;
    let spread = (val as u128) << (128 - n as u128 - off as u128);
    data[w] |= (spread >> 64) as u64;
    if off + n > 64 {
        data[w + 1] |= spread as u64;
    }
}

fn read_bits(data: &[u64; DATA_WORDS], pos: u32, n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    debug_assert!(pos + n <= BITS_AVAIL);
    let w = (pos / 64) as usize;
    let off = pos % 64;
    let hi = data[w] as u128;
    let lo = if w + 1 < DATA_WORDS { data[w + 1] as u128 } else { 0 };
    ((((hi << 64) | lo) << off) >> (128 - n)) as u64
}

fn bits_needed(v: u64) -> u32 {
    64 - v.leading_zeros()
}

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a CompressedRepr> {
    Ok(unsafe { &*area.region().at::<CompressedRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

/// Try to compress sorted, uniform-length entries. `None` when the packed
/// form doesn't fit the payload or the key bias doesn't apply.
pub fn try_alloc(
    area: &MemoryAllocator,
    entries: &[(KeyFragment, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<Option<TriePtr>> {
    let n = entries.len();
    if n < 2 || n > MAX_ENTRIES {
        return Ok(None);
    }
    let key_len = entries[0].0.bits();
    debug_assert!(key_len <= 64);

    let base = entries[0].0.get_key();
    if base > u32::MAX as u64 {
        return Ok(None);
    }
    let last = entries[n - 1].0.get_key();

    // Dense run of keys? Then they're implicit.
    let implicit = entries
        .iter()
        .enumerate()
        .all(|(i, (k, _))| k.get_key() == base + i as u64);
    let key_bits = if implicit {
        0
    } else {
        bits_needed(last - base).max(1)
    };
    let value_bits = entries
        .iter()
        .map(|(_, v)| bits_needed(*v))
        .max()
        .unwrap_or(0);

    if (n as u32) * (key_bits + value_bits) > BITS_AVAIL {
        return Ok(None);
    }

    let mut r = CompressedRepr {
        key_len: key_len as u8,
        key_bits: key_bits as u8,
        value_bits: value_bits as u8,
        size: n as u8,
        key_offset: base as u32,
        data: [0; DATA_WORDS],
    };
    let mut pos = 0;
    for (k, v) in entries {
        write_bits(&mut r.data, pos, k.get_key() - base, key_bits);
        pos += key_bits;
        write_bits(&mut r.data, pos, *v, value_bits);
        pos += value_bits;
    }

    let offset = area.node_alloc.alloc_value(r)?;
    let ptr = TriePtr::indirect(NodeType::CompressedTerm, state, offset, ALIGN_BITS, 0, 0);
    gc.add_new(ptr);
    Ok(Some(ptr))
}

pub fn size(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    Ok(repr(area, ptr)?.size as u64)
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let r = repr(area, ptr)?;
    let (kb, vb) = (r.key_bits as u32, r.value_bits as u32);
    let mut entries = Vec::with_capacity(r.size as usize);
    let mut pos = 0;
    for i in 0..r.size as usize {
        let stored = read_bits(&r.data, pos, kb);
        pos += kb;
        let value = read_bits(&r.data, pos, vb);
        pos += vb;
        let key = if kb == 0 { i as u64 } else { stored } + r.key_offset as u64;
        entries.push((KeyFragment::new(key, r.key_len as u32), value));
    }
    if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(Error::Integrity {
            offset: ptr.offset(ALIGN_BITS, 0),
            detail: "compressed node keys out of order",
        });
    }
    Ok(LocalNode::Terminal { entries })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, 0),
        std::mem::size_of::<CompressedRepr>() as u64,
    )
}

pub fn direct_mem_usage(_area: &MemoryAllocator, _ptr: TriePtr) -> Result<u64> {
    node_alloc::adjust_size(std::mem::size_of::<CompressedRepr>() as u64)
}
