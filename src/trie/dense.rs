//! The dense branching node: 2 to 4 branching bits (4, 8 or 16 children).
//!
//! The branch array lives out of line in a node-allocator block of
//! `num_branches * 16` bytes; a 16-bit occupancy bitmap records which
//! branches exist, and `size_index` keeps the aggregate subtree size of
//! every group of four branches so that rank queries touch at most two
//! cache lines (the node and one branch group).

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::key::{KeyFragment, KeyFragmentRepr};
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::{self, LocalNode};
use crate::trie::ptr::{NodeType, State, TriePtr};

/// Maximum branching bits of a dense node (16-way fan-out).
pub const MAX_BITS: u32 = 4;

const ALIGN_BITS: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Branch {
    ptr: u64,
    size: u64,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DenseRepr {
    prefix: KeyFragmentRepr,
    value: u64,
    /// Offset of the external `[Branch; num_branches]` array.
    storage: u64,
    branch_index: u16,
    num_bits: u8,
    has_value: u8,
    unused: u32,
    /// Aggregate child sizes per group of four branches.
    size_index: [u64; 4],
}

const _: () = assert!(std::mem::size_of::<DenseRepr>() <= 96);

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a DenseRepr> {
    Ok(unsafe { &*area.region().at::<DenseRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

fn repr_mut<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a mut DenseRepr> {
    Ok(unsafe { &mut *area.region().at::<DenseRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

fn num_branches(num_bits: u8) -> usize {
    1usize << num_bits
}

fn storage_size(num_bits: u8) -> u64 {
    (num_branches(num_bits) * std::mem::size_of::<Branch>()) as u64
}

fn branches<'a>(area: &'a MemoryAllocator, r: &DenseRepr) -> Result<&'a [Branch]> {
    let p = area.region().at::<Branch>(r.storage)?;
    Ok(unsafe { std::slice::from_raw_parts(p, num_branches(r.num_bits)) })
}

fn branches_mut<'a>(area: &'a MemoryAllocator, r: &DenseRepr) -> Result<&'a mut [Branch]> {
    let p = area.region().at::<Branch>(r.storage)?;
    Ok(unsafe { std::slice::from_raw_parts_mut(p, num_branches(r.num_bits)) })
}

fn store(area: &MemoryAllocator, r: DenseRepr, state: State, gc: &mut GcList) -> Result<TriePtr> {
    let offset = area.node_alloc.alloc_value(r)?;
    let ptr = TriePtr::indirect(NodeType::DenseBranch, state, offset, ALIGN_BITS, 0, 0);
    gc.add_new(ptr);
    Ok(ptr)
}

fn in_place(ptr: TriePtr, state: State) -> bool {
    state == State::InPlace && ptr.state() == State::InPlace
}

/// Build a dense branch. `children` holds (branch, child, size).
pub fn alloc(
    area: &MemoryAllocator,
    prefix: &KeyFragment,
    value: Option<u64>,
    num_bits: u32,
    children: &[(u32, TriePtr, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    debug_assert!((2..=MAX_BITS).contains(&num_bits));
    let num_bits = num_bits as u8;

    let storage = area.node_alloc.allocate(storage_size(num_bits), None)?;
    let slots = {
        let p = area.region().at::<Branch>(storage)?;
        unsafe { std::slice::from_raw_parts_mut(p, num_branches(num_bits)) }
    };
    slots.fill(Branch { ptr: 0, size: 0 });

    let mut r = DenseRepr {
        prefix: KeyFragmentRepr::default(),
        value: value.unwrap_or(0),
        storage,
        branch_index: 0,
        num_bits,
        has_value: u8::from(value.is_some()),
        unused: 0,
        size_index: [0; 4],
    };
    for (b, child, csize) in children {
        let b = *b as usize;
        debug_assert!(b < num_branches(num_bits));
        slots[b] = Branch {
            ptr: child.bits(),
            size: *csize,
        };
        r.branch_index |= 1 << b;
        r.size_index[b / 4] += csize;
    }
    r.prefix = match prefix.alloc_repr(area) {
        Ok(p) => p,
        Err(e) => {
            let _ = area.node_alloc.deallocate(storage, storage_size(num_bits));
            return Err(e);
        }
    };
    store(area, r, state, gc)
}

pub fn size(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let r = repr(area, ptr)?;
    Ok(u64::from(r.has_value) + r.size_index.iter().sum::<u64>())
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let r = repr(area, ptr)?;
    let prefix = KeyFragment::load_repr(&r.prefix, area)?;
    let slots = branches(area, r)?;
    let mut out = Vec::with_capacity(r.branch_index.count_ones() as usize);
    for b in 0..num_branches(r.num_bits) {
        if r.branch_index & (1 << b) != 0 {
            out.push((
                KeyFragment::new(b as u64, r.num_bits as u32),
                TriePtr::from_bits(slots[b].ptr),
                slots[b].size,
            ));
        }
    }
    Ok(LocalNode::Branch {
        prefix,
        value: (r.has_value != 0).then_some(r.value),
        branches: out,
    })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    let r = *repr(area, ptr)?;
    KeyFragment::dealloc_repr(&r.prefix, area)?;
    area.node_alloc.deallocate(r.storage, storage_size(r.num_bits))?;
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, 0),
        std::mem::size_of::<DenseRepr>() as u64,
    )
}

pub fn direct_mem_usage(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let r = repr(area, ptr)?;
    Ok(node_alloc::adjust_size(std::mem::size_of::<DenseRepr>() as u64)?
        + node_alloc::adjust_size(storage_size(r.num_bits))?
        + r.prefix.heap_usage())
}

/// Copy the node (deep prefix, fresh branch storage), apply `f` to the
/// scratch branch array and repr, then store.
fn copy_with(
    area: &MemoryAllocator,
    ptr: TriePtr,
    state: State,
    gc: &mut GcList,
    f: impl FnOnce(&mut DenseRepr, &mut [Branch]),
) -> Result<TriePtr> {
    let old = *repr(area, ptr)?;
    let mut scratch: Vec<Branch> = branches(area, &old)?.to_vec();

    let mut r = old;
    f(&mut r, &mut scratch);

    r.storage = area.node_alloc.allocate(storage_size(r.num_bits), None)?;
    {
        let p = area.region().at::<Branch>(r.storage)?;
        let dst = unsafe { std::slice::from_raw_parts_mut(p, scratch.len()) };
        dst.copy_from_slice(&scratch);
    }
    r.prefix = match KeyFragment::copy_repr(&old.prefix, area) {
        Ok(p) => p,
        Err(e) => {
            let _ = area.node_alloc.deallocate(r.storage, storage_size(r.num_bits));
            return Err(e);
        }
    };
    let replacement = store(area, r, state, gc)?;
    node::retire(area, ptr, gc)?;
    Ok(replacement)
}

pub fn insert_leaf(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let r0 = *repr(area, ptr)?;
    let prefix = KeyFragment::load_repr(&r0.prefix, area)?;
    let cp = key.common_prefix_len(&prefix);
    let num_bits = r0.num_bits as u32;

    if cp < prefix.bits() {
        // Break-prefix: regroup under a shorter prefix.
        let mut kvs = node::gather_kv(area, ptr)?;
        kvs.push(node::KV::value(key.clone(), value));
        let replacement = node::make_node(area, kvs, state, gc)?;
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    if cp == key.bits() && key.bits() == prefix.bits() {
        // Insert into the value slot.
        if r0.has_value != 0 {
            return Err(Error::Logical("insert of a key that is already present"));
        }
        if in_place(ptr, state) {
            let r = repr_mut(area, ptr)?;
            r.value = value;
            r.has_value = 1;
            return Ok(ptr);
        }
        return copy_with(area, ptr, state, gc, |r, _| {
            r.value = value;
            r.has_value = 1;
        });
    }

    if key.bits() - prefix.bits() < num_bits {
        // Break-branches: the key ends inside our branch bits; the node
        // must be split into coarser levels. Regrouping the links achieves
        // the same shape.
        let mut kvs = node::gather_kv(area, ptr)?;
        kvs.push(node::KV::value(key.clone(), value));
        let replacement = node::make_node(area, kvs, state, gc)?;
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    // Insert into a child.
    let b = key.get_bits(num_bits, prefix.bits()) as usize;
    let rest = key.suffix(prefix.bits() + num_bits);
    let child = if r0.branch_index & (1 << b) != 0 {
        TriePtr::from_bits(branches(area, &r0)?[b].ptr)
    } else {
        TriePtr::NULL
    };
    let new_child = node::insert_leaf(area, child, &rest, value, state, gc)?;
    let new_size = branches(area, &r0)?[b].size + 1;

    if in_place(ptr, state) {
        let slots = branches_mut(area, &r0)?;
        slots[b] = Branch {
            ptr: new_child.bits(),
            size: new_size,
        };
        let r = repr_mut(area, ptr)?;
        r.branch_index |= 1 << b;
        r.size_index[b / 4] += 1;
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |r, slots| {
        slots[b] = Branch {
            ptr: new_child.bits(),
            size: new_size,
        };
        r.branch_index |= 1 << b;
        r.size_index[b / 4] += 1;
    })
}

pub fn remove_leaf(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let r0 = *repr(area, ptr)?;
    let prefix = KeyFragment::load_repr(&r0.prefix, area)?;
    let num_bits = r0.num_bits as u32;

    let mut has_value = r0.has_value != 0;
    let mut value = r0.value;
    let mut scratch: Vec<Branch> = branches(area, &r0)?.to_vec();
    let mut branch_index = r0.branch_index;
    let mut size_index = r0.size_index;

    if *key == prefix {
        if !has_value {
            return Err(Error::Logical("remove of an absent key"));
        }
        has_value = false;
        value = 0;
    } else {
        if !key.starts_with(&prefix) || key.bits() - prefix.bits() < num_bits {
            return Err(Error::Logical("remove of an absent key"));
        }
        let b = key.get_bits(num_bits, prefix.bits()) as usize;
        if branch_index & (1 << b) == 0 {
            return Err(Error::Logical("remove of an absent key"));
        }
        let rest = key.suffix(prefix.bits() + num_bits);
        let new_child = node::remove_leaf(area, TriePtr::from_bits(scratch[b].ptr), &rest, state, gc)?;
        scratch[b].size -= 1;
        scratch[b].ptr = new_child.bits();
        size_index[b / 4] -= 1;
        if new_child.is_null() {
            debug_assert_eq!(scratch[b].size, 0);
            branch_index &= !(1 << b);
        }
    }

    let total = u64::from(has_value) + size_index.iter().sum::<u64>();
    let count = branch_index.count_ones();

    // Simplify-subtree: small remainders collapse into one terminal.
    if total <= 3 {
        let mut entries = Vec::with_capacity(total as usize);
        if has_value {
            entries.push((prefix.clone(), value));
        }
        for (b, slot) in scratch.iter().enumerate() {
            if branch_index & (1 << b) != 0 {
                let mut below = prefix.clone();
                below.push_bits(b as u64, num_bits);
                node::gather_values(area, TriePtr::from_bits(slot.ptr), &below, &mut entries)?;
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let replacement = node::make_multi_leaf(area, &entries, state, gc)?;
        for (b, slot) in scratch.iter().enumerate() {
            if branch_index & (1 << b) != 0 {
                node::retire_subtree(area, TriePtr::from_bits(slot.ptr), gc)?;
            }
        }
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    // Simplify-node: one slot left means the node no longer branches; the
    // surviving child absorbs the prefix and branch bits.
    if u64::from(has_value) + u64::from(count) < 2 {
        debug_assert!(!has_value);
        let b = (0..scratch.len())
            .find(|b| branch_index & (1 << b) != 0)
            .expect("a branching node can't be empty with size > 3");
        let mut below = prefix.clone();
        below.push_bits(b as u64, num_bits);
        let replacement =
            node::prefix_keys(area, TriePtr::from_bits(scratch[b].ptr), &below, state, gc)?;
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    if in_place(ptr, state) {
        let slots = branches_mut(area, &r0)?;
        slots.copy_from_slice(&scratch);
        let r = repr_mut(area, ptr)?;
        r.has_value = u8::from(has_value);
        r.value = value;
        r.branch_index = branch_index;
        r.size_index = size_index;
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |r, slots| {
        slots.copy_from_slice(&scratch);
        r.has_value = u8::from(has_value);
        r.value = value;
        r.branch_index = branch_index;
        r.size_index = size_index;
    })
}

pub fn replace_value(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let r0 = *repr(area, ptr)?;
    let prefix = KeyFragment::load_repr(&r0.prefix, area)?;
    let num_bits = r0.num_bits as u32;

    if *key == prefix {
        if r0.has_value == 0 {
            return Err(Error::Logical("replace of an absent key"));
        }
        if in_place(ptr, state) {
            repr_mut(area, ptr)?.value = value;
            return Ok(ptr);
        }
        return copy_with(area, ptr, state, gc, |r, _| r.value = value);
    }

    if !key.starts_with(&prefix) || key.bits() - prefix.bits() < num_bits {
        return Err(Error::Logical("replace of an absent key"));
    }
    let b = key.get_bits(num_bits, prefix.bits()) as usize;
    if r0.branch_index & (1 << b) == 0 {
        return Err(Error::Logical("replace of an absent key"));
    }
    let rest = key.suffix(prefix.bits() + num_bits);
    let child = TriePtr::from_bits(branches(area, &r0)?[b].ptr);
    let new_child = node::replace_value(area, child, &rest, value, state, gc)?;

    if in_place(ptr, state) {
        branches_mut(area, &r0)?[b].ptr = new_child.bits();
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |_, slots| {
        slots[b].ptr = new_child.bits();
    })
}

pub fn prefix_keys(
    area: &MemoryAllocator,
    ptr: TriePtr,
    prefix: &KeyFragment,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let old_prefix = KeyFragment::load_repr(&repr(area, ptr)?.prefix, area)?;
    let new_prefix = prefix.concat(&old_prefix);

    if in_place(ptr, state) {
        let new_repr = new_prefix.alloc_repr(area)?;
        let r = repr_mut(area, ptr)?;
        let old = r.prefix;
        r.prefix = new_repr;
        KeyFragment::dealloc_repr(&old, area)?;
        return Ok(ptr);
    }

    let old = *repr(area, ptr)?;
    let scratch: Vec<Branch> = branches(area, &old)?.to_vec();
    let mut r = old;
    r.storage = area.node_alloc.allocate(storage_size(r.num_bits), None)?;
    {
        let p = area.region().at::<Branch>(r.storage)?;
        unsafe { std::slice::from_raw_parts_mut(p, scratch.len()) }.copy_from_slice(&scratch);
    }
    r.prefix = new_prefix.alloc_repr(area)?;
    let replacement = store(area, r, state, gc)?;
    node::retire(area, ptr, gc)?;
    Ok(replacement)
}
