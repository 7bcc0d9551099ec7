//! The binary branch: a prefix, an optional value at the prefix, and two
//! children selected by the next key bit. The simplest non-terminal; also
//! what the factories emit for two-way fan-out.

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::key::{KeyFragment, KeyFragmentRepr};
use crate::node_alloc;
use crate::trie::gc_list::GcList;
use crate::trie::node::{self, LocalNode};
use crate::trie::ptr::{NodeType, State, TriePtr};

const ALIGN_BITS: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BinaryRepr {
    prefix: KeyFragmentRepr,
    value: u64,
    children: [u64; 2],
    child_sizes: [u64; 2],
    has_value: u8,
    unused: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<BinaryRepr>() == 64);

fn repr<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a BinaryRepr> {
    Ok(unsafe { &*area.region().at::<BinaryRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

fn repr_mut<'a>(area: &'a MemoryAllocator, ptr: TriePtr) -> Result<&'a mut BinaryRepr> {
    Ok(unsafe { &mut *area.region().at::<BinaryRepr>(ptr.offset(ALIGN_BITS, 0))? })
}

fn store(
    area: &MemoryAllocator,
    r: BinaryRepr,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let offset = match area.node_alloc.alloc_value(r) {
        Ok(o) => o,
        Err(e) => {
            let _ = KeyFragment::dealloc_repr(&r.prefix, area);
            return Err(e);
        }
    };
    let ptr = TriePtr::indirect(NodeType::BinaryBranch, state, offset, ALIGN_BITS, 0, 0);
    gc.add_new(ptr);
    Ok(ptr)
}

/// Can this mutation write through the node instead of copying it?
fn in_place(ptr: TriePtr, state: State) -> bool {
    state == State::InPlace && ptr.state() == State::InPlace
}

/// Build a binary branch. `children` holds (branch bit, child, size).
pub fn alloc(
    area: &MemoryAllocator,
    prefix: &KeyFragment,
    value: Option<u64>,
    children: &[(u32, TriePtr, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let mut r = BinaryRepr {
        prefix: prefix.alloc_repr(area)?,
        value: value.unwrap_or(0),
        children: [0; 2],
        child_sizes: [0; 2],
        has_value: u8::from(value.is_some()),
        unused: [0; 7],
    };
    for (b, child, csize) in children {
        debug_assert!(*b < 2);
        r.children[*b as usize] = child.bits();
        r.child_sizes[*b as usize] = *csize;
    }
    store(area, r, state, gc)
}

pub fn size(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let r = repr(area, ptr)?;
    Ok(u64::from(r.has_value) + r.child_sizes[0] + r.child_sizes[1])
}

pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    let r = repr(area, ptr)?;
    let prefix = KeyFragment::load_repr(&r.prefix, area)?;
    let mut branches = Vec::with_capacity(2);
    for b in 0..2 {
        let child = TriePtr::from_bits(r.children[b]);
        if !child.is_null() {
            branches.push((KeyFragment::new(b as u64, 1), child, r.child_sizes[b]));
        }
    }
    Ok(LocalNode::Branch {
        prefix,
        value: (r.has_value != 0).then_some(r.value),
        branches,
    })
}

pub fn deallocate(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    let prefix = repr(area, ptr)?.prefix;
    KeyFragment::dealloc_repr(&prefix, area)?;
    area.node_alloc.deallocate(
        ptr.offset(ALIGN_BITS, 0),
        std::mem::size_of::<BinaryRepr>() as u64,
    )
}

pub fn direct_mem_usage(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    let heap = repr(area, ptr)?.prefix.heap_usage();
    Ok(node_alloc::adjust_size(std::mem::size_of::<BinaryRepr>() as u64)? + heap)
}

/// Copy the repr with a deep-copied prefix, apply `f`, and store it.
fn copy_with(
    area: &MemoryAllocator,
    ptr: TriePtr,
    state: State,
    gc: &mut GcList,
    f: impl FnOnce(&mut BinaryRepr),
) -> Result<TriePtr> {
    let mut r = *repr(area, ptr)?;
    r.prefix = KeyFragment::copy_repr(&r.prefix, area)?;
    f(&mut r);
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
    let prefix = KeyFragment::load_repr(&repr(area, ptr)?.prefix, area)?;
    let cp = key.common_prefix_len(&prefix);

    if cp < prefix.bits() {
        // Break-prefix: regroup everything under a shorter prefix. The
        // children are carried over as links; only this node is displaced.
        let mut kvs = node::gather_kv(area, ptr)?;
        kvs.push(node::KV::value(key.clone(), value));
        let replacement = node::make_node(area, kvs, state, gc)?;
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    if cp == key.bits() {
        // The key ends exactly at the prefix: it becomes the node value.
        let r = repr(area, ptr)?;
        if r.has_value != 0 {
            return Err(Error::Logical("insert of a key that is already present"));
        }
        if in_place(ptr, state) {
            let r = repr_mut(area, ptr)?;
            r.value = value;
            r.has_value = 1;
            return Ok(ptr);
        }
        return copy_with(area, ptr, state, gc, |r| {
            r.value = value;
            r.has_value = 1;
        });
    }

    // Descend into the branch selected by the next bit.
    let b = key.get_bits(1, prefix.bits()) as usize;
    let rest = key.suffix(prefix.bits() + 1);
    let child = TriePtr::from_bits(repr(area, ptr)?.children[b]);
    let new_child = node::insert_leaf(area, child, &rest, value, state, gc)?;

    if in_place(ptr, state) {
        let r = repr_mut(area, ptr)?;
        r.children[b] = new_child.bits();
        r.child_sizes[b] += 1;
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |r| {
        r.children[b] = new_child.bits();
        r.child_sizes[b] += 1;
    })
}

pub fn remove_leaf(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    let prefix = KeyFragment::load_repr(&repr(area, ptr)?.prefix, area)?;

    // Apply the removal to a scratch copy of the node's fields first.
    let r = *repr(area, ptr)?;
    let mut has_value = r.has_value != 0;
    let mut value = r.value;
    let mut children = [TriePtr::from_bits(r.children[0]), TriePtr::from_bits(r.children[1])];
    let mut sizes = r.child_sizes;

    if *key == prefix {
        if !has_value {
            return Err(Error::Logical("remove of an absent key"));
        }
        has_value = false;
        value = 0;
    } else {
        if !key.starts_with(&prefix) {
            return Err(Error::Logical("remove of an absent key"));
        }
        let b = key.get_bits(1, prefix.bits()) as usize;
        let rest = key.suffix(prefix.bits() + 1);
        if children[b].is_null() {
            return Err(Error::Logical("remove of an absent key"));
        }
        children[b] = node::remove_leaf(area, children[b], &rest, state, gc)?;
        sizes[b] -= 1;
        if children[b].is_null() {
            debug_assert_eq!(sizes[b], 0);
        }
    }

    let total = u64::from(has_value) + sizes[0] + sizes[1];
    let slots = u64::from(has_value)
        + u64::from(!children[0].is_null())
        + u64::from(!children[1].is_null());

    // Small subtrees collapse back into a terminal.
    if total <= 3 {
        let mut entries = Vec::with_capacity(total as usize);
        if has_value {
            entries.push((prefix.clone(), value));
        }
        for b in 0..2 {
            let mut below = prefix.clone();
            below.push_bits(b as u64, 1);
            node::gather_values(area, children[b], &below, &mut entries)?;
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let replacement = node::make_multi_leaf(area, &entries, state, gc)?;
        for b in 0..2 {
            node::retire_subtree(area, children[b], gc)?;
        }
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    // A branching node below two slots absorbs its prefix into the
    // remaining child.
    if slots < 2 {
        debug_assert!(!has_value, "value-only case is covered by the collapse above");
        let b = usize::from(children[0].is_null());
        let mut below = prefix.clone();
        below.push_bits(b as u64, 1);
        let replacement = node::prefix_keys(area, children[b], &below, state, gc)?;
        node::retire(area, ptr, gc)?;
        return Ok(replacement);
    }

    if in_place(ptr, state) {
        let r = repr_mut(area, ptr)?;
        r.has_value = u8::from(has_value);
        r.value = value;
        r.children = [children[0].bits(), children[1].bits()];
        r.child_sizes = sizes;
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |r| {
        r.has_value = u8::from(has_value);
        r.value = value;
        r.children = [children[0].bits(), children[1].bits()];
        r.child_sizes = sizes;
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
    let prefix = KeyFragment::load_repr(&repr(area, ptr)?.prefix, area)?;

    if *key == prefix {
        if repr(area, ptr)?.has_value == 0 {
            return Err(Error::Logical("replace of an absent key"));
        }
        if in_place(ptr, state) {
            repr_mut(area, ptr)?.value = value;
            return Ok(ptr);
        }
        return copy_with(area, ptr, state, gc, |r| r.value = value);
    }

    if !key.starts_with(&prefix) {
        return Err(Error::Logical("replace of an absent key"));
    }
    let b = key.get_bits(1, prefix.bits()) as usize;
    let rest = key.suffix(prefix.bits() + 1);
    let child = TriePtr::from_bits(repr(area, ptr)?.children[b]);
    let new_child = node::replace_value(area, child, &rest, value, state, gc)?;

    if in_place(ptr, state) {
        repr_mut(area, ptr)?.children[b] = new_child.bits();
        return Ok(ptr);
    }
    copy_with(area, ptr, state, gc, |r| r.children[b] = new_child.bits())
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

    let mut r = *repr(area, ptr)?;
    r.prefix = new_prefix.alloc_repr(area)?;
    let replacement = store(area, r, state, gc)?;
    node::retire(area, ptr, gc)?;
    Ok(replacement)
}
