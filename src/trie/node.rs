//! Node operations: the closed-set dispatch over the eight node variants,
//! the node factories, and the generic walk/mutate drivers.
//!
//! Every variant module exposes a small set of operations on its own repr;
//! everything that can be expressed over a node's *local* shape (its own
//! entries and child links) is implemented here once, on [`LocalNode`].
//! Mutations follow the copy-on-write discipline: a builder never touches
//! the node it replaces, displaced nodes go onto the [`GcList`], and the
//! caller publishes the new subtree with a single root CAS.

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};
use crate::key::KeyFragment;
use crate::trie::gc_list::GcList;
use crate::trie::ptr::{NodeType, State, TriePtr};
use crate::trie::{binary, compressed, dense, inline, large_key, sparse, terminal};

/// A key/value pair during node construction: either a real value or a
/// link to an existing subtree whose keys all extend `key`.
#[derive(Clone, Debug)]
pub struct KV {
    pub key: KeyFragment,
    pub val: KvSlot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvSlot {
    Value(u64),
    Child(TriePtr),
}

impl KV {
    pub fn value(key: KeyFragment, value: u64) -> KV {
        KV {
            key,
            val: KvSlot::Value(value),
        }
    }

    pub fn child(key: KeyFragment, ptr: TriePtr) -> KV {
        KV {
            key,
            val: KvSlot::Child(ptr),
        }
    }

    pub fn is_child(&self) -> bool {
        matches!(self.val, KvSlot::Child(_))
    }
}

/// A node's local shape, produced by each variant's `local()`.
pub enum LocalNode {
    /// Terminal: sorted (key, value) entries relative to the node start.
    Terminal { entries: Vec<(KeyFragment, u64)> },
    /// Branching: common prefix, optional value at the prefix, and sorted
    /// (branch bits, child, subtree size) links.
    Branch {
        prefix: KeyFragment,
        value: Option<u64>,
        branches: Vec<(KeyFragment, TriePtr, u64)>,
    },
}

/// Aggregated statistics over a subtree.
#[derive(Default, Debug, Clone, Copy)]
pub struct TrieStats {
    pub node_count: u64,
    pub values: u64,
    pub total_bytes: u64,
    pub max_depth: u32,
    pub max_key_bits: u32,
    pub per_type: [u64; 8],
}

/*****************************************************************************/
/* DISPATCH                                                                  */
/*****************************************************************************/

/// Number of entries in the subtree under `ptr`.
pub fn size(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    match ptr.node_type() {
        NodeType::Null => Ok(0),
        NodeType::InlineTerm => Ok(1),
        NodeType::BasicKeyedTerm => Ok(1),
        NodeType::SparseTerm => sparse::size(area, ptr),
        NodeType::CompressedTerm => compressed::size(area, ptr),
        NodeType::LargeKeyTerm => large_key::size(area, ptr),
        NodeType::BinaryBranch => binary::size(area, ptr),
        NodeType::DenseBranch => dense::size(area, ptr),
    }
}

/// Decode the node's local shape.
pub fn local(area: &MemoryAllocator, ptr: TriePtr) -> Result<LocalNode> {
    match ptr.node_type() {
        NodeType::Null => Ok(LocalNode::Terminal { entries: vec![] }),
        NodeType::InlineTerm => inline::local(ptr),
        NodeType::BasicKeyedTerm => terminal::local(area, ptr),
        NodeType::SparseTerm => sparse::local(area, ptr),
        NodeType::CompressedTerm => compressed::local(area, ptr),
        NodeType::LargeKeyTerm => large_key::local(area, ptr),
        NodeType::BinaryBranch => binary::local(area, ptr),
        NodeType::DenseBranch => dense::local(area, ptr),
    }
}

/// Free this node's own storage (not its children).
pub fn deallocate_node(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    match ptr.node_type() {
        NodeType::Null | NodeType::InlineTerm => Ok(()),
        NodeType::BasicKeyedTerm => terminal::deallocate(area, ptr),
        NodeType::SparseTerm => sparse::deallocate(area, ptr),
        NodeType::CompressedTerm => compressed::deallocate(area, ptr),
        NodeType::LargeKeyTerm => large_key::deallocate(area, ptr),
        NodeType::BinaryBranch => binary::deallocate(area, ptr),
        NodeType::DenseBranch => dense::deallocate(area, ptr),
    }
}

/// Bytes of storage directly owned by this node (repr, key chains,
/// external branch storage). Children excluded.
pub fn direct_mem_usage(area: &MemoryAllocator, ptr: TriePtr) -> Result<u64> {
    match ptr.node_type() {
        NodeType::Null | NodeType::InlineTerm => Ok(0),
        NodeType::BasicKeyedTerm => terminal::direct_mem_usage(area, ptr),
        NodeType::SparseTerm => sparse::direct_mem_usage(area, ptr),
        NodeType::CompressedTerm => compressed::direct_mem_usage(area, ptr),
        NodeType::LargeKeyTerm => large_key::direct_mem_usage(area, ptr),
        NodeType::BinaryBranch => binary::direct_mem_usage(area, ptr),
        NodeType::DenseBranch => dense::direct_mem_usage(area, ptr),
    }
}

/*****************************************************************************/
/* GENERIC WALKS                                                             */
/*****************************************************************************/

/// Find `key` in the subtree. Returns `(rank, value)` on a hit.
pub fn find_rank(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
) -> Result<Option<(u64, u64)>> {
    if ptr.is_null() {
        return Ok(None);
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => Ok(entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| (i as u64, entries[i].1))),
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            if !key.starts_with(&prefix) {
                return Ok(None);
            }
            let rest = key.suffix(prefix.bits());
            if rest.is_empty() {
                return Ok(value.map(|v| (0, v)));
            }
            let mut rank = u64::from(value.is_some());
            for (bkey, child, size) in branches {
                if rest.starts_with(&bkey) {
                    let sub = rest.suffix(bkey.bits());
                    return Ok(find_rank(area, child, &sub)?.map(|(r, v)| (rank + r, v)));
                }
                if bkey < rest.prefix(rest.bits().min(bkey.bits())) {
                    rank += size;
                } else {
                    break;
                }
            }
            Ok(None)
        }
    }
}

/// Rank of the first entry whose key is >= `key`.
pub fn lower_bound_rank(area: &MemoryAllocator, ptr: TriePtr, key: &KeyFragment) -> Result<u64> {
    bound_rank(area, ptr, key, false)
}

/// Rank of the first entry whose key is > `key`.
pub fn upper_bound_rank(area: &MemoryAllocator, ptr: TriePtr, key: &KeyFragment) -> Result<u64> {
    bound_rank(area, ptr, key, true)
}

fn bound_rank(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    upper: bool,
) -> Result<u64> {
    if ptr.is_null() {
        return Ok(0);
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => Ok(entries
            .partition_point(|(k, _)| if upper { k <= key } else { k < key })
            as u64),
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let cp = key.common_prefix_len(&prefix);
            if cp < key.bits() && cp < prefix.bits() {
                // Diverges inside the prefix: the whole subtree is on one
                // side of the key. A clear key bit at the divergence means
                // the key sorts before every entry (bound rank 0); a set
                // one means it sorts after all of them.
                return if key.get_bits(1, cp) < prefix.get_bits(1, cp) {
                    Ok(0)
                } else {
                    size(area, ptr)
                };
            }
            if cp == key.bits() {
                // The key is a (proper or exact) prefix of every entry
                // except possibly the node value.
                if key.bits() == prefix.bits() {
                    // key == prefix: the value entry matches exactly.
                    return Ok(if upper { u64::from(value.is_some()) } else { 0 });
                }
                return Ok(0);
            }

            // The key extends the prefix.
            let rest = key.suffix(prefix.bits());
            let mut rank = u64::from(value.is_some());
            for (bkey, child, csize) in branches {
                let cmp_len = rest.bits().min(bkey.bits());
                let rp = rest.prefix(cmp_len);
                let bp = bkey.prefix(cmp_len);
                if bp < rp {
                    rank += csize;
                    continue;
                }
                if bp > rp {
                    break;
                }
                if rest.bits() <= bkey.bits() {
                    // rest is a prefix of the branch bits: every entry in
                    // the child extends the key.
                    if rest.bits() == bkey.bits() {
                        rank += bound_rank(area, child, &KeyFragment::empty(), upper)?;
                    }
                    break;
                }
                rank += bound_rank(area, child, &rest.suffix(bkey.bits()), upper)?;
                break;
            }
            Ok(rank)
        }
    }
}

/// The `(key, value)` pair at rank `idx` within the subtree.
pub fn entry_at(area: &MemoryAllocator, ptr: TriePtr, idx: u64) -> Result<(KeyFragment, u64)> {
    if ptr.is_null() {
        return Err(Error::Logical("entry index out of range"));
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => entries
            .get(idx as usize)
            .cloned()
            .ok_or(Error::Logical("entry index out of range")),
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let mut idx = idx;
            if let Some(v) = value {
                if idx == 0 {
                    return Ok((prefix, v));
                }
                idx -= 1;
            }
            for (bkey, child, csize) in branches {
                if idx < csize {
                    let (sub, v) = entry_at(area, child, idx)?;
                    let mut k = prefix.clone();
                    k.append(&bkey);
                    k.append(&sub);
                    return Ok((k, v));
                }
                idx -= csize;
            }
            Err(Error::Logical("entry index out of range"))
        }
    }
}

/// Collect every `(key, value)` in the subtree, keys prefixed by `base`.
pub fn gather_values(
    area: &MemoryAllocator,
    ptr: TriePtr,
    base: &KeyFragment,
    out: &mut Vec<(KeyFragment, u64)>,
) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => {
            for (k, v) in entries {
                out.push((base.concat(&k), v));
            }
        }
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let below = base.concat(&prefix);
            if let Some(v) = value {
                out.push((below.clone(), v));
            }
            for (bkey, child, _) in branches {
                gather_values(area, child, &below.concat(&bkey), out)?;
            }
        }
    }
    Ok(())
}

/// Gather the node's immediate entries as KVs: values stay values, child
/// links become `Child` KVs keyed by prefix + branch bits.
pub fn gather_kv(area: &MemoryAllocator, ptr: TriePtr) -> Result<Vec<KV>> {
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => Ok(entries
            .into_iter()
            .map(|(k, v)| KV::value(k, v))
            .collect()),
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let mut kvs = Vec::with_capacity(branches.len() + 1);
            if let Some(v) = value {
                kvs.push(KV::value(prefix.clone(), v));
            }
            for (bkey, child, _) in branches {
                kvs.push(KV::child(prefix.concat(&bkey), child));
            }
            Ok(kvs)
        }
    }
}

/// Aggregate statistics over the subtree.
pub fn stats(
    area: &MemoryAllocator,
    ptr: TriePtr,
    depth: u32,
    key_bits: u32,
    acc: &mut TrieStats,
) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    acc.node_count += 1;
    acc.per_type[ptr.node_type() as usize] += 1;
    acc.total_bytes += direct_mem_usage(area, ptr)?;
    acc.max_depth = acc.max_depth.max(depth);
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => {
            acc.values += entries.len() as u64;
            for (k, _) in &entries {
                acc.max_key_bits = acc.max_key_bits.max(key_bits + k.bits());
            }
        }
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            if value.is_some() {
                acc.values += 1;
                acc.max_key_bits = acc.max_key_bits.max(key_bits + prefix.bits());
            }
            for (bkey, child, _) in branches {
                stats(area, child, depth + 1, key_bits + prefix.bits() + bkey.bits(), acc)?;
            }
        }
    }
    Ok(())
}

/// Free a whole subtree immediately. Only safe when nothing can reach it
/// (rollback of unpublished nodes, or after a defer barrier).
pub fn deallocate_subtree(area: &MemoryAllocator, ptr: TriePtr) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    if let LocalNode::Branch { branches, .. } = local(area, ptr)? {
        for (_, child, _) in branches {
            deallocate_subtree(area, child)?;
        }
    }
    deallocate_node(area, ptr)
}

/// Dump the subtree structure for debugging.
pub fn dump(
    area: &MemoryAllocator,
    ptr: TriePtr,
    indent: usize,
    max_depth: usize,
    out: &mut String,
) -> Result<()> {
    use std::fmt::Write;
    let pad = "  ".repeat(indent);
    if ptr.is_null() {
        let _ = writeln!(out, "{pad}(null)");
        return Ok(());
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => {
            let _ = writeln!(out, "{pad}{:?} x{}", ptr, entries.len());
            for (k, v) in entries {
                let _ = writeln!(out, "{pad}  {k:?} -> {v}");
            }
        }
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let _ = writeln!(
                out,
                "{pad}{:?} prefix={prefix:?} value={value:?} branches={}",
                ptr,
                branches.len()
            );
            if max_depth == 0 || indent < max_depth {
                for (bkey, child, csize) in branches {
                    let _ = writeln!(out, "{pad}  [{bkey:?}] size={csize}");
                    dump(area, child, indent + 2, max_depth, out)?;
                }
            }
        }
    }
    Ok(())
}

/*****************************************************************************/
/* MUTATION HELPERS                                                         */
/*****************************************************************************/

/// Retire every node of a subtree (used when a collapse rebuilds it from
/// its gathered values).
pub fn retire_subtree(area: &MemoryAllocator, ptr: TriePtr, gc: &mut GcList) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    if let LocalNode::Branch { branches, .. } = local(area, ptr)? {
        for (_, child, _) in branches {
            retire_subtree(area, child, gc)?;
        }
    }
    retire(area, ptr, gc)
}

/// Retire a node displaced by a mutation. Copy-on-write nodes wait for the
/// epoch to drain; in-place nodes are private and die immediately.
pub fn retire(area: &MemoryAllocator, ptr: TriePtr, gc: &mut GcList) -> Result<()> {
    if ptr.is_null() {
        return Ok(());
    }
    match ptr.state() {
        State::CopyOnWrite => gc.add_old(ptr),
        State::InPlace => {
            gc.forget_new(ptr);
            deallocate_node(area, ptr)?;
        }
    }
    Ok(())
}

/*****************************************************************************/
/* FACTORIES                                                                 */
/*****************************************************************************/

/// A single-entry terminal: inline in the pointer when it fits, otherwise
/// a keyed terminal node.
pub fn make_leaf(
    area: &MemoryAllocator,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    if let Some(ptr) = inline::encode(key, value, state) {
        return Ok(ptr);
    }
    terminal::alloc(area, key, value, state, gc)
}

/// A terminal node over multiple sorted (key, value) entries. Chooses the
/// densest representation that fits, bursting to a branching node when
/// none does.
pub fn make_multi_leaf(
    area: &MemoryAllocator,
    entries: &[(KeyFragment, u64)],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0), "entries unsorted");
    match entries.len() {
        0 => return Ok(TriePtr::NULL),
        1 => return make_leaf(area, &entries[0].0, entries[0].1, state, gc),
        _ => {}
    }

    let key_len = entries[0].0.bits();
    let uniform = entries.iter().all(|(k, _)| k.bits() == key_len) && key_len <= 64;

    if uniform && entries.len() <= sparse::MAX_ENTRIES {
        return sparse::alloc(area, entries, state, gc);
    }
    if entries.len() <= large_key::MAX_ENTRIES {
        return large_key::alloc(area, entries, state, gc);
    }
    if uniform {
        if let Some(ptr) = compressed::try_alloc(area, entries, state, gc)? {
            return Ok(ptr);
        }
    }

    let kvs: Vec<KV> = entries
        .iter()
        .map(|(k, v)| KV::value(k.clone(), *v))
        .collect();
    make_branching(area, &kvs, state, gc)
}

/// Build a branching node over mixed value/child KVs. All keys must be
/// distinct; child KVs' keys must extend the common prefix by at least one
/// bit.
pub fn make_branching(
    area: &MemoryAllocator,
    kvs: &[KV],
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    debug_assert!(kvs.len() >= 2, "branching node needs at least two slots");

    // Common prefix over every key.
    let mut cp = kvs[0].key.clone();
    for kv in &kvs[1..] {
        cp = cp.prefix(cp.common_prefix_len(&kv.key));
    }

    // At most one KV sits exactly at the prefix and becomes the value.
    let mut value: Option<u64> = None;
    let mut rest: Vec<&KV> = Vec::with_capacity(kvs.len());
    for kv in kvs {
        if kv.key.bits() == cp.bits() {
            match kv.val {
                KvSlot::Value(v) => {
                    debug_assert!(value.is_none(), "duplicate key at branch prefix");
                    value = Some(v);
                }
                KvSlot::Child(_) => {
                    return Err(Error::Logical("child link cannot sit at the branch prefix"))
                }
            }
        } else {
            rest.push(kv);
        }
    }
    debug_assert!(!rest.is_empty());

    // Fan-out: as many bits as every remaining key can spare, capped at 4.
    let num_bits = rest
        .iter()
        .map(|kv| kv.key.bits() - cp.bits())
        .min()
        .unwrap_or(1)
        .min(dense::MAX_BITS);
    debug_assert!(num_bits >= 1);

    // Bucket by the first num_bits beyond the prefix.
    let num_buckets = 1usize << num_bits;
    let mut buckets: Vec<Vec<&KV>> = vec![Vec::new(); num_buckets];
    for kv in &rest {
        let b = kv.key.get_bits(num_bits, cp.bits()) as usize;
        buckets[b].push(*kv);
    }

    // Build each bucket's child.
    let mut children: Vec<(u32, TriePtr, u64)> = Vec::new();
    for (b, bucket) in buckets.iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let strip = cp.bits() + num_bits;
        let child = if bucket.len() == 1 {
            let kv = bucket[0];
            let sub = kv.key.suffix(strip);
            match kv.val {
                KvSlot::Child(ptr) if sub.is_empty() => ptr,
                KvSlot::Child(ptr) => prefix_keys(area, ptr, &sub, state, gc)?,
                KvSlot::Value(v) => make_leaf(area, &sub, v, state, gc)?,
            }
        } else {
            let sub_kvs: Vec<KV> = bucket
                .iter()
                .map(|kv| KV {
                    key: kv.key.suffix(strip),
                    val: kv.val,
                })
                .collect();
            make_node(area, sub_kvs, state, gc)?
        };
        let csize = size(area, child)?;
        children.push((b as u32, child, csize));
    }

    if num_bits == 1 {
        binary::alloc(area, &cp, value, &children, state, gc)
    } else {
        dense::alloc(area, &cp, value, num_bits, &children, state, gc)
    }
}

/// Build whatever node shape fits a bag of KVs.
pub fn make_node(
    area: &MemoryAllocator,
    mut kvs: Vec<KV>,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    kvs.sort_by(|a, b| a.key.cmp(&b.key));
    match kvs.len() {
        0 => return Ok(TriePtr::NULL),
        1 => {
            let kv = kvs.pop().unwrap();
            return match kv.val {
                KvSlot::Value(v) => make_leaf(area, &kv.key, v, state, gc),
                KvSlot::Child(ptr) => prefix_keys(area, ptr, &kv.key, state, gc),
            };
        }
        _ => {}
    }
    if kvs.iter().any(KV::is_child) {
        make_branching(area, &kvs, state, gc)
    } else {
        let entries: Vec<(KeyFragment, u64)> = kvs
            .into_iter()
            .map(|kv| match kv.val {
                KvSlot::Value(v) => (kv.key, v),
                KvSlot::Child(_) => unreachable!(),
            })
            .collect();
        make_multi_leaf(area, &entries, state, gc)
    }
}

/*****************************************************************************/
/* MUTATION DRIVERS                                                         */
/*****************************************************************************/

/// Insert `(key, value)` into the subtree, returning its replacement root.
/// The key must not already be present.
pub fn insert_leaf(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    match ptr.node_type() {
        NodeType::Null => make_leaf(area, key, value, state, gc),
        NodeType::BinaryBranch => binary::insert_leaf(area, ptr, key, value, state, gc),
        NodeType::DenseBranch => dense::insert_leaf(area, ptr, key, value, state, gc),
        _ => {
            // Terminals burst: gather, add, rebuild.
            let LocalNode::Terminal { mut entries } = local(area, ptr)? else {
                unreachable!()
            };
            let pos = entries.partition_point(|(k, _)| k < key);
            debug_assert!(pos >= entries.len() || entries[pos].0 != *key, "duplicate insert");
            entries.insert(pos, (key.clone(), value));
            let replacement = make_multi_leaf(area, &entries, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
    }
}

/// Remove `key` from the subtree, returning its replacement root (possibly
/// null). The key must be present.
pub fn remove_leaf(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    match ptr.node_type() {
        NodeType::Null => Err(Error::Logical("remove from an empty subtree")),
        NodeType::BinaryBranch => binary::remove_leaf(area, ptr, key, state, gc),
        NodeType::DenseBranch => dense::remove_leaf(area, ptr, key, state, gc),
        _ => {
            let LocalNode::Terminal { mut entries } = local(area, ptr)? else {
                unreachable!()
            };
            let pos = entries
                .binary_search_by(|(k, _)| k.cmp(key))
                .map_err(|_| Error::Logical("remove of an absent key"))?;
            entries.remove(pos);
            let replacement = make_multi_leaf(area, &entries, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
    }
}

/// Replace the value at `key`, returning the replacement root. The key
/// must be present.
pub fn replace_value(
    area: &MemoryAllocator,
    ptr: TriePtr,
    key: &KeyFragment,
    value: u64,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    match ptr.node_type() {
        NodeType::Null => Err(Error::Logical("replace in an empty subtree")),
        NodeType::BinaryBranch => binary::replace_value(area, ptr, key, value, state, gc),
        NodeType::DenseBranch => dense::replace_value(area, ptr, key, value, state, gc),
        _ => {
            let LocalNode::Terminal { mut entries } = local(area, ptr)? else {
                unreachable!()
            };
            let pos = entries
                .binary_search_by(|(k, _)| k.cmp(key))
                .map_err(|_| Error::Logical("replace of an absent key"))?;
            entries[pos].1 = value;
            let replacement = make_multi_leaf(area, &entries, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
    }
}

/// Prepend `prefix` to every key in the subtree.
pub fn prefix_keys(
    area: &MemoryAllocator,
    ptr: TriePtr,
    prefix: &KeyFragment,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    if prefix.is_empty() {
        return change_state(area, ptr, state, gc);
    }
    match ptr.node_type() {
        NodeType::Null => Ok(TriePtr::NULL),
        NodeType::BinaryBranch => binary::prefix_keys(area, ptr, prefix, state, gc),
        NodeType::DenseBranch => dense::prefix_keys(area, ptr, prefix, state, gc),
        _ => {
            let LocalNode::Terminal { entries } = local(area, ptr)? else {
                unreachable!()
            };
            let prefixed: Vec<(KeyFragment, u64)> = entries
                .into_iter()
                .map(|(k, v)| (prefix.concat(&k), v))
                .collect();
            let replacement = make_multi_leaf(area, &prefixed, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
    }
}

/// Recursively retag the subtree with `state`, copying storage as needed.
/// After this returns, every reachable node carries `state`.
pub fn change_state(
    area: &MemoryAllocator,
    ptr: TriePtr,
    state: State,
    gc: &mut GcList,
) -> Result<TriePtr> {
    if ptr.is_null() {
        return Ok(TriePtr::NULL);
    }
    if ptr.node_type() == NodeType::InlineTerm {
        return Ok(ptr.with_state(state));
    }
    if ptr.state() == state {
        // Check the invariant holds below: an in-place parent may still
        // have copy-on-write children that need converting.
        match local(area, ptr)? {
            LocalNode::Terminal { .. } => return Ok(ptr),
            LocalNode::Branch { branches, .. } => {
                if branches.iter().all(|(_, c, _)| c.is_null() || c.state() == state) {
                    return Ok(ptr);
                }
            }
        }
    }
    match local(area, ptr)? {
        LocalNode::Terminal { entries } => {
            let replacement = make_multi_leaf(area, &entries, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
        LocalNode::Branch {
            prefix,
            value,
            branches,
        } => {
            let mut kvs: Vec<KV> = Vec::with_capacity(branches.len() + 1);
            if let Some(v) = value {
                kvs.push(KV::value(prefix.clone(), v));
            }
            for (bkey, child, _) in branches {
                let converted = change_state(area, child, state, gc)?;
                kvs.push(KV::child(prefix.concat(&bkey), converted));
            }
            let replacement = make_node(area, kvs, state, gc)?;
            retire(area, ptr, gc)?;
            Ok(replacement)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TrieKey;
    use crate::MmapFile;

    fn build(area: &MemoryAllocator, entries: &[(KeyFragment, u64)]) -> TriePtr {
        area.region()
            .pinned(|| {
                let mut gc = GcList::new();
                let mut root = TriePtr::NULL;
                for (k, v) in entries {
                    root = insert_leaf(area, root, k, *v, State::CopyOnWrite, &mut gc)?;
                }
                Ok(root)
            })
            .unwrap()
    }

    fn lb(area: &MemoryAllocator, root: TriePtr, key: &KeyFragment) -> u64 {
        area.region()
            .pinned(|| lower_bound_rank(area, root, key))
            .unwrap()
    }

    fn ub(area: &MemoryAllocator, root: TriePtr, key: &KeyFragment) -> u64 {
        area.region()
            .pinned(|| upper_bound_rank(area, root, key))
            .unwrap()
    }

    fn u64_key(k: u64) -> KeyFragment {
        TrieKey::from(k).to_fragment()
    }

    #[test]
    fn terminal_bounds_partition() {
        let db = MmapFile::anonymous(0).unwrap();
        let area = db.area();
        let entries: Vec<(KeyFragment, u64)> =
            [10u64, 20, 30].iter().map(|k| (KeyFragment::new(*k, 8), *k)).collect();
        let root = build(area, &entries);

        assert_eq!(lb(area, root, &KeyFragment::new(5, 8)), 0);
        assert_eq!(lb(area, root, &KeyFragment::new(10, 8)), 0);
        assert_eq!(ub(area, root, &KeyFragment::new(10, 8)), 1);
        assert_eq!(lb(area, root, &KeyFragment::new(15, 8)), 1);
        assert_eq!(lb(area, root, &KeyFragment::new(30, 8)), 2);
        assert_eq!(ub(area, root, &KeyFragment::new(30, 8)), 3);
        assert_eq!(lb(area, root, &KeyFragment::new(35, 8)), 3);
    }

    /// A branch whose prefix carries set bits: keys 768..868 share the 56
    /// leading bits `0...011`. Queries diverging inside that prefix land
    /// wholly before or wholly after the subtree.
    #[test]
    fn branch_bounds_diverging_inside_the_prefix() {
        let db = MmapFile::anonymous(0).unwrap();
        let area = db.area();
        let entries: Vec<(KeyFragment, u64)> =
            (768u64..868).map(|k| (u64_key(k), k)).collect();
        let root = build(area, &entries);
        let total = area.region().pinned(|| size(area, root)).unwrap();
        assert_eq!(total, 100);

        // 256 has a clear bit where the prefix has a set one: the key
        // sorts before every entry.
        assert_eq!(lb(area, root, &u64_key(256)), 0);
        assert_eq!(ub(area, root, &u64_key(256)), 0);

        // 2048 has a set bit where the prefix has a clear one: the key
        // sorts after every entry.
        assert_eq!(lb(area, root, &u64_key(2048)), 100);
        assert_eq!(ub(area, root, &u64_key(2048)), 100);

        // Keys extending the prefix recurse into the branches.
        assert_eq!(lb(area, root, &u64_key(768)), 0);
        assert_eq!(ub(area, root, &u64_key(768)), 1);
        assert_eq!(lb(area, root, &u64_key(800)), 32);
        assert_eq!(ub(area, root, &u64_key(800)), 33);
        assert_eq!(lb(area, root, &u64_key(867)), 99);
        assert_eq!(ub(area, root, &u64_key(867)), 100);
        assert_eq!(lb(area, root, &u64_key(868)), 100);
    }

    /// The regression shape: small u64 keys give the root a long all-zero
    /// prefix, and a much larger query diverges inside it on the high
    /// side, so its bound is past-the-end rather than entry zero.
    #[test]
    fn bounds_past_the_end_of_zero_prefixed_keys() {
        let db = MmapFile::anonymous(0).unwrap();
        let area = db.area();
        let entries: Vec<(KeyFragment, u64)> =
            (0u64..100).map(|i| (u64_key(i * 10), i * 10)).collect();
        let root = build(area, &entries);

        assert_eq!(lb(area, root, &u64_key(10_000)), 100);
        assert_eq!(ub(area, root, &u64_key(10_000)), 100);
        assert_eq!(lb(area, root, &u64_key(0)), 0);
        assert_eq!(ub(area, root, &u64_key(0)), 1);
        assert_eq!(lb(area, root, &u64_key(255)), 26);
        assert_eq!(lb(area, root, &u64_key(250)), 25);
        assert_eq!(ub(area, root, &u64_key(250)), 26);
    }

    /// Keys that end exactly at (or inside) a branch prefix: the node's
    /// own value matches exactly, a proper prefix precedes everything.
    /// Five mixed-length keys sharing "a" burst past the terminal shapes
    /// into a branch holding its value at the prefix.
    #[test]
    fn branch_bounds_at_the_prefix_itself() {
        let db = MmapFile::anonymous(0).unwrap();
        let area = db.area();
        let entries = vec![
            (KeyFragment::from_bytes(b"a"), 1),
            (KeyFragment::from_bytes(b"aa"), 2),
            (KeyFragment::from_bytes(b"ab"), 3),
            (KeyFragment::from_bytes(b"ac"), 4),
            (KeyFragment::from_bytes(b"ad"), 5),
        ];
        let root = build(area, &entries);
        let shape = area.region().pinned(|| local(area, root)).unwrap();
        assert!(
            matches!(shape, LocalNode::Branch { .. }),
            "five mixed-length keys must build a branching root"
        );

        let a = KeyFragment::from_bytes(b"a");
        assert_eq!(lb(area, root, &a), 0, "exact match on the node value");
        assert_eq!(ub(area, root, &a), 1);

        // A proper prefix of the node prefix precedes every entry.
        let half = a.prefix(4);
        assert_eq!(lb(area, root, &half), 0);
        assert_eq!(ub(area, root, &half), 0);

        assert_eq!(lb(area, root, &KeyFragment::from_bytes(b"aa")), 1);
        assert_eq!(ub(area, root, &KeyFragment::from_bytes(b"aa")), 2);
        assert_eq!(lb(area, root, &KeyFragment::from_bytes(b"ac")), 3);
        assert_eq!(ub(area, root, &KeyFragment::from_bytes(b"ad")), 5);
        assert_eq!(lb(area, root, &KeyFragment::from_bytes(b"ae")), 5);
        // Diverges from the prefix on the high side: past the end.
        assert_eq!(lb(area, root, &KeyFragment::from_bytes(b"b")), 5);
        // And on the low side: before everything.
        assert_eq!(lb(area, root, &KeyFragment::from_bytes(b"A")), 0);
        assert_eq!(ub(area, root, &KeyFragment::from_bytes(b"A")), 0);
    }
}
