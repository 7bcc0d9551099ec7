//! Three-way merge of trie states.
//!
//! Given the transaction's base snapshot, the current live root ("theirs")
//! and the transaction's private root ("ours"), compute ours' changes
//! against base and replay them on top of theirs, consulting the caller's
//! conflict callbacks wherever theirs changed the same key. The merged
//! root is built copy-on-write from theirs, so it shares every untouched
//! subtree with the live tree and can be published with one CAS.

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::key::{KeyFragment, TrieKey};
use crate::trie::gc_list::GcList;
use crate::trie::node;
use crate::trie::ptr::{State, TriePtr};
use crate::trie::ValueDeallocList;

/// Resolve an insert/replace conflict: both sides wrote `key`. Receives
/// the base value (when the key existed in the base), theirs and ours;
/// returns the value to keep.
pub type MergeInsertConflict = dyn Fn(&TrieKey, Option<u64>, u64, u64) -> u64;

/// Resolve a remove conflict: we removed `key`, theirs changed it.
/// Receives the base and live values; returns true to keep the removal.
pub type MergeRemoveConflict = dyn Fn(&TrieKey, u64, u64) -> bool;

enum Op {
    Insert(KeyFragment, u64),
    Replace(KeyFragment, u64, u64), // (key, base value, our value)
    Remove(KeyFragment, u64),       // (key, base value)
}

/// Merge and return `(merged_root, values displaced from the live tree)`.
/// Displaced live nodes are recorded in `gc`; the caller retires them
/// after publishing.
pub fn three_way(
    area: &MemoryAllocator,
    base: TriePtr,
    theirs: TriePtr,
    ours: TriePtr,
    on_insert: &MergeInsertConflict,
    on_remove: &MergeRemoveConflict,
    gc: &mut GcList,
) -> Result<(TriePtr, ValueDeallocList)> {
    let mut base_kvs = Vec::new();
    let mut our_kvs = Vec::new();
    node::gather_values(area, base, &KeyFragment::empty(), &mut base_kvs)?;
    node::gather_values(area, ours, &KeyFragment::empty(), &mut our_kvs)?;

    // Sorted merge-walk producing our diff against base.
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < base_kvs.len() || j < our_kvs.len() {
        match (base_kvs.get(i), our_kvs.get(j)) {
            (Some((bk, bv)), Some((ok, ov))) => match bk.cmp(ok) {
                std::cmp::Ordering::Less => {
                    ops.push(Op::Remove(bk.clone(), *bv));
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    ops.push(Op::Insert(ok.clone(), *ov));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    if bv != ov {
                        ops.push(Op::Replace(ok.clone(), *bv, *ov));
                    }
                    i += 1;
                    j += 1;
                }
            },
            (Some((bk, bv)), None) => {
                ops.push(Op::Remove(bk.clone(), *bv));
                i += 1;
            }
            (None, Some((ok, ov))) => {
                ops.push(Op::Insert(ok.clone(), *ov));
                j += 1;
            }
            (None, None) => unreachable!(),
        }
    }

    // Replay onto theirs.
    let mut root = theirs;
    let mut deallocs: ValueDeallocList = Vec::new();
    for op in ops {
        match op {
            Op::Insert(kf, ov) => {
                let key = TrieKey::from_fragment(&kf);
                match node::find_rank(area, root, &kf)? {
                    None => {
                        root = node::insert_leaf(area, root, &kf, ov, State::CopyOnWrite, gc)?;
                    }
                    Some((_, tv)) if tv == ov => {}
                    Some((_, tv)) => {
                        // Both sides inserted the key independently.
                        let keep = on_insert(&key, None, tv, ov);
                        if keep != tv {
                            root = node::replace_value(
                                area,
                                root,
                                &kf,
                                keep,
                                State::CopyOnWrite,
                                gc,
                            )?;
                            deallocs.push((key, tv));
                        }
                    }
                }
            }
            Op::Replace(kf, bv, ov) => {
                let key = TrieKey::from_fragment(&kf);
                match node::find_rank(area, root, &kf)? {
                    None => {
                        // Theirs removed what we replaced; our write wins.
                        root = node::insert_leaf(area, root, &kf, ov, State::CopyOnWrite, gc)?;
                    }
                    Some((_, tv)) if tv == bv => {
                        root =
                            node::replace_value(area, root, &kf, ov, State::CopyOnWrite, gc)?;
                        deallocs.push((key, bv));
                    }
                    Some((_, tv)) if tv == ov => {}
                    Some((_, tv)) => {
                        let keep = on_insert(&key, Some(bv), tv, ov);
                        if keep != tv {
                            root = node::replace_value(
                                area,
                                root,
                                &kf,
                                keep,
                                State::CopyOnWrite,
                                gc,
                            )?;
                            deallocs.push((key, tv));
                        }
                    }
                }
            }
            Op::Remove(kf, bv) => {
                let key = TrieKey::from_fragment(&kf);
                match node::find_rank(area, root, &kf)? {
                    None => {} // both removed it
                    Some((_, tv)) if tv == bv => {
                        root = node::remove_leaf(area, root, &kf, State::CopyOnWrite, gc)?;
                        deallocs.push((key, bv));
                    }
                    Some((_, tv)) => {
                        if on_remove(&key, bv, tv) {
                            root =
                                node::remove_leaf(area, root, &kf, State::CopyOnWrite, gc)?;
                            deallocs.push((key, tv));
                        }
                    }
                }
            }
        }
    }

    Ok((root, deallocs))
}
