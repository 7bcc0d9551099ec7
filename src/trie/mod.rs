//! The concurrent trie: versioned handles, iteration and transactions.
//!
//! A [`Trie`] is a tiny handle: an id and the fixed offset of its root
//! word. All access goes through a *version*: taking one pins the trie's
//! epoch (so nothing it can reach is reclaimed) and snapshots the root.
//! Readers work on that immutable snapshot; writers build replacement
//! subtrees copy-on-write and publish them with a single CAS on the root
//! word, retrying from scratch when they lose the race.
//! [`TransactionalTrieVersion`] instead mutates a private in-place mirror
//! and reconciles with the live root at commit, through a three-way merge
//! when the root moved underneath it.

pub mod binary;
pub mod compressed;
pub mod dense;
pub mod gc_list;
pub mod inline;
pub mod large_key;
pub mod merge;
pub mod node;
pub mod path;
pub mod ptr;
pub mod sparse;
pub mod terminal;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::gc::GcLock;
use crate::key::{KeyFragment, TrieKey};
use crate::trie::gc_list::GcList;
use crate::trie::merge::{MergeInsertConflict, MergeRemoveConflict};
use crate::trie::ptr::{State, TriePtr};

/// Values whose keys were logically replaced or removed by a transaction;
/// the caller may need to release resources they named.
pub type ValueDeallocList = Vec<(TrieKey, u64)>;

/*****************************************************************************/
/* TRIE                                                                      */
/*****************************************************************************/

/// Handle to one trie in a region: its id and the offset of its root word.
#[derive(Clone, Copy, Debug)]
pub struct Trie {
    id: u32,
    root_offset: u64,
}

impl Trie {
    pub(crate) fn new(id: u32, root_offset: u64) -> Trie {
        Trie { id, root_offset }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Swing the root to null WITHOUT reclaiming the old structure. Used
    /// by repair, where the old tree's extent can't be trusted.
    pub(crate) fn abandon(&self, area: &MemoryAllocator) -> Result<()> {
        area.region().pinned(|| {
            area.region()
                .atomic_u64(self.root_offset)?
                .store(0, Ordering::Release);
            Ok(())
        })
    }

    fn snapshot_root(&self, area: &MemoryAllocator) -> Result<TriePtr> {
        area.region().pinned(|| {
            Ok(TriePtr::from_bits(
                area.region().atomic_u64(self.root_offset)?.load(Ordering::Acquire),
            ))
        })
    }

    /// A read-only view of the current state.
    pub fn current<'a>(&self, area: &'a MemoryAllocator) -> Result<ConstTrieVersion<'a>> {
        let gc = area.region().gc_lock(self.id)?;
        gc.lock_shared();
        let root = match self.snapshot_root(area) {
            Ok(r) => r,
            Err(e) => {
                gc.unlock_shared();
                return Err(e);
            }
        };
        Ok(ConstTrieVersion {
            area,
            root_offset: self.root_offset,
            root,
            gc,
        })
    }

    /// A writable view; mutations publish through root CAS.
    pub fn mutate<'a>(&self, area: &'a MemoryAllocator) -> Result<MutableTrieVersion<'a>> {
        Ok(MutableTrieVersion {
            base: self.current(area)?,
        })
    }

    /// A transactional view: snapshot now, mutate privately in place,
    /// reconcile at commit.
    pub fn transaction<'a>(&self, area: &'a MemoryAllocator) -> Result<TransactionalTrieVersion<'a>> {
        let base = self.current(area)?;
        let original_root = base.root;
        Ok(TransactionalTrieVersion {
            base,
            original_root,
            gc: GcList::new(),
            deallocs: Vec::new(),
            committed: false,
        })
    }
}

/*****************************************************************************/
/* CONST VERSION                                                             */
/*****************************************************************************/

pub struct ConstTrieVersion<'a> {
    area: &'a MemoryAllocator,
    root_offset: u64,
    root: TriePtr,
    gc: Arc<GcLock>,
}

impl Drop for ConstTrieVersion<'_> {
    fn drop(&mut self) {
        self.gc.unlock_shared();
    }
}

impl Clone for ConstTrieVersion<'_> {
    fn clone(&self) -> Self {
        self.gc.lock_shared();
        ConstTrieVersion {
            area: self.area,
            root_offset: self.root_offset,
            root: self.root,
            gc: self.gc.clone(),
        }
    }
}

impl<'a> ConstTrieVersion<'a> {
    pub fn area(&self) -> &'a MemoryAllocator {
        self.area
    }

    pub fn root(&self) -> TriePtr {
        self.root
    }

    pub fn size(&self) -> Result<u64> {
        self.area.region().pinned(|| node::size(self.area, self.root))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    pub fn get<K: Into<TrieKey> + Clone>(&self, key: &K) -> Result<Option<u64>> {
        let kf = key.clone().into().to_fragment();
        self.area
            .region()
            .pinned(|| Ok(node::find_rank(self.area, self.root, &kf)?.map(|(_, v)| v)))
    }

    pub fn contains<K: Into<TrieKey> + Clone>(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterator at the entry for `key`, or `None` when absent.
    pub fn find(&self, key: &TrieKey) -> Result<Option<TrieIterator<'_, 'a>>> {
        let kf = key.to_fragment();
        let (size, hit) = self.area.region().pinned(|| {
            Ok((
                node::size(self.area, self.root)?,
                node::find_rank(self.area, self.root, &kf)?,
            ))
        })?;
        Ok(hit.map(|(rank, _)| TrieIterator {
            version: self,
            root: self.root,
            entry_num: rank,
            size,
        }))
    }

    pub fn begin(&self) -> Result<TrieIterator<'_, 'a>> {
        let size = self.size()?;
        Ok(TrieIterator {
            version: self,
            root: self.root,
            entry_num: 0,
            size,
        })
    }

    pub fn end(&self) -> Result<TrieIterator<'_, 'a>> {
        let size = self.size()?;
        Ok(TrieIterator {
            version: self,
            root: self.root,
            entry_num: size,
            size,
        })
    }

    /// First entry at or after `key`.
    pub fn lower_bound(&self, key: &TrieKey) -> Result<TrieIterator<'_, 'a>> {
        let kf = key.to_fragment();
        let (size, rank) = self.area.region().pinned(|| {
            Ok((
                node::size(self.area, self.root)?,
                node::lower_bound_rank(self.area, self.root, &kf)?,
            ))
        })?;
        Ok(TrieIterator {
            version: self,
            root: self.root,
            entry_num: rank,
            size,
        })
    }

    /// First entry strictly after `key`.
    pub fn upper_bound(&self, key: &TrieKey) -> Result<TrieIterator<'_, 'a>> {
        let kf = key.to_fragment();
        let (size, rank) = self.area.region().pinned(|| {
            Ok((
                node::size(self.area, self.root)?,
                node::upper_bound_rank(self.area, self.root, &kf)?,
            ))
        })?;
        Ok(TrieIterator {
            version: self,
            root: self.root,
            entry_num: rank,
            size,
        })
    }

    pub fn bounds(&self, key: &TrieKey) -> Result<(TrieIterator<'_, 'a>, TrieIterator<'_, 'a>)> {
        Ok((self.lower_bound(key)?, self.upper_bound(key)?))
    }

    /// All entries in key order.
    pub fn to_vec(&self) -> Result<Vec<(TrieKey, u64)>> {
        let mut out = Vec::new();
        self.area.region().pinned(|| {
            out.clear();
            let mut kvs = Vec::new();
            node::gather_values(self.area, self.root, &KeyFragment::empty(), &mut kvs)?;
            out.extend(
                kvs.into_iter()
                    .map(|(k, v)| (TrieKey::from_fragment(&k), v)),
            );
            Ok(())
        })?;
        Ok(out)
    }

    pub fn stats(&self) -> Result<node::TrieStats> {
        self.area.region().pinned(|| {
            let mut acc = node::TrieStats::default();
            node::stats(self.area, self.root, 0, 0, &mut acc)?;
            Ok(acc)
        })
    }

    /// Bytes of node storage reachable from this version's root.
    pub fn mem_usage(&self) -> Result<u64> {
        Ok(self.stats()?.total_bytes)
    }

    pub fn dump(&self, max_depth: usize) -> Result<String> {
        self.area.region().pinned(|| {
            let mut out = String::new();
            node::dump(self.area, self.root, 0, max_depth, &mut out)?;
            Ok(out)
        })
    }
}

/*****************************************************************************/
/* ITERATOR                                                                  */
/*****************************************************************************/

/// Random-access bidirectional cursor, addressed by entry rank within one
/// immutable trie version.
#[derive(Clone, Copy)]
pub struct TrieIterator<'v, 'a> {
    version: &'v ConstTrieVersion<'a>,
    root: TriePtr,
    entry_num: u64,
    size: u64,
}

impl<'v, 'a> TrieIterator<'v, 'a> {
    pub fn valid(&self) -> bool {
        self.entry_num < self.size
    }

    pub fn entry_num(&self) -> u64 {
        self.entry_num
    }

    pub fn key(&self) -> Result<TrieKey> {
        let area = self.version.area;
        area.region().pinned(|| {
            let (k, _) = node::entry_at(area, self.root, self.entry_num)?;
            Ok(TrieKey::from_fragment(&k))
        })
    }

    pub fn value(&self) -> Result<u64> {
        let area = self.version.area;
        area.region()
            .pinned(|| Ok(node::entry_at(area, self.root, self.entry_num)?.1))
    }

    /// Move by `n` entries, clamped to `[0, size]`.
    pub fn advance(&mut self, n: i64) {
        let pos = self.entry_num as i64 + n;
        self.entry_num = pos.clamp(0, self.size as i64) as u64;
    }

    pub fn next(&mut self) {
        self.advance(1);
    }

    pub fn prev(&mut self) {
        self.advance(-1);
    }

    pub fn distance_to(&self, other: &TrieIterator<'_, '_>) -> i64 {
        other.entry_num as i64 - self.entry_num as i64
    }
}

impl PartialEq for TrieIterator<'_, '_> {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.entry_num == other.entry_num
    }
}

impl Eq for TrieIterator<'_, '_> {}

/*****************************************************************************/
/* MUTABLE VERSION                                                           */
/*****************************************************************************/

pub struct MutableTrieVersion<'a> {
    base: ConstTrieVersion<'a>,
}

impl<'a> std::ops::Deref for MutableTrieVersion<'a> {
    type Target = ConstTrieVersion<'a>;

    fn deref(&self) -> &ConstTrieVersion<'a> {
        &self.base
    }
}

enum CasOutcome {
    Done { root: TriePtr, gc: GcList },
    Exists { value: u64 },
    Absent,
    Mismatch { value: u64 },
    Retry { gc: GcList },
}

impl<'a> MutableTrieVersion<'a> {
    fn area(&self) -> &'a MemoryAllocator {
        self.base.area
    }

    fn root_atomic_bits(&self) -> Result<u64> {
        Ok(self
            .area()
            .region()
            .atomic_u64(self.base.root_offset)?
            .load(Ordering::Acquire))
    }

    fn publish(&self, old: TriePtr, new: TriePtr) -> Result<bool> {
        Ok(self
            .area()
            .region()
            .atomic_u64(self.base.root_offset)?
            .compare_exchange(old.bits(), new.bits(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Insert `(key, value)`. Returns `(value_now_present, true)` on a
    /// fresh insert or `(existing_value, false)` when the key was taken.
    pub fn insert<K: Into<TrieKey>>(&self, key: K, value: u64) -> Result<(u64, bool)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let area = self.area();
        loop {
            let outcome = area.region().pinned(|| {
                let cur = TriePtr::from_bits(self.root_atomic_bits()?);
                if let Some((_, v)) = node::find_rank(area, cur, &kf)? {
                    return Ok(CasOutcome::Exists { value: v });
                }
                let mut gc = GcList::new();
                let new_root =
                    match node::insert_leaf(area, cur, &kf, value, State::CopyOnWrite, &mut gc) {
                        Ok(r) => r,
                        Err(e) => {
                            gc.rollback(area);
                            return Err(e);
                        }
                    };
                if self.publish(cur, new_root)? {
                    Ok(CasOutcome::Done { root: new_root, gc })
                } else {
                    Ok(CasOutcome::Retry { gc })
                }
            })?;
            match outcome {
                CasOutcome::Done { gc, .. } => {
                    gc.commit(area, &self.base.gc);
                    return Ok((value, true));
                }
                CasOutcome::Exists { value } => return Ok((value, false)),
                CasOutcome::Retry { gc } => gc.rollback(area),
                _ => unreachable!(),
            }
        }
    }

    /// Remove `key`. Returns `(true, old_value)` when it was present.
    pub fn remove<K: Into<TrieKey>>(&self, key: K) -> Result<(bool, u64)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let area = self.area();
        let mut removed = 0u64;
        loop {
            let outcome = area.region().pinned(|| {
                let cur = TriePtr::from_bits(self.root_atomic_bits()?);
                let Some((_, old)) = node::find_rank(area, cur, &kf)? else {
                    return Ok(CasOutcome::Absent);
                };
                let mut gc = GcList::new();
                let new_root =
                    match node::remove_leaf(area, cur, &kf, State::CopyOnWrite, &mut gc) {
                        Ok(r) => r,
                        Err(e) => {
                            gc.rollback(area);
                            return Err(e);
                        }
                    };
                if self.publish(cur, new_root)? {
                    removed = old;
                    Ok(CasOutcome::Done { root: new_root, gc })
                } else {
                    Ok(CasOutcome::Retry { gc })
                }
            })?;
            match outcome {
                CasOutcome::Done { gc, .. } => {
                    gc.commit(area, &self.base.gc);
                    return Ok((true, removed));
                }
                CasOutcome::Absent => return Ok((false, u64::MAX)),
                CasOutcome::Retry { gc } => gc.rollback(area),
                _ => unreachable!(),
            }
        }
    }

    /// Replace the value at `key` only when it currently equals `old`.
    /// Returns `(false, _)` when the key is absent, otherwise
    /// `(true, value_before)`; the swap happened iff `value_before == old`.
    pub fn compare_and_swap<K: Into<TrieKey>>(
        &self,
        key: K,
        old: u64,
        new: u64,
    ) -> Result<(bool, u64)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let area = self.area();
        loop {
            let outcome = area.region().pinned(|| {
                let cur = TriePtr::from_bits(self.root_atomic_bits()?);
                let Some((_, v)) = node::find_rank(area, cur, &kf)? else {
                    return Ok(CasOutcome::Absent);
                };
                if v != old {
                    return Ok(CasOutcome::Mismatch { value: v });
                }
                let mut gc = GcList::new();
                let new_root =
                    match node::replace_value(area, cur, &kf, new, State::CopyOnWrite, &mut gc) {
                        Ok(r) => r,
                        Err(e) => {
                            gc.rollback(area);
                            return Err(e);
                        }
                    };
                if self.publish(cur, new_root)? {
                    Ok(CasOutcome::Done { root: new_root, gc })
                } else {
                    Ok(CasOutcome::Retry { gc })
                }
            })?;
            match outcome {
                CasOutcome::Done { gc, .. } => {
                    gc.commit(area, &self.base.gc);
                    return Ok((true, old));
                }
                CasOutcome::Absent => return Ok((false, u64::MAX)),
                CasOutcome::Mismatch { value } => return Ok((true, value)),
                CasOutcome::Retry { gc } => gc.rollback(area),
                _ => unreachable!(),
            }
        }
    }

    /// Remove `key` only when its value equals `old`. Returns `(false, _)`
    /// when absent, otherwise `(true, value_before)`; the removal happened
    /// iff `value_before == old`.
    pub fn compare_and_remove<K: Into<TrieKey>>(&self, key: K, old: u64) -> Result<(bool, u64)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let area = self.area();
        loop {
            let outcome = area.region().pinned(|| {
                let cur = TriePtr::from_bits(self.root_atomic_bits()?);
                let Some((_, v)) = node::find_rank(area, cur, &kf)? else {
                    return Ok(CasOutcome::Absent);
                };
                if v != old {
                    return Ok(CasOutcome::Mismatch { value: v });
                }
                let mut gc = GcList::new();
                let new_root =
                    match node::remove_leaf(area, cur, &kf, State::CopyOnWrite, &mut gc) {
                        Ok(r) => r,
                        Err(e) => {
                            gc.rollback(area);
                            return Err(e);
                        }
                    };
                if self.publish(cur, new_root)? {
                    Ok(CasOutcome::Done { root: new_root, gc })
                } else {
                    Ok(CasOutcome::Retry { gc })
                }
            })?;
            match outcome {
                CasOutcome::Done { gc, .. } => {
                    gc.commit(area, &self.base.gc);
                    return Ok((true, old));
                }
                CasOutcome::Absent => return Ok((false, u64::MAX)),
                CasOutcome::Mismatch { value } => return Ok((true, value)),
                CasOutcome::Retry { gc } => gc.rollback(area),
                _ => unreachable!(),
            }
        }
    }

    /// Remove everything. The old tree is reclaimed once readers drain.
    pub fn clear(&self) -> Result<()> {
        let area = self.area();
        loop {
            let published = area.region().pinned(|| {
                let cur = TriePtr::from_bits(self.root_atomic_bits()?);
                if cur.is_null() {
                    return Ok(Some(TriePtr::NULL));
                }
                Ok(self.publish(cur, TriePtr::NULL)?.then_some(cur))
            })?;
            match published {
                Some(old) if old.is_null() => return Ok(()),
                Some(old) => {
                    let arc = area.arc();
                    self.base.gc.defer(Box::new(move || {
                        let _ = arc.region().pinned(|| node::deallocate_subtree(&arc, old));
                    }));
                    return Ok(());
                }
                None => continue,
            }
        }
    }
}

/*****************************************************************************/
/* TRANSACTIONAL VERSION                                                     */
/*****************************************************************************/

/// A private, single-writer mirror of the trie.
///
/// The snapshot taken at construction disables reclamation of anything the
/// original root can reach (the shared epoch stays held for the whole
/// transaction). Mutations convert the touched path to in-place nodes and
/// then write through them; untouched subtrees stay shared copy-on-write
/// with the original. `commit` reconciles with the live root.
pub struct TransactionalTrieVersion<'a> {
    base: ConstTrieVersion<'a>,
    original_root: TriePtr,
    gc: GcList,
    deallocs: ValueDeallocList,
    committed: bool,
}

impl<'a> std::ops::Deref for TransactionalTrieVersion<'a> {
    type Target = ConstTrieVersion<'a>;

    fn deref(&self) -> &ConstTrieVersion<'a> {
        &self.base
    }
}

impl Drop for TransactionalTrieVersion<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.rollback_inner(false);
        }
    }
}

impl<'a> TransactionalTrieVersion<'a> {
    fn area(&self) -> &'a MemoryAllocator {
        self.base.area
    }

    /// Run one mutation with its own GC record, merging it into the
    /// transaction's record only on success.
    fn mutate_with<R>(
        &mut self,
        f: impl Fn(&MemoryAllocator, TriePtr, &mut GcList) -> Result<(TriePtr, R)>,
    ) -> Result<R> {
        let area = self.area();
        let mut staged: Option<(TriePtr, GcList, R)> = None;
        area.region().pinned(|| {
            let mut gc = GcList::new();
            match f(area, self.base.root, &mut gc) {
                Ok((root, r)) => {
                    staged = Some((root, std::mem::take(&mut gc), r));
                    Ok(())
                }
                Err(e) => {
                    gc.rollback(area);
                    Err(e)
                }
            }
        })?;
        let (root, gc, r) = staged.expect("pinned returned without staging");
        self.base.root = root;
        self.gc.merge(gc);
        Ok(r)
    }

    /// Insert `(key, value)`; false when the key already exists.
    pub fn insert<K: Into<TrieKey>>(&mut self, key: K, value: u64) -> Result<bool> {
        let kf: KeyFragment = key.into().to_fragment();
        self.mutate_with(|area, root, gc| {
            if node::find_rank(area, root, &kf)?.is_some() {
                return Ok((root, false));
            }
            let new_root = node::insert_leaf(area, root, &kf, value, State::InPlace, gc)?;
            Ok((new_root, true))
        })
    }

    /// Replace the value at `key`. Returns `(true, old_value)` when found.
    pub fn replace<K: Into<TrieKey>>(&mut self, key: K, value: u64) -> Result<(bool, u64)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let out = self.mutate_with(|area, root, gc| {
            let Some((_, old)) = node::find_rank(area, root, &kf)? else {
                return Ok((root, None));
            };
            let new_root = node::replace_value(area, root, &kf, value, State::InPlace, gc)?;
            Ok((new_root, Some(old)))
        })?;
        match out {
            Some(old) => {
                self.deallocs.push((key, old));
                Ok((true, old))
            }
            None => Ok((false, u64::MAX)),
        }
    }

    /// Remove `key`. Returns `(true, old_value)` when found.
    pub fn remove<K: Into<TrieKey>>(&mut self, key: K) -> Result<(bool, u64)> {
        let key: TrieKey = key.into();
        let kf = key.to_fragment();
        let out = self.mutate_with(|area, root, gc| {
            let Some((_, old)) = node::find_rank(area, root, &kf)? else {
                return Ok((root, None));
            };
            let new_root = node::remove_leaf(area, root, &kf, State::InPlace, gc)?;
            Ok((new_root, Some(old)))
        })?;
        match out {
            Some(old) => {
                self.deallocs.push((key, old));
                Ok((true, old))
            }
            None => Ok((false, u64::MAX)),
        }
    }

    /// Remove every entry of the transaction's view.
    pub fn clear(&mut self) -> Result<()> {
        self.mutate_with(|area, root, gc| {
            node::retire_subtree(area, root, gc)?;
            Ok((TriePtr::NULL, ()))
        })
    }

    /// Commit with the default conflict policy: our writes win.
    pub fn commit(mut self) -> Result<ValueDeallocList> {
        self.commit_impl(&|_, _, _, ours| ours, &|_, _, _| true)
    }

    /// Commit, resolving conflicts with the live root through the given
    /// callbacks.
    pub fn commit_with(
        mut self,
        on_insert: &MergeInsertConflict,
        on_remove: &MergeRemoveConflict,
    ) -> Result<ValueDeallocList> {
        self.commit_impl(on_insert, on_remove)
    }

    /// Try to commit without merging. Returns `(false, empty)` when the
    /// live root moved since the transaction began, in which case the
    /// transaction (which this call consumes) is rolled back.
    pub fn try_commit(mut self) -> Result<(bool, ValueDeallocList)> {
        let area = self.area();
        let published = area.region().pinned(|| {
            let atomic = area.region().atomic_u64(self.base.root_offset)?;
            Ok(atomic
                .compare_exchange(
                    self.original_root.bits(),
                    self.base.root.bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok())
        })?;
        if !published {
            return Ok((false, Vec::new()));
        }
        let gc = std::mem::take(&mut self.gc);
        gc.commit(area, &self.base.gc);
        self.committed = true;
        Ok((true, std::mem::take(&mut self.deallocs)))
    }

    fn commit_impl(
        &mut self,
        on_insert: &MergeInsertConflict,
        on_remove: &MergeRemoveConflict,
    ) -> Result<ValueDeallocList> {
        let area = self.area();
        loop {
            // Fast path: nobody moved the root.
            let fast = area.region().pinned(|| {
                let atomic = area.region().atomic_u64(self.base.root_offset)?;
                let cur = TriePtr::from_bits(atomic.load(Ordering::Acquire));
                if cur != self.original_root {
                    return Ok(None);
                }
                Ok(atomic
                    .compare_exchange(
                        cur.bits(),
                        self.base.root.bits(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                    .then_some(()))
            })?;
            if fast.is_some() {
                let gc = std::mem::take(&mut self.gc);
                gc.commit(area, &self.base.gc);
                self.committed = true;
                return Ok(std::mem::take(&mut self.deallocs));
            }

            // Slow path: three-way merge onto the live root. The merge's
            // GC record lives and dies inside one attempt, so a failed or
            // retried attempt never leaks its scaffolding.
            let mut staged: Option<(TriePtr, ValueDeallocList, GcList)> = None;
            let merged_ok = area.region().pinned(|| {
                let atomic = area.region().atomic_u64(self.base.root_offset)?;
                let theirs = TriePtr::from_bits(atomic.load(Ordering::Acquire));
                if theirs == self.original_root {
                    return Ok(false); // raced back to the fast path
                }
                let mut merge_gc = GcList::new();
                let (merged, conflict_deallocs) = match merge::three_way(
                    area,
                    self.original_root,
                    theirs,
                    self.base.root,
                    on_insert,
                    on_remove,
                    &mut merge_gc,
                ) {
                    Ok(r) => r,
                    Err(e) => {
                        merge_gc.rollback(area);
                        return Err(e);
                    }
                };
                if atomic
                    .compare_exchange(
                        theirs.bits(),
                        merged.bits(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    staged = Some((merged, conflict_deallocs, std::mem::take(&mut merge_gc)));
                } else {
                    merge_gc.rollback(area);
                }
                Ok(true)
            })?;
            if !merged_ok {
                continue;
            }
            match staged.take() {
                Some((_merged, conflict_deallocs, merge_gc)) => {
                    // Displaced live nodes retire through the epoch lock.
                    merge_gc.commit(area, &self.base.gc);
                    // The private in-place mirror is now garbage; the
                    // originals it displaced stay owned by the live tree.
                    let mut tx_gc = std::mem::take(&mut self.gc);
                    tx_gc.forget_old();
                    tx_gc.rollback(area);
                    self.committed = true;
                    let mut out = std::mem::take(&mut self.deallocs);
                    out.extend(conflict_deallocs);
                    return Ok(out);
                }
                // Lost the publication race; try again from the top.
                None => {}
            }
        }
    }

    /// Discard the transaction. With `gather_inserted`, returns the keys
    /// and values the transaction had inserted (for external cleanup).
    pub fn rollback(mut self, gather_inserted: bool) -> Result<ValueDeallocList> {
        let out = self.rollback_inner(gather_inserted)?;
        self.committed = true; // suppress the Drop-path rollback
        Ok(out)
    }

    fn rollback_inner(&mut self, gather_inserted: bool) -> Result<ValueDeallocList> {
        let area = self.area();
        let mut inserted = Vec::new();
        if gather_inserted {
            area.region().pinned(|| {
                inserted.clear();
                let mut base_kvs = Vec::new();
                let mut ours_kvs = Vec::new();
                node::gather_values(area, self.original_root, &KeyFragment::empty(), &mut base_kvs)?;
                node::gather_values(area, self.base.root, &KeyFragment::empty(), &mut ours_kvs)?;
                for (k, v) in &ours_kvs {
                    if base_kvs.binary_search_by(|(bk, _)| bk.cmp(k)).is_err() {
                        inserted.push((TrieKey::from_fragment(k), *v));
                    }
                }
                Ok(())
            })?;
        }
        let mut gc = std::mem::take(&mut self.gc);
        gc.forget_old();
        gc.rollback(area);
        self.base.root = self.original_root;
        self.deallocs.clear();
        Ok(inserted)
    }
}
