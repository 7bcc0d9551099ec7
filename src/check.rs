//! Structural checking and repair of tries.
//!
//! The checker walks a trie version in key order, validating every node it
//! can decode and bounding what it can't: the result names the last good
//! key before the first fault and the first good key after the last one,
//! so a caller can tell exactly which range of entries is suspect. Repair
//! rebuilds the trie from the entries that survive decoding.

use log::warn;

use crate::alloc::MemoryAllocator;
use crate::error::Result;
use crate::key::{KeyFragment, TrieKey};
use crate::trie::node::{self, LocalNode};
use crate::trie::path::{TriePath, TriePathEntry};
use crate::trie::ptr::TriePtr;
use crate::trie::{ConstTrieVersion, Trie};

/// Bounds of a corrupted range of entries.
#[derive(Debug, Clone, Default)]
pub struct CorruptionArea {
    /// Last key that checked out before the first fault.
    pub left_valid: Option<TrieKey>,
    /// First faulty position, as a root-to-node path description.
    pub left_invalid: Option<String>,
    /// Last faulty position.
    pub right_invalid: Option<String>,
    /// First key that checked out after the last fault.
    pub right_valid: Option<TrieKey>,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    /// Entries that decoded and validated.
    pub valid_entries: u64,
    /// Individual faults, in walk order.
    pub errors: Vec<String>,
    /// Bounds of the faulty range, when any fault was found.
    pub corruption: Option<CorruptionArea>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Checker<'c, 'a> {
    version: &'c ConstTrieVersion<'a>,
    report: CheckReport,
    last_key: Option<KeyFragment>,
    survivors: Vec<(KeyFragment, u64)>,
}

impl<'c, 'a> Checker<'c, 'a> {
    fn area(&self) -> &'a MemoryAllocator {
        self.version.area()
    }

    fn fault(&mut self, path: &TriePath, detail: String) {
        let position = format!("depth {} after {:?}: {detail}", path.depth(), path.key());
        let left_valid = self.last_key.as_ref().map(TrieKey::from_fragment);
        let first = position.clone();
        let area = self
            .report
            .corruption
            .get_or_insert_with(|| CorruptionArea {
                left_valid,
                left_invalid: Some(first),
                ..CorruptionArea::default()
            });
        area.right_invalid = Some(position.clone());
        area.right_valid = None;
        self.report.errors.push(position);
    }

    fn good_key(&mut self, key: &KeyFragment, value: u64) {
        if let Some(area) = self.report.corruption.as_mut() {
            if area.right_valid.is_none() {
                area.right_valid = Some(TrieKey::from_fragment(key));
            }
        }
        self.report.valid_entries += 1;
        self.last_key = Some(key.clone());
        self.survivors.push((key.clone(), value));
    }

    fn walk(&mut self, ptr: TriePtr, base: &KeyFragment, path: &mut TriePath) {
        if ptr.is_null() {
            return;
        }
        if path.depth() > 4096 {
            self.fault(path, "trie deeper than any legal structure".into());
            return;
        }

        let shape = match node::local(self.area(), ptr) {
            Ok(s) => s,
            Err(e) => {
                self.fault(path, format!("undecodable node {ptr:?}: {e}"));
                return;
            }
        };

        match shape {
            LocalNode::Terminal { entries } => {
                if entries.is_empty() && path.depth() > 0 {
                    self.fault(path, format!("empty terminal {ptr:?} below the root"));
                    return;
                }
                let mut prev: Option<&KeyFragment> = None;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if prev.is_some_and(|p| p >= k) {
                        self.fault(path, format!("terminal {ptr:?} entries out of order"));
                        return;
                    }
                    prev = Some(k);
                    let full = base.concat(k);
                    path.push(
                        ptr,
                        TriePathEntry::Terminal {
                            bit_num: k.bits(),
                            value: *v,
                            entry_num: i as u64,
                        },
                        k,
                    );
                    path.pop();
                    self.good_key(&full, *v);
                }
            }
            LocalNode::Branch {
                prefix,
                value,
                branches,
            } => {
                let slots = u64::from(value.is_some()) + branches.len() as u64;
                if slots < 2 {
                    self.fault(
                        path,
                        format!("branching node {ptr:?} with {slots} slot(s)"),
                    );
                    // The subtree may still hold values; keep walking.
                }
                let below = base.concat(&prefix);
                if let Some(v) = value {
                    self.good_key(&below, v);
                }
                let mut entry_base = u64::from(value.is_some());
                let mut prev: Option<&KeyFragment> = None;
                for (bkey, child, recorded_size) in &branches {
                    if prev.is_some_and(|p| p >= bkey) {
                        self.fault(path, format!("branches of {ptr:?} out of order"));
                        return;
                    }
                    prev = Some(bkey);

                    match node::size(self.area(), *child) {
                        Ok(actual) if actual == *recorded_size => {}
                        Ok(actual) => {
                            self.fault(
                                path,
                                format!(
                                    "child size mismatch under {ptr:?}: recorded {recorded_size}, actual {actual}"
                                ),
                            );
                        }
                        Err(e) => {
                            self.fault(path, format!("unsized child under {ptr:?}: {e}"));
                            continue;
                        }
                    }

                    let consumed = prefix.concat(bkey);
                    path.push(
                        ptr,
                        TriePathEntry::NonTerminal {
                            bit_num: consumed.bits(),
                            child: *child,
                            entry_num_base: entry_base,
                        },
                        &consumed,
                    );
                    self.walk(*child, &below.concat(bkey), path);
                    path.pop();
                    entry_base += recorded_size;
                }
            }
        }
    }
}

/// Check one trie version. Faults never abort the walk; they bound the
/// corruption area and the walk continues with the next sibling.
pub fn check(version: &ConstTrieVersion<'_>) -> Result<CheckReport> {
    let area = version.area();
    area.region().pinned(|| {
        let mut checker = Checker {
            version,
            report: CheckReport::default(),
            last_key: None,
            survivors: Vec::new(),
        };
        let mut path = TriePath::new();
        checker.walk(version.root(), &KeyFragment::empty(), &mut path);
        Ok(checker.report)
    })
}

/// Rebuild a faulty trie from its surviving entries. Returns how many
/// entries the repaired trie holds. The corrupt structure is abandoned in
/// place rather than freed: its extent can't be trusted.
pub fn repair(trie: &Trie, area: &MemoryAllocator) -> Result<u64> {
    let version = trie.current(area)?;
    let survivors = area.region().pinned(|| {
        let mut checker = Checker {
            version: &version,
            report: CheckReport::default(),
            last_key: None,
            survivors: Vec::new(),
        };
        let mut path = TriePath::new();
        checker.walk(version.root(), &KeyFragment::empty(), &mut path);
        if checker.report.is_clean() {
            return Ok(None);
        }
        Ok(Some(checker.survivors))
    })?;

    let Some(mut survivors) = survivors else {
        return version.size();
    };
    survivors.sort_by(|a, b| a.0.cmp(&b.0));
    survivors.dedup_by(|a, b| a.0 == b.0);
    warn!(
        "repairing trie {}: rebuilding from {} surviving entries",
        trie.id(),
        survivors.len()
    );

    // Abandon the corrupt tree (its extent can't be trusted enough to
    // free), then rebuild entry by entry.
    trie.abandon(area)?;
    let writer = trie.mutate(area)?;
    for (k, v) in &survivors {
        writer.insert(TrieKey::from_fragment(k), *v)?;
    }
    Ok(survivors.len() as u64)
}

/// Report wrapper used by the `mmap_check` tool: check and optionally
/// repair every allocated trie.
pub fn check_region(
    area: &MemoryAllocator,
    min_id: u32,
    max_id: u32,
    recover: bool,
    verbose: bool,
) -> Result<bool> {
    let mut all_clean = true;
    for id in area.trie_alloc.allocated_ids()? {
        if id < min_id || id > max_id {
            continue;
        }
        let trie = area.trie(id)?;
        let version = trie.current(area)?;
        let report = check(&version)?;
        drop(version);
        if verbose || !report.is_clean() {
            println!(
                "trie {id}: {} valid entries, {} fault(s)",
                report.valid_entries,
                report.errors.len()
            );
            for e in &report.errors {
                println!("  {e}");
            }
            if let Some(c) = &report.corruption {
                println!(
                    "  corrupt range: after {:?} .. before {:?}",
                    c.left_valid, c.right_valid
                );
            }
        }
        if !report.is_clean() {
            all_clean = false;
            if recover {
                let kept = repair(&trie, area)?;
                println!("trie {id}: repaired, {kept} entries retained");
            }
        }
    }
    Ok(all_clean)
}
