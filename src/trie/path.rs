//! Root-to-entry paths.
//!
//! A [`TriePath`] records one walk from a root to a matched entry: which
//! node was visited, how many key bits it consumed and where the walk went
//! next. The checker uses paths to name the exact position of a fault, and
//! they double as a human-readable trace in diagnostics.

use crate::key::KeyFragment;
use crate::trie::ptr::TriePtr;

/// One step of a walk through a single node.
#[derive(Clone, Debug)]
pub enum TriePathEntry {
    /// The walk ends here: this node holds the value.
    Terminal {
        /// Key bits consumed inside this node.
        bit_num: u32,
        value: u64,
        /// Rank of the entry within the node.
        entry_num: u64,
    },
    /// The walk continues below.
    NonTerminal {
        bit_num: u32,
        child: TriePtr,
        /// Rank of the child's first entry within this node's subtree.
        entry_num_base: u64,
    },
    /// The searched key is not in this subtree; carries the subtree size
    /// so rank arithmetic stays consistent.
    OffTheEnd { size: u64 },
}

impl TriePathEntry {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TriePathEntry::Terminal { .. })
    }

    pub fn is_off_the_end(&self) -> bool {
        matches!(self, TriePathEntry::OffTheEnd { .. })
    }

    pub fn value(&self) -> Option<u64> {
        match self {
            TriePathEntry::Terminal { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// An ordered walk from a root towards an entry.
#[derive(Clone, Debug, Default)]
pub struct TriePath {
    entries: Vec<(TriePtr, TriePathEntry)>,
    /// Key bits accumulated along the walk.
    key: KeyFragment,
}

impl TriePath {
    pub fn new() -> TriePath {
        TriePath {
            entries: Vec::new(),
            key: KeyFragment::empty(),
        }
    }

    pub fn push(&mut self, node: TriePtr, entry: TriePathEntry, consumed: &KeyFragment) {
        self.key.append(consumed);
        self.entries.push((node, entry));
    }

    pub fn pop(&mut self) -> Option<(TriePtr, TriePathEntry)> {
        self.entries.pop()
    }

    pub fn root(&self) -> Option<TriePtr> {
        self.entries.first().map(|(p, _)| *p)
    }

    pub fn leaf(&self) -> Option<&(TriePtr, TriePathEntry)> {
        self.entries.last()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// The walk found a value.
    pub fn valid(&self) -> bool {
        self.leaf().is_some_and(|(_, e)| e.is_terminal())
    }

    pub fn value(&self) -> Option<u64> {
        self.leaf().and_then(|(_, e)| e.value())
    }

    /// Key bits accumulated so far.
    pub fn key(&self) -> &KeyFragment {
        &self.key
    }

    /// Global rank of the matched entry.
    pub fn entry_num(&self) -> u64 {
        self.entries
            .iter()
            .map(|(_, e)| match e {
                TriePathEntry::Terminal { entry_num, .. } => *entry_num,
                TriePathEntry::NonTerminal { entry_num_base, .. } => *entry_num_base,
                TriePathEntry::OffTheEnd { size } => *size,
            })
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TriePtr, TriePathEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::ptr::{NodeType, State};

    #[test]
    fn rank_accumulates_along_the_walk() {
        let mut path = TriePath::new();
        let n1 = TriePtr::new(NodeType::DenseBranch, State::CopyOnWrite, 8);
        let n2 = TriePtr::new(NodeType::SparseTerm, State::CopyOnWrite, 16);
        path.push(
            n1,
            TriePathEntry::NonTerminal {
                bit_num: 4,
                child: n2,
                entry_num_base: 10,
            },
            &KeyFragment::new(0b1010, 4),
        );
        path.push(
            n2,
            TriePathEntry::Terminal {
                bit_num: 8,
                value: 99,
                entry_num: 2,
            },
            &KeyFragment::new(0xAB, 8),
        );
        assert!(path.valid());
        assert_eq!(path.entry_num(), 12);
        assert_eq!(path.value(), Some(99));
        assert_eq!(path.key().bits(), 12);
        assert_eq!(path.root(), Some(n1));
    }
}
