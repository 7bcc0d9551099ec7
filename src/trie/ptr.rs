//! The 64-bit tagged trie pointer.
//!
//! Layout: `state:1 | type:4 | data:59`. The data field either encodes a
//! whole inline terminal (see `trie::inline`) or, for indirect node types,
//! an aligned offset with optional metadata bits stolen from the low end:
//! `offset >> align_bits << meta_bits | meta`. Only the sparse terminal
//! uses metadata bits; every other node self-describes in its repr.

/// Bits available for the data field.
pub const DATA_BITS: u32 = 59;
const DATA_MASK: u64 = (1u64 << DATA_BITS) - 1;
const TYPE_SHIFT: u32 = 59;
const STATE_SHIFT: u32 = 63;

/// Mutability state of the node a pointer addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Immutable; replaced by copying, published by root CAS.
    CopyOnWrite = 0,
    /// Privately owned by a transaction; mutated freely.
    InPlace = 1,
}

/// The eight node variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    Null = 0,
    BinaryBranch = 1,
    InlineTerm = 2,
    BasicKeyedTerm = 3,
    SparseTerm = 4,
    CompressedTerm = 5,
    LargeKeyTerm = 6,
    DenseBranch = 7,
}

impl NodeType {
    pub fn from_bits(bits: u64) -> NodeType {
        match bits & 0xF {
            0 => NodeType::Null,
            1 => NodeType::BinaryBranch,
            2 => NodeType::InlineTerm,
            3 => NodeType::BasicKeyedTerm,
            4 => NodeType::SparseTerm,
            5 => NodeType::CompressedTerm,
            6 => NodeType::LargeKeyTerm,
            7 => NodeType::DenseBranch,
            _ => NodeType::Null,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriePtr {
    bits: u64,
}

impl TriePtr {
    /// The null pointer: an empty trie or an empty branch.
    pub const NULL: TriePtr = TriePtr { bits: 0 };

    pub fn new(ty: NodeType, state: State, data: u64) -> TriePtr {
        debug_assert_eq!(data & !DATA_MASK, 0, "data overflows the pointer");
        TriePtr {
            bits: ((state as u64) << STATE_SHIFT) | ((ty as u64) << TYPE_SHIFT) | data,
        }
    }

    pub fn from_bits(bits: u64) -> TriePtr {
        TriePtr { bits }
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn is_null(&self) -> bool {
        self.node_type() == NodeType::Null
    }

    pub fn node_type(&self) -> NodeType {
        NodeType::from_bits((self.bits >> TYPE_SHIFT) & 0xF)
    }

    pub fn state(&self) -> State {
        if self.bits >> STATE_SHIFT != 0 {
            State::InPlace
        } else {
            State::CopyOnWrite
        }
    }

    pub fn data(&self) -> u64 {
        self.bits & DATA_MASK
    }

    /// Same node, different state tag. Only valid for nodes whose storage
    /// the caller owns (or for inline terminals, which have none).
    pub fn with_state(&self, state: State) -> TriePtr {
        TriePtr::new(self.node_type(), state, self.data())
    }

    /// Encode an indirect pointer. The offset's alignment bits are shifted
    /// away and the freed space holds `meta`.
    pub fn indirect(
        ty: NodeType,
        state: State,
        offset: u64,
        align_bits: u32,
        meta_bits: u32,
        meta: u32,
    ) -> TriePtr {
        debug_assert!(offset != 0, "indirect pointer to offset 0");
        debug_assert_eq!(
            offset & ((1 << align_bits) - 1),
            0,
            "offset not aligned for its node type"
        );
        debug_assert!(meta_bits == 0 || u64::from(meta) < (1u64 << meta_bits));
        let data = ((offset >> align_bits) << meta_bits) | meta as u64;
        TriePtr::new(ty, state, data)
    }

    /// Offset of an indirect pointer.
    pub fn offset(&self, align_bits: u32, meta_bits: u32) -> u64 {
        (self.data() >> meta_bits) << align_bits
    }

    /// Metadata bits of an indirect pointer.
    pub fn meta(&self, meta_bits: u32) -> u32 {
        (self.data() & ((1u64 << meta_bits) - 1)) as u32
    }
}

impl Default for TriePtr {
    fn default() -> TriePtr {
        TriePtr::NULL
    }
}

impl std::fmt::Debug for TriePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "TriePtr(null)");
        }
        write!(
            f,
            "TriePtr({:?}/{:?}/{:#x})",
            self.node_type(),
            self.state(),
            self.data()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        assert_eq!(TriePtr::NULL.bits(), 0);
        assert!(TriePtr::NULL.is_null());
        assert_eq!(TriePtr::NULL.state(), State::CopyOnWrite);
    }

    #[test]
    fn tag_round_trip() {
        let p = TriePtr::new(NodeType::DenseBranch, State::InPlace, 0x1234);
        assert_eq!(p.node_type(), NodeType::DenseBranch);
        assert_eq!(p.state(), State::InPlace);
        assert_eq!(p.data(), 0x1234);
        let q = p.with_state(State::CopyOnWrite);
        assert_eq!(q.state(), State::CopyOnWrite);
        assert_eq!(q.data(), p.data());
    }

    #[test]
    fn indirect_round_trip() {
        // 64-byte aligned node with 10 metadata bits.
        let p = TriePtr::indirect(NodeType::SparseTerm, State::CopyOnWrite, 0x40_0040, 3, 10, 0x2A5);
        assert_eq!(p.offset(3, 10), 0x40_0040);
        assert_eq!(p.meta(10), 0x2A5);
        // Offsets near the top of a large region survive.
        let big = 1u64 << 45;
        let q = TriePtr::indirect(NodeType::BasicKeyedTerm, State::InPlace, big, 3, 0, 0);
        assert_eq!(q.offset(3, 0), big);
    }
}
