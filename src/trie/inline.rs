//! The inline terminal: a single (key, value) pair encoded entirely inside
//! the trie pointer.
//!
//! The 59 data bits are laid out `payload:46 | value_bits:6 | key_len:7`
//! (payload in the high bits). The payload packs the key's integer value
//! above the value: `key << value_bits | value`. Encoding fails when the
//! two don't fit in 46 bits together, in which case the caller falls back
//! to a keyed terminal node.

use crate::error::Result;
use crate::key::KeyFragment;
use crate::trie::node::LocalNode;
use crate::trie::ptr::{NodeType, State, TriePtr};

const KEY_LEN_BITS: u32 = 7;
const VALUE_BITS_BITS: u32 = 6;
pub const PAYLOAD_BITS: u32 = 59 - KEY_LEN_BITS - VALUE_BITS_BITS; // 46

fn bits_needed(v: u64) -> u32 {
    64 - v.leading_zeros()
}

/// Try to encode `(key, value)` into a pointer. `None` when it can't fit.
pub fn encode(key: &KeyFragment, value: u64, state: State) -> Option<TriePtr> {
    if key.bits() > 64 {
        return None;
    }
    let key_val = key.get_key();
    let key_bits_needed = bits_needed(key_val);
    let value_bits_needed = bits_needed(value);
    if key_bits_needed + value_bits_needed > PAYLOAD_BITS {
        return None;
    }
    let value_bits = PAYLOAD_BITS - key_bits_needed;
    let payload = (key_val << value_bits) | value;
    let data = (payload << (KEY_LEN_BITS + VALUE_BITS_BITS))
        | ((value_bits as u64) << KEY_LEN_BITS)
        | key.bits() as u64;
    let ptr = TriePtr::new(NodeType::InlineTerm, state, data);
    debug_assert_eq!(decode(ptr), (key.clone(), value));
    Some(ptr)
}

/// Decode the (key, value) pair out of an inline pointer.
pub fn decode(ptr: TriePtr) -> (KeyFragment, u64) {
    debug_assert_eq!(ptr.node_type(), NodeType::InlineTerm);
    let data = ptr.data();
    let key_len = (data & ((1 << KEY_LEN_BITS) - 1)) as u32;
    let value_bits = ((data >> KEY_LEN_BITS) & ((1 << VALUE_BITS_BITS) - 1)) as u32;
    let payload = data >> (KEY_LEN_BITS + VALUE_BITS_BITS);
    let value = if value_bits == 0 {
        0
    } else {
        payload & ((1u64 << value_bits) - 1)
    };
    let key_val = if value_bits >= 64 { 0 } else { payload >> value_bits };
    (KeyFragment::new(key_val, key_len), value)
}

pub fn local(ptr: TriePtr) -> Result<LocalNode> {
    let (key, value) = decode(ptr);
    Ok(LocalNode::Terminal {
        entries: vec![(key, value)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for (kv, kb, v) in [
            (0u64, 0u32, 0u64),
            (0xFF, 8, 42),
            (0x3FF, 10, (1 << 36) - 1),
            (1, 64, 7),
        ] {
            let key = KeyFragment::new(kv, kb);
            let ptr = encode(&key, v, State::CopyOnWrite).unwrap();
            assert_eq!(decode(ptr), (key, v));
        }
    }

    #[test]
    fn overflow_rejected() {
        // 40 bits of key value + 10 bits of value > 46 payload bits.
        let key = KeyFragment::new((1 << 40) - 1, 40);
        assert!(encode(&key, 1 << 9, State::CopyOnWrite).is_none());
        // A long but zero-valued key still fits.
        let key = KeyFragment::new(0, 64);
        assert!(encode(&key, 123, State::CopyOnWrite).is_some());
        // Keys longer than 64 bits never fit.
        let mut long = KeyFragment::new(0, 64);
        long.push_bits(0, 1);
        assert!(encode(&long, 0, State::CopyOnWrite).is_none());
    }
}
