//! Bit-granular keys.
//!
//! A [`KeyFragment`] is an ordered sequence of bits. Bit order is big
//! endian: bit 0 is the most significant bit of the first word, so
//! comparing fragments word by word gives bit-lexicographic order. Numeric
//! keys are byte-swapped to big endian before becoming bit strings, which
//! makes trie iteration order equal numeric order.
//!
//! Fragments up to 256 bits live entirely on the stack
//! (`KEY_COMPACT_WORDS` words); longer ones spill to a heap vector. The
//! *persisted* form is [`KeyFragmentRepr`]: 64-bit-or-shorter keys inline
//! in the repr itself, longer ones as a chain of 64-byte node-allocator
//! slots.

use byteorder::{BigEndian, ByteOrder};

use crate::alloc::MemoryAllocator;
use crate::error::{Error, Result};

/// Words kept on the stack before spilling to the heap.
pub const KEY_COMPACT_WORDS: usize = 4;

#[derive(Clone)]
enum KeyWords {
    Inline { len: u8, words: [u64; KEY_COMPACT_WORDS] },
    Heap(Vec<u64>),
}

impl KeyWords {
    fn new() -> KeyWords {
        KeyWords::Inline {
            len: 0,
            words: [0; KEY_COMPACT_WORDS],
        }
    }

    fn as_slice(&self) -> &[u64] {
        match self {
            KeyWords::Inline { len, words } => &words[..*len as usize],
            KeyWords::Heap(v) => v,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u64] {
        match self {
            KeyWords::Inline { len, words } => &mut words[..*len as usize],
            KeyWords::Heap(v) => v,
        }
    }

    fn push(&mut self, w: u64) {
        match self {
            KeyWords::Inline { len, words } => {
                if (*len as usize) < KEY_COMPACT_WORDS {
                    words[*len as usize] = w;
                    *len += 1;
                } else {
                    let mut v = words.to_vec();
                    v.push(w);
                    *self = KeyWords::Heap(v);
                }
            }
            KeyWords::Heap(v) => v.push(w),
        }
    }

    fn truncate(&mut self, n: usize) {
        match self {
            KeyWords::Inline { len, .. } => {
                *len = (*len).min(n.min(KEY_COMPACT_WORDS) as u8)
            }
            KeyWords::Heap(v) => v.truncate(n),
        }
    }

    fn len(&self) -> usize {
        match self {
            KeyWords::Inline { len, .. } => *len as usize,
            KeyWords::Heap(v) => v.len(),
        }
    }
}

/*****************************************************************************/
/* KEY FRAGMENT                                                              */
/*****************************************************************************/

#[derive(Clone)]
pub struct KeyFragment {
    bits: u32,
    words: KeyWords,
}

fn words_for_bits(bits: u32) -> usize {
    ((bits as usize) + 63) / 64
}

impl Default for KeyFragment {
    fn default() -> KeyFragment {
        KeyFragment::empty()
    }
}

impl KeyFragment {
    pub fn empty() -> KeyFragment {
        KeyFragment {
            bits: 0,
            words: KeyWords::new(),
        }
    }

    /// A fragment of `bits` length whose integer value is the low `bits`
    /// bits of `key`.
    pub fn new(key: u64, bits: u32) -> KeyFragment {
        assert!(bits <= 64);
        let mut kf = KeyFragment::empty();
        kf.push_bits(key, bits);
        kf
    }

    /// A fragment spelling out `bytes` in order.
    pub fn from_bytes(bytes: &[u8]) -> KeyFragment {
        let mut kf = KeyFragment::empty();
        for &b in bytes {
            kf.push_bits(b as u64, 8);
        }
        kf
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn word(&self, i: usize) -> u64 {
        self.words.as_slice().get(i).copied().unwrap_or(0)
    }

    /// Read `n` bits (n <= 64) starting at bit `start`.
    pub fn get_bits(&self, n: u32, start: u32) -> u64 {
        if n == 0 {
            return 0;
        }
        assert!(n <= 64 && start + n <= self.bits, "get_bits out of range");
        let w = (start / 64) as usize;
        let off = start % 64;
        let pair = ((self.word(w) as u128) << 64) | self.word(w + 1) as u128;
        ((pair << off) >> (128 - n)) as u64
    }

    /// The whole fragment as an integer; only valid up to 64 bits.
    pub fn get_key(&self) -> u64 {
        assert!(self.bits <= 64, "get_key on a fragment longer than 64 bits");
        if self.bits == 0 {
            0
        } else {
            self.get_bits(self.bits, 0)
        }
    }

    /// Append `n` bits (right-aligned in `val`).
    pub fn push_bits(&mut self, val: u64, n: u32) {
        if n == 0 {
            return;
        }
        assert!(n <= 64);
        let val = if n == 64 { val } else { val & ((1u64 << n) - 1) };
        let off = self.bits % 64;
        let spread = (val as u128) << (128 - n as u128 - off as u128);
        let hi = (spread >> 64) as u64;
        let lo = spread as u64;
        if off == 0 {
            self.words.push(hi);
        } else {
            let last = self.words.len() - 1;
            self.words.as_mut_slice()[last] |= hi;
            if off + n > 64 {
                self.words.push(lo);
            }
        }
        self.bits += n;
    }

    /// Append another fragment.
    pub fn append(&mut self, other: &KeyFragment) {
        let mut remaining = other.bits;
        let mut start = 0;
        while remaining > 0 {
            let n = remaining.min(64);
            self.push_bits(other.get_bits(n, start), n);
            start += n;
            remaining -= n;
        }
    }

    /// Concatenation.
    pub fn concat(&self, other: &KeyFragment) -> KeyFragment {
        let mut r = self.clone();
        r.append(other);
        r
    }

    /// The first `n` bits.
    pub fn prefix(&self, n: u32) -> KeyFragment {
        assert!(n <= self.bits);
        let mut r = self.clone();
        r.bits = n;
        r.words.truncate(words_for_bits(n));
        // Zero the tail so equality and ordering stay word-wise.
        let tail = n % 64;
        if tail != 0 {
            let last = r.words.len() - 1;
            r.words.as_mut_slice()[last] &= !((1u64 << (64 - tail)) - 1);
        }
        r
    }

    /// Everything after the first `n` bits.
    pub fn suffix(&self, n: u32) -> KeyFragment {
        assert!(n <= self.bits);
        let mut r = KeyFragment::empty();
        let mut start = n;
        while start < self.bits {
            let take = (self.bits - start).min(64);
            r.push_bits(self.get_bits(take, start), take);
            start += take;
        }
        r
    }

    /// Remove and return the first `n` bits.
    pub fn remove_bits(&mut self, n: u32) -> u64 {
        let val = self.get_bits(n, 0);
        *self = self.suffix(n);
        val
    }

    /// Length of the longest common prefix with `other`.
    pub fn common_prefix_len(&self, other: &KeyFragment) -> u32 {
        let max = self.bits.min(other.bits);
        let mut i = 0;
        let mut bit = 0u32;
        while bit < max {
            let a = self.word(i);
            let b = other.word(i);
            if a != b {
                return max.min(bit + (a ^ b).leading_zeros());
            }
            i += 1;
            bit += 64;
        }
        max
    }

    /// The longest common prefix with `other`.
    pub fn common_prefix(&self, other: &KeyFragment) -> KeyFragment {
        self.prefix(self.common_prefix_len(other))
    }

    /// If `other` is a prefix of `self`, strip it and return true.
    pub fn consume(&mut self, other: &KeyFragment) -> bool {
        if other.bits > self.bits || self.common_prefix_len(other) != other.bits {
            return false;
        }
        *self = self.suffix(other.bits);
        true
    }

    pub fn starts_with(&self, other: &KeyFragment) -> bool {
        other.bits <= self.bits && self.common_prefix_len(other) == other.bits
    }

    /// The fragment's bytes, zero-padded in the last partial byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let nbytes = ((self.bits as usize) + 7) / 8;
        let mut out = Vec::with_capacity(nbytes);
        for i in 0..nbytes {
            let start = i as u32 * 8;
            let n = (self.bits - start).min(8);
            out.push((self.get_bits(n, start) << (8 - n)) as u8);
        }
        out
    }

    /*************************************************************************/
    /* PERSISTED REPRESENTATION                                              */
    /*************************************************************************/

    /// Persist this fragment. Fragments over 64 bits allocate a chain of
    /// 64-byte node slots; the caller owns the repr and must
    /// [`KeyFragment::dealloc_repr`] it.
    pub fn alloc_repr(&self, area: &MemoryAllocator) -> Result<KeyFragmentRepr> {
        if self.bits <= 64 {
            return Ok(KeyFragmentRepr {
                bits: self.bits,
                reserved: 0,
                data: self.get_key(),
            });
        }
        let words = self.words.as_slice();
        let mut head = 0u64;
        let mut tail: Option<u64> = None;
        for chunk in words.chunks(KEY_CHUNK_WORDS) {
            let mut c: KeyChunk = bytemuck::Zeroable::zeroed();
            c.words[..chunk.len()].copy_from_slice(chunk);
            let offset = area.node_alloc.alloc_value(c)?;
            match tail {
                None => head = offset,
                Some(prev) => {
                    let p = area.region().at::<KeyChunk>(prev)?;
                    unsafe { (*p).next = offset };
                }
            }
            tail = Some(offset);
        }
        Ok(KeyFragmentRepr {
            bits: self.bits,
            reserved: 0,
            data: head,
        })
    }

    /// Load a fragment back from its persisted form.
    pub fn load_repr(repr: &KeyFragmentRepr, area: &MemoryAllocator) -> Result<KeyFragment> {
        if repr.bits <= 64 {
            return Ok(KeyFragment::new(repr.data, repr.bits));
        }
        let mut kf = KeyFragment::empty();
        let mut remaining = repr.bits;
        let mut offset = repr.data;
        while remaining > 0 {
            if offset == 0 {
                return Err(Error::Integrity {
                    offset: repr.data,
                    detail: "key chunk chain shorter than the key",
                });
            }
            let chunk = unsafe { &*area.region().at::<KeyChunk>(offset)? };
            for w in 0..KEY_CHUNK_WORDS {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(64);
                kf.push_bits(chunk.words[w] >> (64 - take), take);
                remaining -= take;
            }
            offset = chunk.next;
        }
        Ok(kf)
    }

    /// Free the heap storage behind a repr, if any.
    pub fn dealloc_repr(repr: &KeyFragmentRepr, area: &MemoryAllocator) -> Result<()> {
        if repr.bits <= 64 {
            return Ok(());
        }
        let mut offset = repr.data;
        while offset != 0 {
            let next = unsafe { (*area.region().at::<KeyChunk>(offset)?).next };
            area.node_alloc
                .deallocate(offset, std::mem::size_of::<KeyChunk>() as u64)?;
            offset = next;
        }
        Ok(())
    }

    /// Duplicate a repr, giving the copy its own heap storage.
    pub fn copy_repr(repr: &KeyFragmentRepr, area: &MemoryAllocator) -> Result<KeyFragmentRepr> {
        if repr.bits <= 64 {
            return Ok(*repr);
        }
        KeyFragment::load_repr(repr, area)?.alloc_repr(area)
    }
}

impl PartialEq for KeyFragment {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
            && self.words.as_slice()[..words_for_bits(self.bits)]
                == other.words.as_slice()[..words_for_bits(other.bits)]
    }
}

impl Eq for KeyFragment {}

impl PartialOrd for KeyFragment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyFragment {
    /// Bit-lexicographic order: a proper prefix sorts before its extension.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let max = words_for_bits(self.bits.max(other.bits));
        for i in 0..max {
            match self.word(i).cmp(&other.word(i)) {
                std::cmp::Ordering::Equal => {}
                ne => return ne,
            }
        }
        self.bits.cmp(&other.bits)
    }
}

impl std::fmt::Debug for KeyFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.bits <= 64 {
            write!(f, "KeyFragment({:#x}:{})", self.get_key(), self.bits)
        } else {
            write!(f, "KeyFragment({} bits)", self.bits)
        }
    }
}

impl std::hash::Hash for KeyFragment {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
        self.words.as_slice()[..words_for_bits(self.bits)].hash(state);
    }
}

/*****************************************************************************/
/* PERSISTED REPR                                                            */
/*****************************************************************************/

/// On-file form of a key fragment: 16 bytes. Keys of 64 bits or fewer are
/// stored right-aligned in `data`; longer keys keep the offset of the first
/// [`KeyChunk`] there instead.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KeyFragmentRepr {
    pub bits: u32,
    reserved: u32,
    data: u64,
}

impl KeyFragmentRepr {
    pub fn is_inline(&self) -> bool {
        self.bits <= 64
    }

    /// Bytes of out-of-line storage behind this repr.
    pub fn heap_usage(&self) -> u64 {
        if self.is_inline() {
            0
        } else {
            let words = words_for_bits(self.bits) as u64;
            words.div_ceil(KEY_CHUNK_WORDS as u64) * std::mem::size_of::<KeyChunk>() as u64
        }
    }
}

pub const KEY_CHUNK_WORDS: usize = 7;

/// One 64-byte link of an out-of-line key chain.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KeyChunk {
    next: u64,
    words: [u64; KEY_CHUNK_WORDS],
}

const _: () = assert!(std::mem::size_of::<KeyChunk>() == 64);

/*****************************************************************************/
/* TRIE KEY                                                                  */
/*****************************************************************************/

/// User-facing key: an owned byte string convertible to and from the
/// primitive key types. Numbers are stored big endian so that iterating a
/// trie of numeric keys yields them in numeric order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrieKey {
    data: Vec<u8>,
}

impl TrieKey {
    pub fn from_fragment(kf: &KeyFragment) -> TrieKey {
        TrieKey {
            data: kf.to_bytes(),
        }
    }

    pub fn to_fragment(&self) -> KeyFragment {
        KeyFragment::from_bytes(&self.data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Interpret as a u64; the key must have been stored from one.
    pub fn as_u64(&self) -> u64 {
        assert_eq!(self.data.len(), 8, "key was not stored from a u64");
        BigEndian::read_u64(&self.data)
    }

    /// Interpret as a UTF-8 string.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<u64> for TrieKey {
    fn from(key: u64) -> TrieKey {
        let mut data = vec![0u8; 8];
        BigEndian::write_u64(&mut data, key);
        TrieKey { data }
    }
}

impl From<&str> for TrieKey {
    fn from(key: &str) -> TrieKey {
        TrieKey {
            data: key.as_bytes().to_vec(),
        }
    }
}

impl From<String> for TrieKey {
    fn from(key: String) -> TrieKey {
        TrieKey {
            data: key.into_bytes(),
        }
    }
}

impl From<&[u8]> for TrieKey {
    fn from(key: &[u8]) -> TrieKey {
        TrieKey { data: key.to_vec() }
    }
}

impl From<Vec<u8>> for TrieKey {
    fn from(data: Vec<u8>) -> TrieKey {
        TrieKey { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_get_remove() {
        let mut kf = KeyFragment::empty();
        kf.push_bits(0x1234, 16);
        kf.push_bits(0x5, 4);
        kf.push_bits(0xABCDEF, 24);
        assert_eq!(kf.bits(), 44);
        assert_eq!(kf.get_bits(16, 0), 0x1234);
        assert_eq!(kf.remove_bits(16), 0x1234);
        assert_eq!(kf.remove_bits(4), 0x5);
        assert_eq!(kf.get_bits(24, 0), 0xABCDEF);
    }

    #[test]
    fn common_prefix_len_spec_vector() {
        let mut a = KeyFragment::empty();
        a.push_bits(0x1234, 16);
        a.push_bits(0x5, 4);
        a.push_bits(0xABCDEF, 24);
        let mut b = KeyFragment::empty();
        b.push_bits(0x1234, 16);
        b.push_bits(0x5, 4);
        b.push_bits(0xABCDEE, 24);
        assert_eq!(a.common_prefix_len(&b), 43);
    }

    #[test]
    fn round_trip_value() {
        let kf = KeyFragment::new(0xDEADBEEF, 32);
        assert_eq!(kf.get_key(), 0xDEADBEEF);
        assert_eq!(kf.bits(), 32);
        let kf = KeyFragment::new(u64::MAX, 64);
        assert_eq!(kf.get_key(), u64::MAX);
    }

    #[test]
    fn consume_and_suffix() {
        let full = KeyFragment::from_bytes(b"hello world");
        let pre = KeyFragment::from_bytes(b"hello ");
        let mut k = full.clone();
        assert!(k.consume(&pre));
        assert_eq!(k, KeyFragment::from_bytes(b"world"));
        let mut k2 = full.clone();
        assert!(!k2.consume(&KeyFragment::from_bytes(b"help")));
        assert_eq!(k2, full);
    }

    #[test]
    fn append_crosses_words() {
        let mut kf = KeyFragment::empty();
        for i in 0..10u64 {
            kf.push_bits(i, 37);
        }
        assert_eq!(kf.bits(), 370);
        for i in 0..10u64 {
            assert_eq!(kf.get_bits(37, i as u32 * 37), i);
        }
    }

    #[test]
    fn ordering_is_bitwise() {
        let a = KeyFragment::new(0b10, 2);
        let b = KeyFragment::new(0b11, 2);
        let c = KeyFragment::new(0b1, 1); // prefix of both
        assert!(a < b);
        assert!(c < a, "a prefix sorts before its extensions");
        // Numeric order through big-endian trie keys.
        let k1 = TrieKey::from(5u64).to_fragment();
        let k2 = TrieKey::from(300u64).to_fragment();
        assert!(k1 < k2);
    }

    #[test]
    fn trie_key_round_trips() {
        assert_eq!(TrieKey::from(123456u64).as_u64(), 123456);
        assert_eq!(TrieKey::from("meow").as_string(), "meow");
        let raw: &[u8] = &[0, 1, 2, 255];
        assert_eq!(TrieKey::from(raw).as_bytes(), raw);
        let kf = TrieKey::from(99u64).to_fragment();
        assert_eq!(TrieKey::from_fragment(&kf).as_u64(), 99);
        assert_eq!(kf.bits(), 64);
    }

    #[test]
    fn prefix_masks_tail() {
        let a = KeyFragment::new(0b1111, 4);
        let p = a.prefix(2);
        assert_eq!(p, KeyFragment::new(0b11, 2));
        assert_eq!(p.get_key(), 0b11);
    }
}
