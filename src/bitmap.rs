//! Lock-free fullness bitmaps.
//!
//! A [`FullBitmap`] tracks up to `WORDS * 64` allocatable entries together
//! with a per-word "full" summary, so that a free entry can be located with
//! two bit scans. The summary is maintained with plain CAS loops and is
//! allowed to lag behind the words themselves in one direction only:
//! a spurious "full" observation may occur under contention (see
//! `mark_deallocated`), a spurious "not full" may not. Consumers retry a
//! bounded number of times and then fall back to allocating fresh storage.
//!
//! These structs live inside mapped pages and are always manipulated through
//! atomic views of their fields.

use std::sync::atomic::{AtomicU64, Ordering};

/// Find the lowest clear bit of `word` (under `full_mask`) at or after
/// `start_at`, wrapping around. Returns `None` when every masked bit is set.
///
/// The rotate makes the scan start position fair: successive callers with
/// increasing `start_at` spread their allocations across the word instead of
/// all contending on bit zero.
#[inline]
pub fn find_clear_bit(word: u64, full_mask: u64, start_at: u32) -> Option<u32> {
    let masked = !word & full_mask;
    if masked == 0 {
        return None;
    }
    let num_bits = 64 - full_mask.leading_zeros();
    let rot = start_at % num_bits;
    let rotated = masked.rotate_right(rot);
    let bit = (rotated.trailing_zeros() + rot) % 64;
    debug_assert_eq!(word & (1 << bit), 0);
    Some(bit)
}

/// Outcome of a summary-bit update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TryBitmap {
    /// The bit already had the requested value; nothing changed.
    Failed,
    /// The bit changed but the word did not cross the full boundary.
    Success,
    /// The bit changed and the word crossed the full boundary; the parent
    /// level must be updated.
    Recurse,
}

fn try_mark_full_u64(word: &AtomicU64, bit: u32, full_mask: u64) -> TryBitmap {
    let mut current = word.load(Ordering::Acquire);
    loop {
        if current & (1 << bit) != 0 {
            return TryBitmap::Failed;
        }
        let new = current | (1 << bit);
        match word.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                return if new == full_mask {
                    TryBitmap::Recurse
                } else {
                    TryBitmap::Success
                }
            }
            Err(v) => current = v,
        }
    }
}

fn try_mark_not_full_u64(word: &AtomicU64, bit: u32, full_mask: u64) -> TryBitmap {
    let mut current = word.load(Ordering::Acquire);
    loop {
        if current & (1 << bit) == 0 {
            return TryBitmap::Failed;
        }
        let new = current & !(1 << bit);
        match word.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                return if current == full_mask {
                    TryBitmap::Recurse
                } else {
                    TryBitmap::Success
                }
            }
            Err(v) => current = v,
        }
    }
}

fn mark_full_u64(word: &AtomicU64, bit: u32, full_mask: u64) -> bool {
    // Failed means another thread already set the bit; the transition (and
    // any propagation) is theirs, not ours.
    match try_mark_full_u64(word, bit, full_mask) {
        TryBitmap::Failed | TryBitmap::Success => false,
        TryBitmap::Recurse => true,
    }
}

fn mark_not_full_u64(word: &AtomicU64, bit: u32, full_mask: u64) -> bool {
    match try_mark_not_full_u64(word, bit, full_mask) {
        TryBitmap::Failed | TryBitmap::Success => false,
        TryBitmap::Recurse => true,
    }
}

/// CAS-allocate the first clear bit at or after `start_at`.
/// Returns `(bit, became_full)`, or `None` when the word is full.
fn allocate_clear_bit(word: &AtomicU64, full_mask: u64, start_at: u32) -> Option<(u32, bool)> {
    let mut current = word.load(Ordering::Acquire);
    loop {
        debug_assert_eq!(current & !full_mask, 0, "non-entry bit set in bitmap");
        let bit = find_clear_bit(current, full_mask, start_at)?;
        let new = current | (1 << bit);
        match word.compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some((bit, new == full_mask)),
            Err(v) => current = v,
        }
    }
}

/*****************************************************************************/
/* FULL BITMAP                                                               */
/*****************************************************************************/

/// A bitmap of up to `WORDS * 64` entries with a one-bit-per-word full
/// summary. Entirely lock free.
///
/// The struct is laid out for direct placement inside a mapped page. The
/// actual number of valid entries is fixed at [`FullBitmap::init`] time and
/// recorded in the header so that partial trailing words mask correctly.
#[repr(C)]
pub struct FullBitmap<const WORDS: usize> {
    full_index: u64,
    num_entries: u32,
    unused: u32,
    entries: [u64; WORDS],
}

impl<const WORDS: usize> FullBitmap<WORDS> {
    pub const CAPACITY: u32 = WORDS as u32 * 64;

    fn index(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(&self.full_index as *const u64 as *mut u64) }
    }

    fn word(&self, i: usize) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(&self.entries[i] as *const u64 as *mut u64) }
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    fn num_words(&self) -> usize {
        ((self.num_entries as usize) + 63) / 64
    }

    fn index_mask(&self) -> u64 {
        let w = self.num_words();
        if w >= 64 {
            u64::MAX
        } else {
            (1u64 << w) - 1
        }
    }

    fn word_mask(&self, i: usize) -> u64 {
        let leftover = self.num_entries % 64;
        if leftover != 0 && i == self.num_words() - 1 {
            (1u64 << leftover) - 1
        } else {
            u64::MAX
        }
    }

    /// Initialize in place. `full` seeds every entry as allocated.
    pub fn init(&mut self, num_entries: u32, full: bool) {
        assert!(num_entries >= 1 && num_entries as usize <= WORDS * 64);
        self.num_entries = num_entries;
        self.unused = 0;
        self.full_index = 0;
        self.entries = [0; WORDS];
        if full {
            for i in 0..self.num_words() {
                self.entries[i] = self.word_mask(i);
            }
            self.full_index = self.index_mask();
        }
    }

    /// Allocate a free entry. Returns `(entry, became_full)`.
    ///
    /// May spuriously return `None` under heavy contention even though a free
    /// entry exists (the documented summary race); callers retry or fall back
    /// to new storage.
    pub fn allocate(&self, start_at: u32) -> Option<(u32, bool)> {
        for _ in 0..5 {
            let word = if self.num_words() > 1 {
                let idx = self.index().load(Ordering::Acquire);
                match find_clear_bit(idx, self.index_mask(), start_at) {
                    Some(w) => w as usize,
                    None => return None, // completely full
                }
            } else {
                0
            };

            let Some((bit, word_full)) =
                allocate_clear_bit(self.word(word), self.word_mask(word), start_at)
            else {
                if self.num_words() > 1 {
                    continue; // raced with the summary; try again
                }
                return None;
            };

            let mut all_full = word_full;
            if self.num_words() > 1 && word_full {
                all_full = mark_full_u64(self.index(), word as u32, self.index_mask());
            }
            return Some((word as u32 * 64 + bit, all_full));
        }
        None
    }

    /// Find (but do not allocate) a non-full entry.
    pub fn get_non_full_entry(&self, start_at: u32) -> Option<u32> {
        for _ in 0..10 {
            let word = if self.num_words() > 1 {
                match find_clear_bit(self.index().load(Ordering::Acquire), self.index_mask(), start_at)
                {
                    Some(w) => w as usize,
                    None => return None,
                }
            } else {
                0
            };
            match find_clear_bit(
                self.word(word).load(Ordering::Acquire),
                self.word_mask(word),
                start_at,
            ) {
                Some(bit) => return Some(word as u32 * 64 + bit),
                None => {
                    if self.num_words() == 1 {
                        return None;
                    }
                    // summary raced; retry
                }
            }
        }
        None
    }

    /// Mark the entry allocated. Returns true if the bitmap is now full.
    pub fn mark_allocated(&self, entry: u32) -> bool {
        assert!(entry < self.num_entries);
        let (word, bit) = ((entry >> 6) as usize, entry & 63);
        if !mark_full_u64(self.word(word), bit, self.word_mask(word)) {
            return false;
        }
        if self.num_words() > 1 {
            mark_full_u64(self.index(), word as u32, self.index_mask())
        } else {
            true
        }
    }

    /// Mark the entry free. Returns true if the bitmap transitioned from
    /// full to not-full.
    ///
    /// Note the documented race: between the word update and the summary
    /// update another thread may refill the word, leaving the summary marked
    /// full while the word briefly wasn't. The summary eventually converges
    /// and the only consequence is a spurious full observation.
    pub fn mark_deallocated(&self, entry: u32) -> bool {
        assert!(entry < self.num_entries);
        let (word, bit) = ((entry >> 6) as usize, entry & 63);
        if !mark_not_full_u64(self.word(word), bit, self.word_mask(word)) {
            return false;
        }
        if self.num_words() > 1 {
            mark_not_full_u64(self.index(), word as u32, self.index_mask())
        } else {
            true
        }
    }

    pub fn is_allocated(&self, entry: u32) -> bool {
        let (word, bit) = ((entry >> 6) as usize, entry & 63);
        self.word(word).load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Estimate of the number of allocated entries. Concurrent changes may
    /// make this stale before it returns.
    pub fn num_full(&self) -> u32 {
        (0..self.num_words())
            .map(|i| self.word(i).load(Ordering::Relaxed).count_ones())
            .sum()
    }
}

/*****************************************************************************/
/* HIERARCHICAL BITMAP                                                       */
/*****************************************************************************/

/// A 32-entry bitmap whose full transition is publishable atomically.
///
/// `{bits, lock}` share one 64-bit word so that the transition to full and
/// the lock acquisition happen in a single CAS: the thread that fills (or
/// un-fills) the word owns the lock and must [`HierarchicalBitmap::unlock`]
/// after propagating the transition to the parent level. Other mutators spin
/// while the lock is held, so no thread can observe the word and its parent
/// in contradictory states.
#[repr(C)]
pub struct HierarchicalBitmap {
    data: u64,
}

const HB_MASK: u64 = u32::MAX as u64;
const HB_LOCK: u64 = 1 << 32;

impl HierarchicalBitmap {
    fn word(&self) -> &AtomicU64 {
        unsafe { AtomicU64::from_ptr(&self.data as *const u64 as *mut u64) }
    }

    pub fn init(&mut self) {
        self.data = 0;
    }

    pub fn find_clear_bit(&self, start_at: u32) -> Option<u32> {
        find_clear_bit(self.word().load(Ordering::Acquire) & HB_MASK, HB_MASK, start_at)
    }

    /// Allocate a clear bit. Returns `(bit, locked)`; when `locked` is true
    /// the caller filled the word, must propagate "full" upward, and then
    /// call [`Self::unlock`].
    pub fn allocate(&self, start_at: u32) -> Option<(u32, bool)> {
        let mut current = self.word().load(Ordering::Acquire);
        loop {
            if current & HB_LOCK != 0 {
                return None; // locked: spuriously full, caller retries
            }
            let bit = find_clear_bit(current & HB_MASK, HB_MASK, start_at)?;
            let mut new = current | (1 << bit);
            if new & HB_MASK == HB_MASK {
                new |= HB_LOCK;
            }
            match self
                .word()
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some((bit, new & HB_LOCK != 0)),
                Err(v) => current = v,
            }
        }
    }

    /// Clear a set bit. Returns true when the word transitioned from full to
    /// not-full, in which case the lock is held and the caller must
    /// propagate and then [`Self::unlock`].
    pub fn mark_not_full(&self, bit: u32) -> bool {
        let mut current = self.word().load(Ordering::Acquire);
        loop {
            if current & HB_LOCK != 0 {
                std::hint::spin_loop();
                current = self.word().load(Ordering::Acquire);
                continue;
            }
            assert!(current & (1 << bit) != 0, "mark_not_full: bit wasn't set");
            let mut new = current & !(1 << bit);
            if current & HB_MASK == HB_MASK {
                new |= HB_LOCK;
            }
            match self
                .word()
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new & HB_LOCK != 0,
                Err(v) => current = v,
            }
        }
    }

    /// Set a clear bit. Returns true when the word became full (lock held;
    /// propagate then [`Self::unlock`]).
    pub fn mark_full(&self, bit: u32) -> bool {
        let mut current = self.word().load(Ordering::Acquire);
        loop {
            if current & HB_LOCK != 0 {
                std::hint::spin_loop();
                current = self.word().load(Ordering::Acquire);
                continue;
            }
            assert!(current & (1 << bit) == 0, "mark_full: bit was already set");
            let mut new = current | (1 << bit);
            if new & HB_MASK == HB_MASK {
                new |= HB_LOCK;
            }
            match self
                .word()
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return new & HB_LOCK != 0,
                Err(v) => current = v,
            }
        }
    }

    /// Release the lock taken by a full transition.
    pub fn unlock(&self) {
        let prev = self.word().fetch_and(!HB_LOCK, Ordering::AcqRel);
        assert!(prev & HB_LOCK != 0, "unlock without lock held");
    }

    pub fn is_allocated(&self, bit: u32) -> bool {
        self.word().load(Ordering::Acquire) & (1 << bit) != 0
    }

    pub fn num_allocated(&self) -> u32 {
        (self.word().load(Ordering::Relaxed) & HB_MASK).count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    #[test]
    fn clear_bit_scan() {
        assert_eq!(find_clear_bit(0, u64::MAX, 0), Some(0));
        assert_eq!(find_clear_bit(0b0111, u64::MAX, 0), Some(3));
        assert_eq!(find_clear_bit(u64::MAX, u64::MAX, 7), None);
        // wrap-around fairness
        assert_eq!(find_clear_bit(0b0100, 0b1111, 3), Some(3));
        assert_eq!(find_clear_bit(0b1000, 0b1111, 3), Some(0));
        // partial mask
        assert_eq!(find_clear_bit(0b011, 0b011, 0), None);
    }

    #[test]
    fn single_word_allocate_all() {
        let mut bm: FullBitmap<1> = unsafe { std::mem::zeroed() };
        bm.init(10, false);
        let mut seen = [false; 10];
        for i in 0..10 {
            let (bit, full) = bm.allocate(0).unwrap();
            assert!(!seen[bit as usize]);
            seen[bit as usize] = true;
            assert_eq!(full, i == 9);
        }
        assert!(bm.allocate(0).is_none());
        assert!(bm.mark_deallocated(3));
        assert_eq!(bm.allocate(0).unwrap(), (3, true));
    }

    #[test]
    fn indexed_allocate_and_free() {
        let mut bm: FullBitmap<16> = unsafe { std::mem::zeroed() };
        bm.init(1024, false);
        for _ in 0..1024 {
            bm.allocate(0).unwrap();
        }
        assert_eq!(bm.num_full(), 1024);
        assert!(bm.allocate(0).is_none());
        assert!(bm.mark_deallocated(777));
        assert!(!bm.is_allocated(777));
        let (bit, full) = bm.allocate(0).unwrap();
        assert_eq!(bit, 777);
        assert!(full);
    }

    #[test]
    fn init_full_with_leftover() {
        let mut bm: FullBitmap<2> = unsafe { std::mem::zeroed() };
        bm.init(100, true);
        assert!(bm.allocate(0).is_none());
        assert_eq!(bm.num_full(), 100);
    }

    #[test]
    fn concurrent_allocation_is_disjoint() {
        let mut bm: Box<FullBitmap<16>> = Box::new(unsafe { std::mem::zeroed() });
        bm.init(1024, false);
        let bm = Arc::new(bm);
        let claimed: Arc<Vec<AtomicU64>> =
            Arc::new((0..16).map(|_| AtomicU64::new(0)).collect());

        let mut handles = Vec::new();
        for t in 0..8 {
            let bm = bm.clone();
            let claimed = claimed.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = 0;
                while got < 128 {
                    let Some((bit, _)) = bm.allocate(t * 128) else {
                        continue;
                    };
                    let prev = claimed[(bit >> 6) as usize]
                        .fetch_or(1 << (bit & 63), Ordering::SeqCst);
                    assert_eq!(prev & (1 << (bit & 63)), 0, "double allocation of {bit}");
                    got += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bm.num_full(), 1024);
        assert!(bm.allocate(0).is_none());
    }

    #[test]
    fn hierarchical_lock_protocol() {
        let mut hb = HierarchicalBitmap { data: 0 };
        hb.init();
        for i in 0..31 {
            let (bit, locked) = hb.allocate(0).unwrap();
            assert_eq!(bit, i);
            assert!(!locked);
        }
        let (bit, locked) = hb.allocate(0).unwrap();
        assert_eq!(bit, 31);
        assert!(locked, "filling allocation must take the lock");
        // Locked word refuses allocation rather than blocking.
        assert!(hb.allocate(0).is_none());
        hb.unlock();
        let unlocked = hb.mark_not_full(5);
        assert!(unlocked, "full -> not-full transition holds the lock");
        hb.unlock();
        assert_eq!(hb.num_allocated(), 31);
    }
}
