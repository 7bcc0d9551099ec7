//! Epoch-based shared/exclusive locking with deferred reclamation.
//!
//! Readers take a shared epoch before dereferencing any region offset; a
//! piece of memory retired with [`GcLock::defer`] is only reclaimed once
//! every reader that could have observed it has left its epoch. Writers
//! never wait for readers; only [`GcLock::lock_exclusive`] (used for
//! relocating resizes) and [`GcLock::defer_barrier`] drain them.
//!
//! Shared acquisition is two atomic operations on the fast path. Thread
//! re-entrancy is tracked in a thread-local table so nested pins of the same
//! lock don't touch the shared counters.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

type Deferred = Box<dyn FnOnce() + Send>;

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static HELD: RefCell<HashMap<usize, Held>> = RefCell::new(HashMap::new());
}

#[derive(Clone, Copy)]
struct Held {
    depth: u32,
    parity: usize,
}

struct Pending {
    lists: [Vec<Deferred>; 2],
}

pub struct GcLock {
    id: usize,
    /// Monotonic epoch; `epoch & 1` selects the parity new readers join.
    epoch: AtomicU64,
    /// In-flight readers per epoch parity.
    readers: [AtomicU64; 2],
    exclusive: AtomicBool,
    /// Threads blocked in `wait_while`; readers only touch the mutex on
    /// their unlock path when this is non-zero.
    waiters: AtomicUsize,
    pending: Mutex<Pending>,
    cond: Condvar,
}

impl Default for GcLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GcLock {
    pub fn new() -> Self {
        GcLock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            epoch: AtomicU64::new(0),
            readers: [AtomicU64::new(0), AtomicU64::new(0)],
            exclusive: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            pending: Mutex::new(Pending {
                lists: [Vec::new(), Vec::new()],
            }),
            cond: Condvar::new(),
        }
    }

    /// Enter a shared epoch. Re-entrant within one thread.
    pub fn lock_shared(&self) {
        let already = HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(held) = h.get_mut(&self.id) {
                held.depth += 1;
                true
            } else {
                false
            }
        });
        if already {
            return;
        }

        loop {
            if self.exclusive.load(Ordering::SeqCst) {
                self.wait_until(|| !self.exclusive.load(Ordering::SeqCst));
            }
            let parity = (self.epoch.load(Ordering::SeqCst) & 1) as usize;
            self.readers[parity].fetch_add(1, Ordering::SeqCst);
            // Order the increment before everything the reader goes on to
            // load; pairs with the fence in run_expired.
            std::sync::atomic::fence(Ordering::SeqCst);
            if self.exclusive.load(Ordering::SeqCst) {
                // Raced with an exclusive acquisition; back out and retry.
                if self.readers[parity].fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.notify_waiters();
                }
                continue;
            }
            HELD.with(|h| {
                h.borrow_mut().insert(self.id, Held { depth: 1, parity });
            });
            return;
        }
    }

    /// Leave the shared epoch. The last reader of a retired parity runs its
    /// deferred reclamations.
    pub fn unlock_shared(&self) {
        let release = HELD.with(|h| {
            let mut h = h.borrow_mut();
            let held = h.get_mut(&self.id).expect("unlock_shared without lock");
            held.depth -= 1;
            if held.depth == 0 {
                let parity = held.parity;
                h.remove(&self.id);
                Some(parity)
            } else {
                None
            }
        });
        let Some(parity) = release else { return };
        if self.readers[parity].fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify_waiters();
            self.run_expired();
        }
    }

    /// Wake blocked waiters. Takes the mutex so the wake can't slip between
    /// a waiter's predicate check and its sleep.
    fn notify_waiters(&self) {
        if self.waiters.load(Ordering::SeqCst) != 0 {
            let _guard = self.pending.lock().unwrap();
            self.cond.notify_all();
        }
    }

    fn wait_until<F: Fn() -> bool>(&self, done: F) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.pending.lock().unwrap();
        let _unused = self.cond.wait_while(guard, |_| !done()).unwrap();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of times the calling thread holds this lock shared.
    pub fn is_locked_shared(&self) -> u32 {
        HELD.with(|h| h.borrow().get(&self.id).map_or(0, |held| held.depth))
    }

    /// Drop every shared hold the calling thread has on this lock,
    /// returning how many there were. Used before escalating to an
    /// exclusive resize.
    pub fn force_unlock(&self) -> u32 {
        let release = HELD.with(|h| h.borrow_mut().remove(&self.id));
        let Some(held) = release else { return 0 };
        if self.readers[held.parity].fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify_waiters();
            self.run_expired();
        }
        held.depth
    }

    /// Run whatever is runnable and advance the epoch when legal.
    ///
    /// The epoch only advances when the retired generation has fully
    /// drained (no readers, no pending work), so a reader is never more
    /// than one generation behind the active one. That is what makes it
    /// sound for a reader of generation N to keep dereferencing structure
    /// shared with anything retired in generation N+1: that structure
    /// cannot be freed until generation N itself drains.
    fn run_expired(&self) {
        let taken = {
            let mut guard = self.pending.lock().unwrap();
            // Pairs with the fence in lock_shared: a reader whose pin we
            // fail to observe here is guaranteed to observe every root
            // published before its pin, so it can't be holding retired
            // structure.
            std::sync::atomic::fence(Ordering::SeqCst);
            let epoch = self.epoch.load(Ordering::SeqCst);
            let active = (epoch & 1) as usize;
            let retired = 1 - active;
            let mut out = Vec::new();
            if self.readers[retired].load(Ordering::SeqCst) == 0 {
                out.append(&mut guard.lists[retired]);
                // Retired side is clear: let the active generation retire
                // so its items become runnable once its readers leave.
                if !guard.lists[active].is_empty() {
                    self.epoch.store(epoch + 1, Ordering::SeqCst);
                    if self.readers[active].load(Ordering::SeqCst) == 0 {
                        out.append(&mut guard.lists[active]);
                    }
                }
            }
            out
        };
        for f in taken {
            f();
        }
    }

    /// Schedule `f` to run once all readers currently in their epoch have
    /// left. Never runs `f` synchronously while a conflicting reader is
    /// pinned; may run it on an arbitrary later unlocking thread.
    pub fn defer(&self, f: Deferred) {
        {
            let mut guard = self.pending.lock().unwrap();
            let epoch = self.epoch.load(Ordering::SeqCst);
            let active = (epoch & 1) as usize;
            guard.lists[active].push(f);
        }
        self.run_expired();
    }

    /// Wait until every deferred reclamation visible at the time of the call
    /// has run. Must not be called while holding the lock shared.
    pub fn defer_barrier(&self) {
        assert_eq!(
            self.is_locked_shared(),
            0,
            "defer_barrier would deadlock on own shared lock"
        );
        loop {
            self.run_expired();
            let retired = {
                let guard = self.pending.lock().unwrap();
                if guard.lists[0].is_empty() && guard.lists[1].is_empty() {
                    return;
                }
                drop(guard);
                1 - (self.epoch.load(Ordering::SeqCst) & 1) as usize
            };
            // Wait for the retired generation to drain, then try again.
            self.wait_until(|| self.readers[retired].load(Ordering::SeqCst) == 0);
        }
    }

    /// Take the lock exclusively: block new readers and wait for current
    /// ones to drain. Used for relocating resizes.
    pub fn lock_exclusive(&self) {
        assert_eq!(
            self.is_locked_shared(),
            0,
            "exclusive acquisition while holding shared would deadlock"
        );
        loop {
            if self
                .exclusive
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
            self.wait_until(|| !self.exclusive.load(Ordering::SeqCst));
        }
        self.wait_until(|| {
            self.readers[0].load(Ordering::SeqCst) == 0
                && self.readers[1].load(Ordering::SeqCst) == 0
        });
    }

    pub fn unlock_exclusive(&self) {
        let was = self.exclusive.swap(false, Ordering::SeqCst);
        assert!(was, "unlock_exclusive without exclusive lock");
        let _guard = self.pending.lock().unwrap();
        self.cond.notify_all();
    }

    /// Scoped shared guard.
    pub fn shared(&self) -> SharedGuard<'_> {
        self.lock_shared();
        SharedGuard { lock: self }
    }

    /// Scoped exclusive guard.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        self.lock_exclusive();
        ExclusiveGuard { lock: self }
    }
}

pub struct SharedGuard<'a> {
    lock: &'a GcLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

pub struct ExclusiveGuard<'a> {
    lock: &'a GcLock,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn reentrant_shared() {
        let lock = GcLock::new();
        lock.lock_shared();
        lock.lock_shared();
        assert_eq!(lock.is_locked_shared(), 2);
        lock.unlock_shared();
        assert_eq!(lock.is_locked_shared(), 1);
        lock.unlock_shared();
        assert_eq!(lock.is_locked_shared(), 0);
    }

    #[test]
    fn defer_waits_for_reader() {
        let lock = Arc::new(GcLock::new());
        let ran = Arc::new(AtomicBool::new(false));

        lock.lock_shared();
        {
            let ran = ran.clone();
            lock.defer(Box::new(move || ran.store(true, Ordering::SeqCst)));
        }
        assert!(!ran.load(Ordering::SeqCst), "deferred ran under a pinned reader");
        lock.unlock_shared();

        let l2 = lock.clone();
        std::thread::spawn(move || l2.defer_barrier()).join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn exclusive_drains_readers() {
        let lock = Arc::new(GcLock::new());
        lock.lock_shared();
        let l2 = lock.clone();
        let flag = Arc::new(AtomicBool::new(false));
        let f2 = flag.clone();
        let h = std::thread::spawn(move || {
            l2.lock_exclusive();
            f2.store(true, Ordering::SeqCst);
            l2.unlock_exclusive();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!flag.load(Ordering::SeqCst), "exclusive acquired with a reader pinned");
        lock.unlock_shared();
        h.join().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn force_unlock_reports_depth() {
        let lock = GcLock::new();
        lock.lock_shared();
        lock.lock_shared();
        assert_eq!(lock.force_unlock(), 2);
        assert_eq!(lock.is_locked_shared(), 0);
        assert_eq!(lock.force_unlock(), 0);
    }
}
