//! Futex-style waiting on single bits of shared atomic words.
//!
//! Objects in the cache carry their state as packed bits of one `AtomicU64`.
//! Some of those bits double as locks or as conditions another thread needs
//! to sleep on, and carrying a full mutex/condvar pair per object (let alone
//! per bit) would dwarf the objects themselves. Instead, waiters hash the
//! word's address and the bit index into a small static table of buckets and
//! sleep on the bucket; wakers touch the same bucket. Unrelated bits may
//! share a bucket and eat a spurious wakeup, which is harmless because every
//! waiter rechecks its bit.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

const BUCKET_COUNT: usize = 64;

struct Bucket {
    lock: Mutex<()>,
    waiters: Condvar,
}

static BUCKETS: [Bucket; BUCKET_COUNT] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const B: Bucket = Bucket {
        lock: Mutex::new(()),
        waiters: Condvar::new(),
    };
    [B; BUCKET_COUNT]
};

fn bucket_for(word: &AtomicU64, mask: u64) -> &'static Bucket {
    let addr = word as *const AtomicU64 as usize;
    // Low pointer bits are all zero for an aligned word; fold in the bit
    // index so two bits of one word land on distinct buckets.
    let hash = (addr >> 3) ^ (mask.trailing_zeros() as usize).wrapping_mul(0x9e37);
    &BUCKETS[hash % BUCKET_COUNT]
}

/// Blocks until `mask`'s bit in `word` is observed clear.
///
/// The waker must clear the bit and then call [`wake_bit`] on the same
/// word/mask pair.
pub fn wait_on_bit(word: &AtomicU64, mask: u64) {
    wait_on_bit_with(word, mask, || {});
}

/// [`wait_on_bit`] with a relax hook invoked once before each sleep.
///
/// The cache uses the hook to kick the backing device's queue so that the
/// I/O holding the bit can finish.
pub fn wait_on_bit_with(word: &AtomicU64, mask: u64, mut relax: impl FnMut()) {
    let bucket = bucket_for(word, mask);
    loop {
        if word.load(Ordering::Acquire) & mask == 0 {
            return;
        }
        relax();
        let mut guard = bucket.lock.lock();
        // Re-check under the bucket lock: a waker clears the bit first and
        // then takes this lock to notify, so either we observe the clear
        // here or the notify happens after we are queued on the condvar.
        if word.load(Ordering::Acquire) & mask == 0 {
            return;
        }
        bucket.waiters.wait(&mut guard);
    }
}

/// Wakes every thread sleeping on `mask`'s bit of `word`.
///
/// Call after clearing the bit. Waking without clearing is allowed and only
/// costs the waiters a recheck.
pub fn wake_bit(word: &AtomicU64, mask: u64) {
    let bucket = bucket_for(word, mask);
    let _guard = bucket.lock.lock();
    bucket.waiters.notify_all();
}

/// Acquires `mask`'s bit of `word` as a sleeping lock.
pub fn lock_bit(word: &AtomicU64, mask: u64) {
    lock_bit_with(word, mask, || {});
}

/// [`lock_bit`] with a relax hook, see [`wait_on_bit_with`].
pub fn lock_bit_with(word: &AtomicU64, mask: u64, mut relax: impl FnMut()) {
    loop {
        if try_lock_bit(word, mask) {
            return;
        }
        wait_on_bit_with(word, mask, &mut relax);
    }
}

/// Single acquire attempt; true on success.
pub fn try_lock_bit(word: &AtomicU64, mask: u64) -> bool {
    word.fetch_or(mask, Ordering::AcqRel) & mask == 0
}

/// Releases a bit taken with [`lock_bit`]/[`try_lock_bit`] and wakes
/// waiters.
pub fn unlock_bit(word: &AtomicU64, mask: u64) {
    word.fetch_and(!mask, Ordering::Release);
    wake_bit(word, mask);
}

/// Spinning acquisition of a bit, for sections bounded to a handful of
/// loads and stores. Never sleeps and never wakes; pair only with other
/// spinning holders of the same bit.
pub struct BitSpinGuard<'a> {
    word: &'a AtomicU64,
    mask: u64,
}

pub fn bit_spin_lock(word: &AtomicU64, mask: u64) -> BitSpinGuard<'_> {
    while word.fetch_or(mask, Ordering::AcqRel) & mask != 0 {
        while word.load(Ordering::Relaxed) & mask != 0 {
            std::hint::spin_loop();
        }
    }
    BitSpinGuard { word, mask }
}

impl Drop for BitSpinGuard<'_> {
    fn drop(&mut self) {
        self.word.fetch_and(!self.mask, Ordering::Release);
    }
}
