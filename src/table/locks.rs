//! Stripe locks and the resize generation counter
//!
//! Bucket `b` is guarded by stripe `b % CONNTRACK_LOCKS`. Writers take the
//! resize lock shared, then their stripes in ascending order, then compare
//! the generation they started from. A resize takes the resize lock
//! exclusively plus every stripe, and keeps the generation odd while it
//! rebuilds the bucket array.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of stripe locks
pub const CONNTRACK_LOCKS: usize = 1024;

/// Stripe lock set with a seqcount-style generation
#[derive(Debug)]
pub struct StripeLocks {
    stripes: Box<[Mutex<()>]>,
    resize: RwLock<()>,
    generation: AtomicU64,
}

/// One or two stripes held for a bucket pair
#[must_use]
pub struct PairGuard<'a> {
    _resize: RwLockReadGuard<'a, ()>,
    _first: MutexGuard<'a, ()>,
    _second: Option<MutexGuard<'a, ()>>,
}

/// Exclusive hold on the whole table
#[must_use]
pub struct AllGuard<'a> {
    _stripes: Vec<MutexGuard<'a, ()>>,
    _resize: RwLockWriteGuard<'a, ()>,
}

impl StripeLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stripes: (0..CONNTRACK_LOCKS).map(|_| Mutex::new(())).collect(),
            resize: RwLock::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Stripe guarding a bucket
    #[inline]
    #[must_use]
    pub const fn stripe_of(bucket: usize) -> usize {
        bucket % CONNTRACK_LOCKS
    }

    /// Current generation; odd while a resize is in progress
    #[inline]
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wait for an even generation and return it
    #[must_use]
    pub fn read_begin(&self) -> u64 {
        loop {
            let generation = self.generation.load(Ordering::Acquire);
            if generation & 1 == 0 {
                return generation;
            }
            hint::spin_loop();
        }
    }

    /// A resize started or finished since `start`
    #[inline]
    #[must_use]
    pub fn read_retry(&self, start: u64) -> bool {
        self.generation.load(Ordering::Acquire) != start
    }

    /// Lock the stripes of two buckets, lower stripe first
    ///
    /// Returns `None` when a resize happened since `start`; the caller must
    /// recompute its buckets and try again.
    pub fn lock_two(&self, a: usize, b: usize, start: u64) -> Option<PairGuard<'_>> {
        let resize = self.resize.read();
        let (lo, hi) = {
            let (sa, sb) = (Self::stripe_of(a), Self::stripe_of(b));
            if sa <= sb {
                (sa, sb)
            } else {
                (sb, sa)
            }
        };
        let first = self.stripes[lo].lock();
        let second = (lo != hi).then(|| self.stripes[hi].lock());

        if self.read_retry(start) {
            return None;
        }
        Some(PairGuard {
            _resize: resize,
            _first: first,
            _second: second,
        })
    }

    /// Lock a single bucket's stripe
    pub fn lock_one(&self, bucket: usize, start: u64) -> Option<PairGuard<'_>> {
        self.lock_two(bucket, bucket, start)
    }

    /// Lock every stripe and open a write section on the generation
    ///
    /// The generation is odd until [`StripeLocks::end_write`] runs.
    pub fn lock_all(&self) -> AllGuard<'_> {
        let resize = self.resize.write();
        let stripes = self.stripes.iter().map(Mutex::lock).collect();
        self.generation.fetch_add(1, Ordering::AcqRel);
        AllGuard {
            _stripes: stripes,
            _resize: resize,
        }
    }

    /// Close the write section opened by [`StripeLocks::lock_all`]
    pub fn end_write(&self, guard: AllGuard<'_>) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(guard);
    }
}

impl Default for StripeLocks {
    fn default() -> Self {
        Self::new()
    }
}
