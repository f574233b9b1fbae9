//! Size-bucketed buffer pool for the dialog tracker's entry buffers.
//!
//! Entry buffers are small, bursty and size-clustered: a monitor under
//! load creates thousands of similar-sized records per second and
//! releases most of them within a dialog's lifetime. Serving them from
//! per-size free lists keeps that traffic off the global allocator and
//! makes the total footprint observable and boundable.
//!
//! Buffers round up to 16-byte multiples. Sizes up to 16 KiB are pooled
//! across 1024 buckets (one per 16-byte step); anything larger is
//! allocated and dropped directly. Box ownership stands in for the
//! freed-buffer sentinel of pointer-based designs: a buffer cannot be
//! freed twice because `free` consumes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Allocation granularity in bytes. Every buffer size is a multiple.
pub const BUCKET_STEP: usize = 16;
/// Number of pooled size buckets. Bucket `i` holds buffers of
/// `(i + 1) * BUCKET_STEP` bytes.
pub const BUCKETS: usize = 1024;
/// Largest pooled buffer size.
pub const MAX_POOLED: usize = BUCKETS * BUCKET_STEP;

/// Round a requested size up to the allocation granularity.
/// Zero-length requests still get one step, so every live record owns a
/// real allocation.
#[inline]
pub fn round_up(len: usize) -> usize {
    match len {
        0 => BUCKET_STEP,
        n => (n + BUCKET_STEP - 1) / BUCKET_STEP * BUCKET_STEP,
    }
}

/// Monotonic counters describing pool traffic, in the shape of a
/// point-in-time snapshot. `bytes_in_use` is the one gauge: bytes
/// currently handed out to live records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub bytes_in_use: u64,
    pub allocs: u64,
    pub frees: u64,
    pub failures: u64,
}

/// Per-bucket counters: how many allocations landed in this bucket, and
/// how many were served from the free list (`hits`) versus freshly
/// allocated (`misses`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub allocs: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct BucketCounters {
    allocs: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// The pool itself. Cheap to share behind an `Arc`; all operations take
/// `&self`.
pub struct BufPool {
    shelves: Vec<Mutex<Vec<Box<[u8]>>>>,
    counters: Vec<BucketCounters>,

    bytes_in_use: AtomicU64,
    allocs: AtomicU64,
    frees: AtomicU64,
    failures: AtomicU64,

    /// Byte budget for handed-out buffers. `u64::MAX` means unbounded.
    budget: u64,
}

impl BufPool {
    pub fn new(budget: Option<u64>) -> Self {
        Self {
            shelves: (0..BUCKETS).map(|_| Mutex::new(Vec::new())).collect(),
            counters: (0..BUCKETS).map(|_| BucketCounters::default()).collect(),
            bytes_in_use: AtomicU64::new(0),
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            budget: budget.unwrap_or(u64::MAX),
        }
    }

    /// Obtain a zeroed buffer of at least `len` bytes (rounded up to the
    /// granularity). Returns None when the byte budget would be
    /// exceeded; callers treat that as "drop this record".
    pub fn alloc(&self, len: usize) -> Option<Box<[u8]>> {
        let size = round_up(len);

        // Reserve against the budget first; undo on failure paths.
        let prior = self.bytes_in_use.fetch_add(size as u64, Ordering::AcqRel);
        if prior + size as u64 > self.budget {
            self.bytes_in_use.fetch_sub(size as u64, Ordering::AcqRel);
            self.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.allocs.fetch_add(1, Ordering::Relaxed);

        let bucket = size / BUCKET_STEP - 1;
        if bucket >= BUCKETS {
            // Oversized: not pooled.
            return Some(vec![0u8; size].into_boxed_slice());
        }

        let c = &self.counters[bucket];
        c.allocs.fetch_add(1, Ordering::Relaxed);

        let reused = self.shelves[bucket].lock().unwrap().pop();
        match reused {
            Some(buf) => {
                debug_assert_eq!(buf.len(), size);
                c.hits.fetch_add(1, Ordering::Relaxed);
                Some(buf)
            }
            None => {
                c.misses.fetch_add(1, Ordering::Relaxed);
                Some(vec![0u8; size].into_boxed_slice())
            }
        }
    }

    /// Return a buffer to the pool. The buffer is zeroed before it can
    /// be re-issued, so stale key or attribute bytes never leak into a
    /// recycled record.
    pub fn free(&self, mut buf: Box<[u8]>) {
        let size = buf.len();
        debug_assert!(size > 0 && size % BUCKET_STEP == 0, "foreign buffer");

        self.frees.fetch_add(1, Ordering::Relaxed);
        self.bytes_in_use.fetch_sub(size as u64, Ordering::AcqRel);

        let bucket = size / BUCKET_STEP - 1;
        if bucket >= BUCKETS {
            return; // Oversized buffers just drop.
        }

        buf.fill(0);
        self.shelves[bucket].lock().unwrap().push(buf);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            bytes_in_use: self.bytes_in_use.load(Ordering::Acquire),
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn bucket_stats(&self, bucket: usize) -> BucketStats {
        let c = &self.counters[bucket];
        BucketStats {
            allocs: c.allocs.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
        }
    }

    /// Histogram of allocation counts over all buckets that saw traffic,
    /// as (bucket size in bytes, counters) pairs.
    pub fn histogram(&self) -> Vec<(usize, BucketStats)> {
        (0..BUCKETS)
            .filter_map(|b| {
                let s = self.bucket_stats(b);
                (s.allocs != 0).then(|| ((b + 1) * BUCKET_STEP, s))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), 16);
        assert_eq!(round_up(1), 16);
        assert_eq!(round_up(16), 16);
        assert_eq!(round_up(17), 32);
        assert_eq!(round_up(16 * 1024), 16 * 1024);
    }

    #[test]
    fn test_reuse_and_zeroing() {
        let pool = BufPool::new(None);

        let mut a = pool.alloc(50).unwrap();
        assert_eq!(a.len(), 64);
        a[0] = 0xAA;
        a[63] = 0xBB;
        pool.free(a);

        // The recycled buffer comes back from the same bucket, zeroed.
        let b = pool.alloc(60).unwrap();
        assert_eq!(b.len(), 64);
        assert!(b.iter().all(|&x| x == 0));

        let s = pool.bucket_stats(64 / BUCKET_STEP - 1);
        assert_eq!(s.allocs, 2);
        assert_eq!(s.misses, 1);
        assert_eq!(s.hits, 1);
    }

    #[test]
    fn test_budget() {
        let pool = BufPool::new(Some(128));

        let a = pool.alloc(64).unwrap();
        let b = pool.alloc(64).unwrap();
        assert!(pool.alloc(16).is_none());
        assert_eq!(pool.stats().failures, 1);

        pool.free(a);
        assert!(pool.alloc(16).is_some());
        pool.free(b);
    }

    #[test]
    fn test_oversized_not_pooled() {
        let pool = BufPool::new(None);
        let big = pool.alloc(MAX_POOLED + 1).unwrap();
        assert_eq!(big.len(), MAX_POOLED + BUCKET_STEP);
        pool.free(big);

        // Nothing was shelved for an oversized buffer.
        assert_eq!(pool.stats().bytes_in_use, 0);
        assert_eq!(pool.histogram().len(), 0);
    }

    #[test]
    fn test_churn() {
        use rand::{rngs::SmallRng, Rng, SeedableRng};

        let pool = BufPool::new(None);
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut held: Vec<Box<[u8]>> = Vec::new();

        for _ in 0..10_000 {
            if held.len() > 64 || (!held.is_empty() && rng.gen_bool(0.5)) {
                let i = rng.gen_range(0..held.len());
                pool.free(held.swap_remove(i));
            } else {
                held.push(pool.alloc(rng.gen_range(1..512)).unwrap());
            }
        }
        for b in held {
            pool.free(b);
        }

        let s = pool.stats();
        assert_eq!(s.bytes_in_use, 0);
        assert_eq!(s.allocs, s.frees);
        // Steady-state churn is mostly pool hits.
        let (hits, misses) = pool
            .histogram()
            .iter()
            .fold((0, 0), |(h, m), (_, b)| (h + b.hits, m + b.misses));
        assert!(hits > misses);
    }

    #[test]
    fn test_stats_balance() {
        let pool = BufPool::new(None);
        let sizes = [8usize, 24, 24, 100, 1000, 16 * 1024];
        let bufs: Vec<_> = sizes.iter().map(|&s| pool.alloc(s).unwrap()).collect();

        let in_use: u64 = sizes.iter().map(|&s| round_up(s) as u64).sum();
        assert_eq!(pool.stats().bytes_in_use, in_use);
        assert_eq!(pool.stats().allocs, sizes.len() as u64);

        for b in bufs {
            pool.free(b);
        }
        let s = pool.stats();
        assert_eq!(s.bytes_in_use, 0);
        assert_eq!(s.frees, sizes.len() as u64);
        assert_eq!(s.failures, 0);
    }
}
