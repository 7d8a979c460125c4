//! Size-class index.
//!
//! Free blocks are segregated into [`NUM_BUCKETS`] lists by power-of-two
//! upper bounds: `<=16, <=32, ..., <=4096` and a catch-all for anything
//! larger.

use crate::block::MIN_BLOCK_SIZE;

/// Number of segregated free lists.
pub const NUM_BUCKETS: usize = 10;

/// Inclusive upper bound of each bounded bucket. The last bucket has none.
const BUCKET_LIMITS: [usize; NUM_BUCKETS - 1] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Maps a block size to the bucket that owns it.
#[must_use]
pub fn bucket_index(size: usize) -> usize {
    BUCKET_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(NUM_BUCKETS - 1)
}

/// Inclusive size range held by `bucket`: `(min, max)`; `max` is `None` for
/// the catch-all bucket.
#[must_use]
pub fn bucket_bounds(bucket: usize) -> (usize, Option<usize>) {
    let min = if bucket == 0 {
        MIN_BLOCK_SIZE
    } else {
        BUCKET_LIMITS[bucket - 1] + 1
    };
    (min, BUCKET_LIMITS.get(bucket).copied())
}

/// Whether a block of `size` bytes belongs on `bucket`'s list.
#[must_use]
pub fn bucket_holds(bucket: usize, size: usize) -> bool {
    bucket < NUM_BUCKETS && bucket_index(size) == bucket
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_inclusive() {
        assert_eq!(bucket_index(16), 0);
        assert_eq!(bucket_index(17), 1);
        assert_eq!(bucket_index(32), 1);
        assert_eq!(bucket_index(33), 2);
        assert_eq!(bucket_index(4096), 8);
        assert_eq!(bucket_index(4097), 9);
        assert_eq!(bucket_index(usize::MAX), 9);
    }

    #[test]
    fn index_is_monotonic() {
        let mut last = 0;
        for size in (MIN_BLOCK_SIZE..=16_384).step_by(8) {
            let bucket = bucket_index(size);
            assert!(bucket >= last, "bucket went backwards at size {size}");
            assert!(bucket < NUM_BUCKETS);
            last = bucket;
        }
        assert_eq!(last, NUM_BUCKETS - 1);
    }

    #[test]
    fn bounds_agree_with_index() {
        for bucket in 0..NUM_BUCKETS {
            let (min, max) = bucket_bounds(bucket);
            assert_eq!(bucket_index(min), bucket);
            if let Some(max) = max {
                assert_eq!(bucket_index(max), bucket);
                assert_eq!(bucket_index(max + 1), bucket + 1);
            }
        }
        assert_eq!(bucket_bounds(0), (16, Some(16)));
        assert_eq!(bucket_bounds(9), (4097, None));
    }

    #[test]
    fn bucket_holds_rejects_foreign_sizes() {
        assert!(bucket_holds(3, 128));
        assert!(!bucket_holds(3, 136));
        assert!(!bucket_holds(NUM_BUCKETS, 16));
    }
}
