//! Segregated free lists.
//!
//! Each bucket is an intrusive doubly-linked list threaded through the
//! payload of its free blocks:
//!
//! ```text
//!   bp + 0      bp + 4
//!  +-----------+-----------+----- ... -----+--------+
//!  | prev link | next link |               | footer |
//!  +-----------+-----------+----- ... -----+--------+
//! ```
//!
//! Links are one word wide and hold `bp - BASE`, where `BASE` is the payload
//! offset of the prologue. The prologue is never free, so a link of 0 doubles
//! as the end-of-list sentinel. Lists are LIFO: inserts go to the head.

use crate::block::{self, DSIZE, WSIZE};
use crate::size_class::{NUM_BUCKETS, bucket_index};

/// Payload offset of the prologue block; links are relative to it.
pub(crate) const BASE: usize = DSIZE;

/// Link value of the sentinel.
pub(crate) const NIL: u32 = 0;

pub(crate) fn to_link(bp: usize) -> u32 {
    (bp - BASE) as u32
}

pub(crate) fn from_link(link: u32) -> usize {
    link as usize + BASE
}

pub(crate) fn prev_link(heap: &[u8], bp: usize) -> u32 {
    block::read_word(heap, bp)
}

pub(crate) fn next_link(heap: &[u8], bp: usize) -> u32 {
    block::read_word(heap, bp + WSIZE)
}

fn set_prev_link(heap: &mut [u8], bp: usize, link: u32) {
    block::write_word(heap, bp, link);
}

fn set_next_link(heap: &mut [u8], bp: usize, link: u32) {
    block::write_word(heap, bp + WSIZE, link);
}

/// Bucket heads, one link per size class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FreeLists {
    roots: [u32; NUM_BUCKETS],
}

impl FreeLists {
    pub fn new() -> Self {
        Self {
            roots: [NIL; NUM_BUCKETS],
        }
    }

    /// Raw head link of `bucket` (`NIL` when empty).
    pub fn root(&self, bucket: usize) -> u32 {
        self.roots[bucket]
    }

    #[cfg(test)]
    pub fn head(&self, bucket: usize) -> Option<usize> {
        match self.roots[bucket] {
            NIL => None,
            link => Some(from_link(link)),
        }
    }

    /// Pushes the free block `bp` of `size` bytes onto its bucket.
    pub fn insert(&mut self, heap: &mut [u8], bp: usize, size: usize) {
        let bucket = bucket_index(size);
        let head = self.roots[bucket];
        set_prev_link(heap, bp, NIL);
        set_next_link(heap, bp, head);
        if head != NIL {
            set_prev_link(heap, from_link(head), to_link(bp));
        }
        self.roots[bucket] = to_link(bp);
    }

    /// Unlinks `bp` from the bucket for `size`. `size` must be the size the
    /// block was inserted with.
    pub fn remove(&mut self, heap: &mut [u8], bp: usize, size: usize) {
        let bucket = bucket_index(size);
        let prev = prev_link(heap, bp);
        let next = next_link(heap, bp);
        match (prev, next) {
            (NIL, NIL) => self.roots[bucket] = NIL,
            (NIL, next) => {
                self.roots[bucket] = next;
                set_prev_link(heap, from_link(next), NIL);
            }
            (prev, NIL) => set_next_link(heap, from_link(prev), NIL),
            (prev, next) => {
                set_next_link(heap, from_link(prev), next);
                set_prev_link(heap, from_link(next), prev);
            }
        }
    }

    /// First block able to hold `asize` bytes, scanning from the request's
    /// own size class upward.
    pub fn find_fit(&self, heap: &[u8], asize: usize) -> Option<usize> {
        (bucket_index(asize)..NUM_BUCKETS)
            .flat_map(|bucket| self.iter(heap, bucket))
            .find(|&bp| block::header(heap, bp).size >= asize)
    }

    /// Walks `bucket` head to tail. Assumes the list is well formed; the
    /// validator walks lists on its own with cycle and bounds guards.
    pub fn iter<'a>(&self, heap: &'a [u8], bucket: usize) -> FreeListIter<'a> {
        FreeListIter {
            heap,
            cursor: self.roots[bucket],
        }
    }
}

pub(crate) struct FreeListIter<'a> {
    heap: &'a [u8],
    cursor: u32,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cursor == NIL {
            return None;
        }
        let bp = from_link(self.cursor);
        self.cursor = next_link(self.heap, bp);
        Some(bp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, set_footer, set_header};

    fn heap_with_free_blocks(blocks: &[(usize, usize)]) -> Vec<u8> {
        let mut heap = vec![0u8; 8192];
        for &(bp, size) in blocks {
            set_header(&mut heap, bp, BlockHeader::free(size, true));
            set_footer(&mut heap, bp, size);
        }
        heap
    }

    fn collect(lists: &FreeLists, heap: &[u8], bucket: usize) -> Vec<usize> {
        lists.iter(heap, bucket).collect()
    }

    #[test]
    fn links_are_relative_to_base() {
        assert_eq!(to_link(BASE), NIL);
        assert_eq!(to_link(24), 16);
        assert_eq!(from_link(16), 24);
    }

    #[test]
    fn insert_is_lifo_within_bucket() {
        let mut heap = heap_with_free_blocks(&[(16, 32), (64, 32), (128, 32)]);
        let mut lists = FreeLists::new();
        lists.insert(&mut heap, 16, 32);
        lists.insert(&mut heap, 64, 32);
        lists.insert(&mut heap, 128, 32);
        assert_eq!(collect(&lists, &heap, 1), vec![128, 64, 16]);
        assert_eq!(lists.head(1), Some(128));
        assert_eq!(prev_link(&heap, 128), NIL);
        assert_eq!(prev_link(&heap, 64), to_link(128));
        assert_eq!(next_link(&heap, 16), NIL);
    }

    #[test]
    fn remove_handles_head_tail_interior_and_singleton() {
        let mut heap = heap_with_free_blocks(&[(16, 32), (64, 32), (128, 32), (256, 32)]);
        let mut lists = FreeLists::new();
        for bp in [16, 64, 128, 256] {
            lists.insert(&mut heap, bp, 32);
        }
        // 256 -> 128 -> 64 -> 16
        lists.remove(&mut heap, 128, 32);
        assert_eq!(collect(&lists, &heap, 1), vec![256, 64, 16]);
        assert_eq!(prev_link(&heap, 64), to_link(256));

        lists.remove(&mut heap, 256, 32);
        assert_eq!(collect(&lists, &heap, 1), vec![64, 16]);
        assert_eq!(prev_link(&heap, 64), NIL);

        lists.remove(&mut heap, 16, 32);
        assert_eq!(collect(&lists, &heap, 1), vec![64]);
        assert_eq!(next_link(&heap, 64), NIL);

        lists.remove(&mut heap, 64, 32);
        assert!(collect(&lists, &heap, 1).is_empty());
        assert_eq!(lists.root(1), NIL);
    }

    #[test]
    fn buckets_are_independent() {
        let mut heap = heap_with_free_blocks(&[(16, 16), (64, 48), (256, 5000)]);
        let mut lists = FreeLists::new();
        lists.insert(&mut heap, 16, 16);
        lists.insert(&mut heap, 64, 48);
        lists.insert(&mut heap, 256, 5000);
        assert_eq!(collect(&lists, &heap, 0), vec![16]);
        assert_eq!(collect(&lists, &heap, 2), vec![64]);
        assert_eq!(collect(&lists, &heap, 9), vec![256]);
        assert!(collect(&lists, &heap, 1).is_empty());
    }

    #[test]
    fn find_fit_is_first_fit_within_class_then_climbs() {
        let mut heap = heap_with_free_blocks(&[(16, 40), (128, 64), (512, 200)]);
        let mut lists = FreeLists::new();
        lists.insert(&mut heap, 128, 64);
        lists.insert(&mut heap, 16, 40);
        lists.insert(&mut heap, 512, 200);

        // Bucket 2 (33..=64) holds 40 (head) then 64.
        assert_eq!(lists.find_fit(&heap, 40), Some(16));
        assert_eq!(lists.find_fit(&heap, 48), Some(128));
        // Nothing in bucket 3; climbs to 200 in bucket 4.
        assert_eq!(lists.find_fit(&heap, 72), Some(512));
        assert_eq!(lists.find_fit(&heap, 24), Some(16));
        assert_eq!(lists.find_fit(&heap, 208), None);
    }

    #[test]
    fn find_fit_skips_smaller_classes() {
        let mut heap = heap_with_free_blocks(&[(16, 16), (64, 104)]);
        let mut lists = FreeLists::new();
        lists.insert(&mut heap, 16, 16);
        lists.insert(&mut heap, 64, 104);
        assert_eq!(lists.find_fit(&heap, 96), Some(64));
        assert_eq!(lists.find_fit(&heap, 16), Some(16));
    }
}
