//! Heap validator.
//!
//! Walks the block chain from the first real block to the epilogue, then
//! every bucket's free list, and reports each broken invariant as a
//! [`HeapViolation`]. It never mutates the heap and never aborts; the caller
//! decides what a failing report means.

use serde::Serialize;

use crate::arena::MAX_ARENA_SIZE;
use crate::block::{self, BlockHeader, DSIZE, MIN_BLOCK_SIZE, WSIZE, is_aligned};
use crate::error::{HeapCheckError, HeapViolation};
use crate::free_list::{BASE, FreeLists, NIL, from_link, next_link, prev_link};
use crate::size_class::{NUM_BUCKETS, bucket_bounds, bucket_holds};

/// Payload offset of the first block after the prologue.
pub(crate) const FIRST_BLOCK: usize = BASE + DSIZE;

/// Outcome of one validator pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapReport {
    /// Arena break at the time of the check.
    pub heap_size: usize,
    /// Blocks between prologue and epilogue.
    pub blocks: usize,
    /// Free blocks seen by the heap walk.
    pub free_blocks: usize,
    /// Nodes seen across all free lists.
    pub free_list_entries: usize,
    pub violations: Vec<HeapViolation>,
}

impl HeapReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(self) -> Result<Self, HeapCheckError> {
        match self.violations.first().cloned() {
            None => Ok(self),
            Some(first) => Err(HeapCheckError {
                count: self.violations.len(),
                first,
                report: self,
            }),
        }
    }
}

pub(crate) fn check_heap(heap: &[u8], lists: &FreeLists) -> HeapReport {
    let mut report = HeapReport {
        heap_size: heap.len(),
        blocks: 0,
        free_blocks: 0,
        free_list_entries: 0,
        violations: Vec::new(),
    };

    let prologue = BlockHeader::new(DSIZE, true, true);
    if heap.len() < FIRST_BLOCK
        || block::header(heap, BASE) != prologue
        || block::read_word(heap, BASE) != prologue.encode()
    {
        report.violations.push(HeapViolation::BadPrologue);
        return report;
    }
    if heap.len() > MAX_ARENA_SIZE {
        report.violations.push(HeapViolation::HeapTooLarge { span: heap.len() });
    }

    walk_blocks(heap, &mut report);
    walk_lists(heap, lists, &mut report);

    if report.free_list_entries != report.free_blocks {
        report.violations.push(HeapViolation::FreeCountMismatch {
            in_heap: report.free_blocks,
            in_lists: report.free_list_entries,
        });
    }
    report
}

fn walk_blocks(heap: &[u8], report: &mut HeapReport) {
    let brk = heap.len();
    let mut bp = FIRST_BLOCK;
    let mut prev_allocated = true;
    let mut prev_bp = BASE;

    loop {
        if bp > brk {
            report
                .violations
                .push(HeapViolation::BadEpilogue { offset: bp, brk });
            return;
        }
        if !is_aligned(bp) {
            report.violations.push(HeapViolation::Misaligned { offset: bp });
            return;
        }
        let hdr = block::header(heap, bp);
        if hdr.prev_allocated != prev_allocated {
            report.violations.push(HeapViolation::StalePrevAllocated {
                offset: bp,
                recorded: hdr.prev_allocated,
                actual: prev_allocated,
            });
        }

        if hdr.size == 0 {
            if bp != brk || !hdr.allocated {
                report
                    .violations
                    .push(HeapViolation::BadEpilogue { offset: bp, brk });
            }
            return;
        }
        if hdr.size < MIN_BLOCK_SIZE {
            report.violations.push(HeapViolation::Undersized {
                offset: bp,
                size: hdr.size,
            });
            return;
        }
        // The block must end at or before the epilogue header.
        if bp + hdr.size > brk {
            report.violations.push(HeapViolation::OutOfBounds {
                offset: bp,
                size: hdr.size,
                lo: FIRST_BLOCK - WSIZE,
                hi: brk - WSIZE,
            });
            return;
        }

        report.blocks += 1;
        if !hdr.allocated {
            report.free_blocks += 1;
            let footer = block::footer(heap, bp);
            if footer.size != hdr.size || footer.allocated {
                report.violations.push(HeapViolation::FooterMismatch {
                    offset: bp,
                    header: hdr.size,
                    footer: footer.size,
                });
            }
            if !prev_allocated {
                report.violations.push(HeapViolation::Uncoalesced {
                    offset: prev_bp,
                    next: bp,
                });
            }
        }

        prev_allocated = hdr.allocated;
        prev_bp = bp;
        bp += hdr.size;
    }
}

fn walk_lists(heap: &[u8], lists: &FreeLists, report: &mut HeapReport) {
    let brk = heap.len();
    // A list can never hold more nodes than there are blocks.
    let max_nodes = report.blocks;

    for bucket in 0..NUM_BUCKETS {
        let mut link = lists.root(bucket);
        let mut expected_prev = NIL;
        let mut holder = BASE;
        let mut nodes = 0;

        while link != NIL {
            let bp = from_link(link);
            if bp < FIRST_BLOCK || !is_aligned(bp) || bp + DSIZE > brk {
                report.violations.push(HeapViolation::LinkOutOfBounds {
                    bucket,
                    offset: holder,
                    link: bp,
                });
                break;
            }
            nodes += 1;
            if nodes > max_nodes {
                report.violations.push(HeapViolation::ListCycle { bucket });
                break;
            }

            let hdr = block::header(heap, bp);
            if hdr.allocated {
                report
                    .violations
                    .push(HeapViolation::AllocatedOnFreeList { bucket, offset: bp });
            }
            if !bucket_holds(bucket, hdr.size) {
                let (min, max) = bucket_bounds(bucket);
                report.violations.push(HeapViolation::WrongBucket {
                    bucket,
                    offset: bp,
                    size: hdr.size,
                    min,
                    max,
                });
            }
            if prev_link(heap, bp) != expected_prev {
                let violation = if expected_prev == NIL {
                    HeapViolation::BadHead { bucket, offset: bp }
                } else {
                    HeapViolation::BrokenLink {
                        bucket,
                        offset: holder,
                        next: bp,
                    }
                };
                report.violations.push(violation);
            }

            report.free_list_entries += 1;
            expected_prev = link;
            holder = bp;
            link = next_link(heap, bp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaProvider;
    use crate::block::{set_footer, set_header, write_word};
    use crate::config::AllocatorConfig;
    use crate::free_list::to_link;
    use crate::SegAllocator;

    /// Three allocated 32-byte blocks at 16, 48 and 80 followed by the free
    /// remainder of the first chunk.
    fn three_blocks() -> SegAllocator {
        let mut a = SegAllocator::new(AllocatorConfig::default().with_log_level(None)).unwrap();
        for expected in [16, 48, 80] {
            assert_eq!(a.malloc(24), Some(expected));
        }
        a
    }

    fn heap(a: &mut SegAllocator) -> &mut [u8] {
        a.arena_mut().bytes_mut()
    }

    #[test]
    fn clean_heap_reports_counts() {
        let mut a = three_blocks();
        a.free(48);
        let report = a.validate();
        assert!(report.is_ok(), "{:?}", report.violations);
        assert_eq!(report.heap_size, 16 + 4096);
        assert_eq!(report.blocks, 4);
        assert_eq!(report.free_blocks, 2);
        assert_eq!(report.free_list_entries, 2);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn footer_mismatch_is_reported() {
        let mut a = three_blocks();
        a.free(16);
        write_word(heap(&mut a), 40, BlockHeader::free(48, false).encode());
        let report = a.validate();
        assert_eq!(
            report.violations,
            vec![HeapViolation::FooterMismatch {
                offset: 16,
                header: 32,
                footer: 48,
            }]
        );
        let err = report.into_result().unwrap_err();
        assert_eq!(err.count, 1);
    }

    #[test]
    fn stale_prev_allocated_bit_is_reported() {
        let mut a = three_blocks();
        set_header(heap(&mut a), 48, BlockHeader::new(32, true, false));
        assert_eq!(
            a.validate().violations,
            vec![HeapViolation::StalePrevAllocated {
                offset: 48,
                recorded: false,
                actual: true,
            }]
        );
    }

    #[test]
    fn adjacent_free_blocks_are_reported() {
        let mut a = three_blocks();
        a.free(16);
        let bytes = heap(&mut a);
        set_header(bytes, 48, BlockHeader::free(32, false));
        set_footer(bytes, 48, 32);
        let violations = a.validate().violations;
        assert!(violations.contains(&HeapViolation::Uncoalesced { offset: 16, next: 48 }));
        assert!(violations.contains(&HeapViolation::FreeCountMismatch {
            in_heap: 3,
            in_lists: 2,
        }));
    }

    #[test]
    fn self_referencing_list_is_a_cycle() {
        let mut a = three_blocks();
        a.free(16);
        write_word(heap(&mut a), 16 + WSIZE, to_link(16));
        let violations = a.validate().violations;
        assert!(violations.contains(&HeapViolation::ListCycle { bucket: 1 }));
        assert!(violations.contains(&HeapViolation::BrokenLink {
            bucket: 1,
            offset: 16,
            next: 16,
        }));
    }

    #[test]
    fn link_outside_heap_is_reported() {
        let mut a = three_blocks();
        a.free(16);
        write_word(heap(&mut a), 16 + WSIZE, 0x00FF_FFF0);
        assert!(a.validate().violations.contains(&HeapViolation::LinkOutOfBounds {
            bucket: 1,
            offset: 16,
            link: 0x00FF_FFF8,
        }));
    }

    #[test]
    fn allocated_block_on_list_is_reported() {
        let mut a = three_blocks();
        a.free(16);
        set_header(heap(&mut a), 16, BlockHeader::new(32, true, true));
        let violations = a.validate().violations;
        assert!(violations.contains(&HeapViolation::AllocatedOnFreeList { bucket: 1, offset: 16 }));
        assert!(violations.contains(&HeapViolation::StalePrevAllocated {
            offset: 48,
            recorded: false,
            actual: true,
        }));
    }

    #[test]
    fn damaged_epilogue_and_prologue() {
        let mut a = three_blocks();
        let brk = a.heap_size();
        set_header(heap(&mut a), brk, BlockHeader::new(0, false, false));
        assert_eq!(
            a.validate().violations,
            vec![HeapViolation::BadEpilogue { offset: brk, brk }]
        );

        write_word(heap(&mut a), BASE, 0);
        assert_eq!(a.validate().violations, vec![HeapViolation::BadPrologue]);
    }

    #[test]
    fn report_serializes_tagged_violations() {
        let mut a = three_blocks();
        a.free(16);
        write_word(heap(&mut a), 40, 0);
        let json = serde_json::to_string(&a.validate()).unwrap();
        assert!(json.contains(r#""kind":"footer_mismatch""#), "{json}");
        assert!(json.contains(r#""blocks":4"#), "{json}");
    }
}
