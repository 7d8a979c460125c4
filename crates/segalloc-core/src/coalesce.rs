//! Boundary-tag coalescing.

use crate::block::{
    BlockHeader, header, prev_block, set_footer, set_header, set_prev_allocated,
};
use crate::free_list::FreeLists;

/// Merges the just-freed block `bp` with any free neighbours, files the
/// result on its free list and clears the successor's predecessor bit.
///
/// `bp` must already carry a free header and footer and must not be on a
/// list yet. Returns the merged block and its size.
pub(crate) fn coalesce(heap: &mut [u8], lists: &mut FreeLists, bp: usize) -> (usize, usize) {
    let hdr = header(heap, bp);
    let next = bp + hdr.size;
    let next_hdr = header(heap, next);

    let (merged, size) = match (hdr.prev_allocated, next_hdr.allocated) {
        (true, true) => (bp, hdr.size),
        (true, false) => {
            lists.remove(heap, next, next_hdr.size);
            let size = hdr.size + next_hdr.size;
            set_header(heap, bp, BlockHeader::free(size, true));
            set_footer(heap, bp, size);
            (bp, size)
        }
        (false, true) => {
            let prev = prev_block(heap, bp);
            let prev_hdr = header(heap, prev);
            lists.remove(heap, prev, prev_hdr.size);
            let size = prev_hdr.size + hdr.size;
            set_header(heap, prev, BlockHeader::free(size, prev_hdr.prev_allocated));
            set_footer(heap, prev, size);
            (prev, size)
        }
        (false, false) => {
            let prev = prev_block(heap, bp);
            let prev_hdr = header(heap, prev);
            lists.remove(heap, next, next_hdr.size);
            lists.remove(heap, prev, prev_hdr.size);
            let size = prev_hdr.size + hdr.size + next_hdr.size;
            set_header(heap, prev, BlockHeader::free(size, prev_hdr.prev_allocated));
            set_footer(heap, prev, size);
            (prev, size)
        }
    };

    lists.insert(heap, merged, size);
    set_prev_allocated(heap, merged + size, false);
    (merged, size)
}
