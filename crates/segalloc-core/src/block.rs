//! Block codec.
//!
//! Every block starts with a one-word header packing the block size with two
//! flag bits:
//!
//! ```text
//!   31                              3   2   1   0
//!  +----------------------------------+---+---+---+
//!  |            block size            | 0 | P | A |
//!  +----------------------------------+---+---+---+
//!   A = this block is allocated
//!   P = the block immediately before this one is allocated
//! ```
//!
//! Free blocks repeat the header in a footer word at their last four bytes so
//! the successor can find its predecessor. Allocated blocks carry no footer;
//! the `P` bit of their successor stands in for it.
//!
//! A block is addressed by its payload offset (`bp`): the header sits at
//! `bp - WSIZE`, the footer at `bp + size - DSIZE`. All word access is
//! little-endian and bounds-checked by slice indexing.

use serde::Serialize;

/// Header, footer and free-list link width in bytes.
pub const WSIZE: usize = 4;
/// Double word.
pub const DSIZE: usize = 8;
/// Payload and block-size alignment.
pub const ALIGNMENT: usize = DSIZE;
/// Header + prev link + next link + footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

const ALLOC_BIT: u32 = 0x1;
const PREV_ALLOC_BIT: u32 = 0x2;
const SIZE_MASK: u32 = !0x7;

/// Decoded header/footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockHeader {
    /// Total block size in bytes, header included.
    pub size: usize,
    /// Whether this block is handed out.
    pub allocated: bool,
    /// Whether the block immediately before this one is handed out.
    pub prev_allocated: bool,
}

impl BlockHeader {
    #[must_use]
    pub const fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        Self {
            size,
            allocated,
            prev_allocated,
        }
    }

    /// Header of a free block (its footer uses the same value).
    #[must_use]
    pub const fn free(size: usize, prev_allocated: bool) -> Self {
        Self::new(size, false, prev_allocated)
    }

    /// Packs the header into its on-arena word.
    ///
    /// Sizes are bounded by the 2^32 arena limit, so the truncating cast
    /// never drops set bits for a well-formed block.
    #[must_use]
    pub const fn encode(self) -> u32 {
        let mut word = (self.size as u32) & SIZE_MASK;
        if self.allocated {
            word |= ALLOC_BIT;
        }
        if self.prev_allocated {
            word |= PREV_ALLOC_BIT;
        }
        word
    }

    #[must_use]
    pub const fn decode(word: u32) -> Self {
        Self {
            size: (word & SIZE_MASK) as usize,
            allocated: word & ALLOC_BIT != 0,
            prev_allocated: word & PREV_ALLOC_BIT != 0,
        }
    }
}

/// Public snapshot of one block, as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Payload offset (the pointer handed to callers for allocated blocks).
    pub ptr: usize,
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

impl BlockInfo {
    pub(crate) fn from_header(ptr: usize, header: BlockHeader) -> Self {
        Self {
            ptr,
            size: header.size,
            allocated: header.allocated,
            prev_allocated: header.prev_allocated,
        }
    }

    /// Bytes a caller may use in this block when it is allocated.
    #[must_use]
    pub const fn payload_capacity(&self) -> usize {
        self.size - WSIZE
    }

    /// Offset one past the last byte of the block.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.ptr - WSIZE + self.size
    }
}

/// Rounds `size` up to [`ALIGNMENT`], or `None` on overflow.
#[must_use]
pub const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Block size needed to serve a `size`-byte request, or `None` on overflow.
///
/// Requests pay one header word and are rounded up to the alignment, with
/// [`MIN_BLOCK_SIZE`] as the floor so a freed block can hold its links and
/// footer.
#[must_use]
pub const fn adjusted_size(size: usize) -> Option<usize> {
    if size <= WSIZE {
        return Some(MIN_BLOCK_SIZE);
    }
    match size.checked_add(WSIZE) {
        Some(with_header) => align_up(with_header),
        None => None,
    }
}

#[must_use]
pub const fn is_aligned(offset: usize) -> bool {
    offset % ALIGNMENT == 0
}

pub(crate) fn read_word(heap: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; WSIZE];
    word.copy_from_slice(&heap[offset..offset + WSIZE]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_word(heap: &mut [u8], offset: usize, value: u32) {
    heap[offset..offset + WSIZE].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn header(heap: &[u8], bp: usize) -> BlockHeader {
    BlockHeader::decode(read_word(heap, bp - WSIZE))
}

pub(crate) fn set_header(heap: &mut [u8], bp: usize, header: BlockHeader) {
    write_word(heap, bp - WSIZE, header.encode());
}

/// Footer of the block at `bp`, located through its header size.
pub(crate) fn footer(heap: &[u8], bp: usize) -> BlockHeader {
    let size = header(heap, bp).size;
    BlockHeader::decode(read_word(heap, bp + size - DSIZE))
}

/// Writes a footer for a block of `size` bytes. Footers never carry the
/// predecessor bit.
pub(crate) fn set_footer(heap: &mut [u8], bp: usize, size: usize) {
    write_word(heap, bp + size - DSIZE, BlockHeader::free(size, false).encode());
}

pub(crate) fn next_block(heap: &[u8], bp: usize) -> usize {
    bp + header(heap, bp).size
}

/// Predecessor of `bp`. Only meaningful when the predecessor is free, since
/// allocated blocks have no footer to read.
pub(crate) fn prev_block(heap: &[u8], bp: usize) -> usize {
    let prev_size = BlockHeader::decode(read_word(heap, bp - DSIZE)).size;
    bp - prev_size
}

pub(crate) fn set_prev_allocated(heap: &mut [u8], bp: usize, prev_allocated: bool) {
    let mut hdr = header(heap, bp);
    hdr.prev_allocated = prev_allocated;
    set_header(heap, bp, hdr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_every_flag_combination() {
        for size in [0usize, 8, 16, 24, 4096, 1 << 20] {
            for allocated in [false, true] {
                for prev_allocated in [false, true] {
                    let hdr = BlockHeader::new(size, allocated, prev_allocated);
                    assert_eq!(BlockHeader::decode(hdr.encode()), hdr);
                }
            }
        }
    }

    #[test]
    fn encode_matches_packed_layout() {
        assert_eq!(BlockHeader::new(8, true, true).encode(), 0xB);
        assert_eq!(BlockHeader::new(0, true, false).encode(), 0x1);
        assert_eq!(BlockHeader::free(4096, true).encode(), 4096 | 0x2);
    }

    #[test]
    fn adjusted_size_includes_header_and_floor() {
        assert_eq!(adjusted_size(1), Some(16));
        assert_eq!(adjusted_size(4), Some(16));
        assert_eq!(adjusted_size(12), Some(16));
        assert_eq!(adjusted_size(13), Some(24));
        assert_eq!(adjusted_size(20), Some(24));
        assert_eq!(adjusted_size(100), Some(104));
        assert_eq!(adjusted_size(usize::MAX), None);
        assert_eq!(adjusted_size(usize::MAX - 4), None);
    }

    #[test]
    fn align_up_rounds_to_double_word() {
        assert_eq!(align_up(0), Some(0));
        assert_eq!(align_up(1), Some(8));
        assert_eq!(align_up(8), Some(8));
        assert_eq!(align_up(9), Some(16));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn tags_and_neighbours_resolve_through_words() {
        let mut heap = vec![0u8; 64];
        // Two blocks: [bp=8, size 24, allocated] [bp=32, size 32, free].
        set_header(&mut heap, 8, BlockHeader::new(24, true, true));
        set_header(&mut heap, 32, BlockHeader::free(32, true));
        set_footer(&mut heap, 32, 32);

        assert_eq!(next_block(&heap, 8), 32);
        assert_eq!(header(&heap, 32), BlockHeader::free(32, true));
        assert_eq!(footer(&heap, 32), BlockHeader::free(32, false));

        set_prev_allocated(&mut heap, 32, false);
        assert!(!header(&heap, 32).prev_allocated);
        assert_eq!(header(&heap, 32).size, 32);
    }

    #[test]
    fn prev_block_reads_free_predecessor_footer() {
        let mut heap = vec![0u8; 64];
        set_header(&mut heap, 8, BlockHeader::free(16, true));
        set_footer(&mut heap, 8, 16);
        set_header(&mut heap, 24, BlockHeader::new(16, true, false));
        assert_eq!(prev_block(&heap, 24), 8);
    }

    #[test]
    fn block_info_reports_capacity_and_end() {
        let info = BlockInfo::from_header(16, BlockHeader::new(24, true, true));
        assert_eq!(info.payload_capacity(), 20);
        assert_eq!(info.end(), 36);
    }
}
