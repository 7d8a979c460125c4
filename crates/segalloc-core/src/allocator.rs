//! Allocator state.
//!
//! [`SegAllocator`] owns the arena and the bucket heads and implements the
//! malloc family on top of the block codec, the free lists and the
//! coalescer. Pointers are payload offsets into the arena; 0 is null.

use serde::Serialize;

use crate::arena::{ArenaProvider, MAX_ARENA_SIZE, MemArena};
use crate::block::{
    self, BlockHeader, BlockInfo, DSIZE, MIN_BLOCK_SIZE, WSIZE, adjusted_size, align_up,
    is_aligned,
};
use crate::checker::{FIRST_BLOCK, HeapReport, check_heap};
use crate::coalesce::coalesce;
use crate::config::AllocatorConfig;
use crate::error::{AllocError, ArenaError};
use crate::free_list::{BASE, FreeLists};
use crate::log::{AllocatorLogLevel, AllocatorLogRecord, LifecycleLog, RecordFields, Snapshot};
use crate::size_class::{NUM_BUCKETS, bucket_index};

/// Counters kept across the allocator's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    /// Arena break.
    pub heap_size: usize,
    /// Bytes held by allocated blocks, headers included.
    pub allocated_bytes: usize,
    pub allocated_blocks: usize,
    pub malloc_calls: u64,
    pub free_calls: u64,
    pub realloc_calls: u64,
    pub calloc_calls: u64,
    /// Requests that produced no block for a reason other than size 0.
    pub failed_allocations: u64,
    pub heap_extensions: u64,
}

/// Segregated-fit allocator over one arena.
pub struct SegAllocator<A: ArenaProvider = MemArena> {
    arena: A,
    lists: FreeLists,
    config: AllocatorConfig,
    stats: AllocatorStats,
    log: LifecycleLog,
}

impl SegAllocator<MemArena> {
    /// Allocator over a fresh [`MemArena`] limited to `config.max_heap`.
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        let arena = MemArena::new(config.max_heap);
        Self::with_arena(arena, config)
    }
}

impl<A: ArenaProvider> SegAllocator<A> {
    /// Lays out the prologue and epilogue in an empty `arena` and extends it
    /// by one chunk.
    pub fn with_arena(arena: A, config: AllocatorConfig) -> Result<Self, AllocError> {
        config.validate()?;
        if !arena.is_empty() {
            return Err(AllocError::ArenaInUse { len: arena.len() });
        }
        let log = LifecycleLog::new(config.log_level);
        let mut this = Self {
            arena,
            lists: FreeLists::new(),
            config,
            stats: AllocatorStats::default(),
            log,
        };

        let start = this.arena.grow(4 * WSIZE)?;
        debug_assert_eq!(start, 0);
        let prologue = BlockHeader::new(DSIZE, true, true);
        let heap = this.arena.bytes_mut();
        block::write_word(heap, 0, 0);
        block::set_header(heap, BASE, prologue);
        block::write_word(heap, BASE, prologue.encode());
        block::set_header(heap, FIRST_BLOCK, BlockHeader::new(0, true, true));
        this.stats.heap_size = this.arena.len();

        let chunk = this.config.chunk_size;
        this.extend_heap(chunk, "init")?;
        Ok(this)
    }

    /// Allocates at least `size` bytes. `None` for size 0 or when the arena
    /// cannot grow.
    pub fn malloc(&mut self, size: usize) -> Option<usize> {
        self.try_malloc(size).ok()
    }

    /// [`malloc`](Self::malloc) that reports why no block was produced.
    pub fn try_malloc(&mut self, size: usize) -> Result<usize, AllocError> {
        self.stats.malloc_calls += 1;
        let out = self.allocate(size, "malloc");
        self.after_mutation("malloc");
        out
    }

    /// Returns the block at `ptr` to its free list. Null is a no-op.
    pub fn free(&mut self, ptr: usize) {
        self.stats.free_calls += 1;
        self.release(ptr, "free");
        self.after_mutation("free");
    }

    /// Moves the object at `ptr` into a new block of `size` bytes.
    ///
    /// `size == 0` frees `ptr` and returns `None`; a null `ptr` behaves as
    /// `malloc(size)`. Otherwise a new block is always allocated, the
    /// retained bytes are copied, and the old block is freed. If the new
    /// allocation fails the old block is left untouched.
    pub fn realloc(&mut self, ptr: usize, size: usize) -> Option<usize> {
        self.stats.realloc_calls += 1;
        let out = self.reallocate(ptr, size);
        self.after_mutation("realloc");
        out
    }

    /// Allocates `count * size` zeroed bytes. `None` on overflow, zero size
    /// or exhaustion.
    pub fn calloc(&mut self, count: usize, size: usize) -> Option<usize> {
        self.stats.calloc_calls += 1;
        let Some(total) = count.checked_mul(size) else {
            self.stats.failed_allocations += 1;
            self.record(
                AllocatorLogLevel::Warn,
                fields("calloc", "calloc_overflow", None, None, None, "denied"),
                format!("count={count} elem_size={size}"),
            );
            return None;
        };

        let out = self.allocate(total, "calloc").ok();
        if let Some(bp) = out {
            let capacity = block::header(self.arena.bytes(), bp).size - WSIZE;
            self.arena.bytes_mut()[bp..bp + capacity].fill(0);
        }
        self.record(
            AllocatorLogLevel::Trace,
            fields(
                "calloc",
                "calloc_result",
                out,
                Some(total),
                out.map(|_| bucket_index(adjusted_size(total).unwrap_or(0))),
                if out.is_some() { "success" } else { "failed" },
            ),
            format!("count={count} elem_size={size}"),
        );
        self.after_mutation("calloc");
        out
    }

    /// Usable bytes of the allocated block at `ptr`.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        self.allocated_block(ptr).map(|hdr| hdr.size - WSIZE)
    }

    /// Payload of the allocated block at `ptr`.
    #[must_use]
    pub fn payload(&self, ptr: usize) -> Option<&[u8]> {
        let hdr = self.allocated_block(ptr)?;
        Some(&self.arena.bytes()[ptr..ptr + hdr.size - WSIZE])
    }

    /// Mutable payload of the allocated block at `ptr`.
    pub fn payload_mut(&mut self, ptr: usize) -> Option<&mut [u8]> {
        let hdr = self.allocated_block(ptr)?;
        Some(&mut self.arena.bytes_mut()[ptr..ptr + hdr.size - WSIZE])
    }

    /// Header of the block whose payload starts at `ptr`, allocated or free.
    /// `None` when `ptr` cannot be a block inside the arena.
    #[must_use]
    pub fn block(&self, ptr: usize) -> Option<BlockInfo> {
        let heap = self.arena.bytes();
        if ptr < FIRST_BLOCK || !is_aligned(ptr) || ptr > heap.len() {
            return None;
        }
        let hdr = block::header(heap, ptr);
        if hdr.size < MIN_BLOCK_SIZE || ptr + hdr.size > heap.len() {
            return None;
        }
        Some(BlockInfo::from_header(ptr, hdr))
    }

    /// Every block from the first one after the prologue up to the epilogue.
    pub fn blocks(&self) -> HeapWalk<'_> {
        HeapWalk {
            heap: self.arena.bytes(),
            bp: FIRST_BLOCK,
        }
    }

    /// Free blocks on `bucket`'s list, head first.
    #[must_use]
    pub fn free_list(&self, bucket: usize) -> Vec<usize> {
        if bucket >= NUM_BUCKETS {
            return Vec::new();
        }
        self.lists.iter(self.arena.bytes(), bucket).collect()
    }

    /// Runs the heap validator. With `verbose`, the free block count is
    /// recorded as an Info lifecycle record.
    pub fn check(&mut self, verbose: bool) -> HeapReport {
        let report = self.validate();
        if verbose {
            self.record(
                AllocatorLogLevel::Info,
                fields(
                    "check",
                    "free_block_count",
                    None,
                    Some(report.free_blocks),
                    None,
                    "snapshot",
                ),
                format!(
                    "blocks={} free_blocks={}",
                    report.blocks, report.free_blocks
                ),
            );
        }
        if let Some(first) = report.violations.first() {
            let details = format!("violations={} first={first}", report.violations.len());
            self.record(
                AllocatorLogLevel::Error,
                fields("check", "heap_check_failed", None, None, None, "corrupt"),
                details,
            );
        }
        report
    }

    /// Side-effect free validator pass.
    #[must_use]
    pub fn validate(&self) -> HeapReport {
        check_heap(self.arena.bytes(), &self.lists)
    }

    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        self.stats
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Raw arena access. Writes through it bypass every allocator invariant.
    pub fn arena_mut(&mut self) -> &mut A {
        &mut self.arena
    }

    /// Returns a view of allocator lifecycle log records.
    pub fn lifecycle_logs(&self) -> &[AllocatorLogRecord] {
        self.log.records()
    }

    /// Drains allocator lifecycle log records.
    pub fn drain_lifecycle_logs(&mut self) -> Vec<AllocatorLogRecord> {
        self.log.drain()
    }

    fn allocate(&mut self, size: usize, symbol: &'static str) -> Result<usize, AllocError> {
        if size == 0 {
            self.record(
                AllocatorLogLevel::Trace,
                fields(symbol, "alloc_zero", None, Some(0), None, "noop"),
                "zero_size_request",
            );
            return Err(AllocError::ZeroSize);
        }
        let Some(asize) = adjusted_size(size).filter(|&asize| asize < MAX_ARENA_SIZE) else {
            self.stats.failed_allocations += 1;
            self.record(
                AllocatorLogLevel::Warn,
                fields(symbol, "size_overflow", None, Some(size), None, "denied"),
                "adjusted_size_out_of_range",
            );
            return Err(AllocError::SizeOverflow { size });
        };

        if let Some(bp) = self.lists.find_fit(self.arena.bytes(), asize) {
            self.place(bp, asize);
            self.record(
                AllocatorLogLevel::Trace,
                fields(symbol, "alloc", Some(bp), Some(size), Some(bucket_index(asize)), "success"),
                "path=free_list",
            );
            return Ok(bp);
        }

        let grow_by = asize.max(self.config.chunk_size);
        match self.extend_heap(grow_by, symbol) {
            Ok(bp) => {
                self.place(bp, asize);
                self.record(
                    AllocatorLogLevel::Trace,
                    fields(symbol, "alloc", Some(bp), Some(size), Some(bucket_index(asize)), "success"),
                    "path=heap_extend",
                );
                Ok(bp)
            }
            Err(err) => {
                self.stats.failed_allocations += 1;
                self.record(
                    AllocatorLogLevel::Warn,
                    fields(symbol, "oom", None, Some(size), Some(bucket_index(asize)), "oom"),
                    err.to_string(),
                );
                Err(err)
            }
        }
    }

    fn release(&mut self, ptr: usize, symbol: &'static str) {
        if ptr == 0 {
            self.record(
                AllocatorLogLevel::Trace,
                fields(symbol, "free_null", Some(ptr), None, None, "noop"),
                "null_pointer",
            );
            return;
        }
        let Some(hdr) = self.allocated_block(ptr) else {
            self.record(
                AllocatorLogLevel::Warn,
                fields(symbol, "invalid_free", Some(ptr), None, None, "ignored"),
                "pointer_is_not_an_allocated_block",
            );
            return;
        };

        let heap = self.arena.bytes_mut();
        block::set_header(heap, ptr, BlockHeader::free(hdr.size, hdr.prev_allocated));
        block::set_footer(heap, ptr, hdr.size);
        let (merged, merged_size) = coalesce(heap, &mut self.lists, ptr);
        self.stats.allocated_bytes = self.stats.allocated_bytes.saturating_sub(hdr.size);
        self.stats.allocated_blocks = self.stats.allocated_blocks.saturating_sub(1);

        self.record(
            AllocatorLogLevel::Trace,
            fields(
                symbol,
                "free",
                Some(ptr),
                Some(hdr.size),
                Some(bucket_index(merged_size)),
                "success",
            ),
            if merged == ptr && merged_size == hdr.size {
                "coalesce=none"
            } else {
                "coalesce=merged"
            },
        );
    }

    fn reallocate(&mut self, ptr: usize, size: usize) -> Option<usize> {
        if size == 0 {
            self.release(ptr, "realloc");
            self.record(
                AllocatorLogLevel::Trace,
                fields("realloc", "realloc_zero_as_free", Some(ptr), Some(0), None, "freed"),
                "new_size_was_zero",
            );
            return None;
        }
        if ptr == 0 {
            return self.allocate(size, "realloc").ok();
        }
        let Some(old) = self.allocated_block(ptr) else {
            self.record(
                AllocatorLogLevel::Warn,
                fields("realloc", "realloc_invalid_pointer", Some(ptr), Some(size), None, "denied"),
                "pointer_is_not_an_allocated_block",
            );
            return None;
        };

        let new_ptr = self.allocate(size, "realloc").ok()?;
        let retained = size.min(old.size - WSIZE);
        self.arena
            .bytes_mut()
            .copy_within(ptr..ptr + retained, new_ptr);
        self.release(ptr, "realloc");
        self.record(
            AllocatorLogLevel::Trace,
            fields("realloc", "realloc_move", Some(new_ptr), Some(size), None, "success"),
            format!("old_ptr={ptr} old_size={} copied={retained}", old.size),
        );
        Some(new_ptr)
    }

    /// Grows the arena by `bytes` (rounded to the alignment), turns the new
    /// space into a free block ending in a fresh epilogue, and coalesces it
    /// with a free block at the old end of the heap.
    fn extend_heap(&mut self, bytes: usize, symbol: &'static str) -> Result<usize, AllocError> {
        let size = align_up(bytes).ok_or(AllocError::SizeOverflow { size: bytes })?;
        let used = self.arena.len();
        if used.checked_add(size).is_none_or(|end| end > MAX_ARENA_SIZE) {
            return Err(ArenaError::Exhausted {
                requested: size,
                used,
                limit: MAX_ARENA_SIZE,
            }
            .into());
        }

        let bp = self.arena.grow(size)?;
        let heap = self.arena.bytes_mut();
        let prev_allocated = block::header(heap, bp).prev_allocated;
        block::set_header(heap, bp, BlockHeader::free(size, prev_allocated));
        block::set_footer(heap, bp, size);
        block::set_header(heap, bp + size, BlockHeader::new(0, true, false));
        let (merged, _) = coalesce(heap, &mut self.lists, bp);

        self.stats.heap_size = self.arena.len();
        self.stats.heap_extensions += 1;
        self.record(
            AllocatorLogLevel::Info,
            fields(symbol, "heap_extend", Some(bp), Some(size), None, "success"),
            format!("old_break={bp} new_break={}", bp + size),
        );
        Ok(merged)
    }

    /// Carves `asize` bytes out of the free block `bp`, splitting off the
    /// tail when it can stand as a block of its own.
    fn place(&mut self, bp: usize, asize: usize) {
        let heap = self.arena.bytes_mut();
        let hdr = block::header(heap, bp);
        let csize = hdr.size;
        self.lists.remove(heap, bp, csize);

        let taken = if csize - asize >= MIN_BLOCK_SIZE {
            block::set_header(heap, bp, BlockHeader::new(asize, true, hdr.prev_allocated));
            let rest = bp + asize;
            let rest_size = csize - asize;
            block::set_header(heap, rest, BlockHeader::free(rest_size, true));
            block::set_footer(heap, rest, rest_size);
            self.lists.insert(heap, rest, rest_size);
            asize
        } else {
            block::set_header(heap, bp, BlockHeader::new(csize, true, hdr.prev_allocated));
            block::set_prev_allocated(heap, bp + csize, true);
            csize
        };

        self.stats.allocated_bytes += taken;
        self.stats.allocated_blocks += 1;
    }

    /// Header of `ptr` if it plausibly addresses an allocated block. Catches
    /// null, foreign and already-freed pointers cheaply; it is not a full
    /// ownership check.
    fn allocated_block(&self, ptr: usize) -> Option<BlockHeader> {
        self.block(ptr)
            .filter(|info| info.allocated)
            .map(|info| BlockHeader::new(info.size, info.allocated, info.prev_allocated))
    }

    fn after_mutation(&mut self, symbol: &'static str) {
        if !self.config.check_heap {
            return;
        }
        let report = self.check(false);
        if cfg!(debug_assertions) && !report.is_ok() {
            panic!("heap check failed after {symbol}: {}", report.violations[0]);
        }
    }

    fn record(&mut self, level: AllocatorLogLevel, fields: RecordFields, details: impl Into<String>) {
        if !self.log.enabled(level) {
            return;
        }
        let snapshot = Snapshot {
            heap_size: self.arena.len(),
            allocated_bytes: self.stats.allocated_bytes,
            allocated_blocks: self.stats.allocated_blocks,
        };
        self.log.record(level, fields, details, snapshot);
    }
}

fn fields(
    symbol: &'static str,
    event: &'static str,
    ptr: Option<usize>,
    size: Option<usize>,
    bucket: Option<usize>,
    outcome: &'static str,
) -> RecordFields {
    RecordFields {
        symbol,
        event,
        ptr,
        size,
        bucket,
        outcome,
    }
}

/// Iterator over the blocks of a heap, stopping at the epilogue or at the
/// first block that cannot be decoded.
pub struct HeapWalk<'a> {
    heap: &'a [u8],
    bp: usize,
}

impl Iterator for HeapWalk<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.bp > self.heap.len() {
            return None;
        }
        let hdr = block::header(self.heap, self.bp);
        if hdr.size < MIN_BLOCK_SIZE || self.bp + hdr.size > self.heap.len() {
            return None;
        }
        let info = BlockInfo::from_header(self.bp, hdr);
        self.bp = block::next_block(self.heap, self.bp);
        Some(info)
    }
}
