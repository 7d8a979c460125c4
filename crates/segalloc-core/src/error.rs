//! Error types.

use std::collections::TryReserveError;

use serde::Serialize;
use thiserror::Error;

use crate::checker::HeapReport;

/// Arena growth failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("arena exhausted: requested {requested} more bytes with {used} of {limit} in use")]
    Exhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },
    #[error("host refused to back arena growth: {0}")]
    HostAllocation(#[from] TryReserveError),
}

/// Why an allocation request produced no block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("zero-sized request")]
    ZeroSize,
    #[error("request of {size} bytes overflows the block size range")]
    SizeOverflow { size: usize },
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("arena already holds {len} bytes")]
    ArenaInUse { len: usize },
}

/// Invalid allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("chunk size {0} must be a multiple of 8 and at least 16")]
    ChunkSize(usize),
    #[error("heap limit {limit} exceeds the 2^32 byte offset range")]
    HeapLimit { limit: usize },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// One structural invariant found broken by the heap validator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeapViolation {
    #[error("prologue block is damaged")]
    BadPrologue,
    #[error("epilogue block missing or misplaced (walk ended at {offset}, break at {brk})")]
    BadEpilogue { offset: usize, brk: usize },
    #[error("block {offset} is not 8-byte aligned")]
    Misaligned { offset: usize },
    #[error("block {offset} of size {size} leaves the arena [{lo}, {hi})")]
    OutOfBounds {
        offset: usize,
        size: usize,
        lo: usize,
        hi: usize,
    },
    #[error("heap span {span} exceeds the 2^32 byte offset range")]
    HeapTooLarge { span: usize },
    #[error("block {offset} has size {size}, below the minimum block size")]
    Undersized { offset: usize, size: usize },
    #[error("free block {offset} has header size {header} but footer size {footer}")]
    FooterMismatch {
        offset: usize,
        header: usize,
        footer: usize,
    },
    #[error("block {offset} records predecessor allocated={recorded}, actual={actual}")]
    StalePrevAllocated {
        offset: usize,
        recorded: bool,
        actual: bool,
    },
    #[error("free blocks {offset} and {next} are adjacent")]
    Uncoalesced { offset: usize, next: usize },
    #[error("bucket {bucket}: link from {offset} points outside the heap ({link})")]
    LinkOutOfBounds {
        bucket: usize,
        offset: usize,
        link: usize,
    },
    #[error("bucket {bucket}: {next}.prev does not point back to {offset}")]
    BrokenLink {
        bucket: usize,
        offset: usize,
        next: usize,
    },
    #[error("bucket {bucket}: head {offset} has a predecessor link")]
    BadHead { bucket: usize, offset: usize },
    #[error("bucket {bucket}: allocated block {offset} is on a free list")]
    AllocatedOnFreeList { bucket: usize, offset: usize },
    #[error(
        "bucket {bucket}: block {offset} of size {size} is outside the bucket's range {}",
        size_range(.min, .max)
    )]
    WrongBucket {
        bucket: usize,
        offset: usize,
        size: usize,
        /// Smallest size the bucket holds.
        min: usize,
        /// Largest size the bucket holds; `None` for the catch-all bucket.
        max: Option<usize>,
    },
    #[error("bucket {bucket}: list does not terminate")]
    ListCycle { bucket: usize },
    #[error("heap walk found {in_heap} free blocks but the lists hold {in_lists}")]
    FreeCountMismatch { in_heap: usize, in_lists: usize },
}

fn size_range(min: &usize, max: &Option<usize>) -> String {
    match max {
        Some(max) => format!("{min}..={max}"),
        None => format!("{min}.."),
    }
}

/// A heap check that found at least one violation.
#[derive(Debug, Clone, Error)]
#[error("heap check found {count} violation(s); first: {first}")]
pub struct HeapCheckError {
    pub count: usize,
    pub first: HeapViolation,
    pub report: HeapReport,
}
