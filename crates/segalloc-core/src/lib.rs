//! # segalloc-core
//!
//! Segregated free-list allocator over a single growable arena.
//!
//! Blocks carry a one-word header packing their size with an allocated bit
//! and a predecessor-allocated bit; free blocks repeat it in a footer so the
//! coalescer can step backward. Free blocks are threaded onto ten
//! power-of-two size classes through offset links stored in their payload.
//! Pointers handed to callers are payload offsets into the arena, with 0 as
//! null. No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod allocator;
pub mod arena;
pub mod block;
pub mod checker;
mod coalesce;
pub mod config;
pub mod error;
mod free_list;
pub mod log;
pub mod size_class;

pub use allocator::{AllocatorStats, HeapWalk, SegAllocator};
pub use arena::{ArenaProvider, DEFAULT_HEAP_LIMIT, MAX_ARENA_SIZE, MemArena};
pub use block::{ALIGNMENT, BlockHeader, BlockInfo, MIN_BLOCK_SIZE};
pub use checker::HeapReport;
pub use config::{AllocatorConfig, DEFAULT_CHUNK_SIZE};
pub use error::{AllocError, ArenaError, ConfigError, HeapCheckError, HeapViolation};
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use size_class::{NUM_BUCKETS, bucket_index};
