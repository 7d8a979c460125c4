//! Trace replay harness for segalloc.
//!
//! This crate provides:
//! - Trace parsing and synthesis for the `.rep` allocation trace format
//! - Replay of traces against the allocator with payload and overlap checks
//! - JSONL structured logs for allocator lifecycle records and run results

#![forbid(unsafe_code)]

pub mod replay;
pub mod structured_log;
pub mod trace;

pub use replay::{ReplayError, ReplayOptions, ReplayReport, replay, replay_with_sink};
pub use trace::{MAX_TRACE_IDS, Trace, TraceError, TraceOp, synth};
