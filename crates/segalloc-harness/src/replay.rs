//! Trace replay against [`SegAllocator`].
//!
//! Every payload is filled with a byte pattern derived from its trace id and
//! verified when the id is reallocated or freed. Each returned payload is
//! checked for alignment, for lying inside the heap and for not overlapping
//! any other live payload.

use std::collections::BTreeMap;
use std::time::Instant;

use segalloc_core::{
    AllocError, AllocatorConfig, AllocatorLogRecord, HeapCheckError, SegAllocator,
};
use serde::Serialize;
use thiserror::Error;

use crate::trace::{Trace, TraceOp};

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub config: AllocatorConfig,
    /// Validate the heap after every operation instead of only at the end.
    pub check_each_op: bool,
}

/// Outcome of one successful replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub trace: String,
    pub ops: usize,
    pub allocs: usize,
    pub reallocs: usize,
    pub frees: usize,
    /// Largest sum of requested sizes live at once.
    pub peak_live_bytes: usize,
    /// Arena size when the trace finished.
    pub heap_size: usize,
    /// `peak_live_bytes / heap_size`.
    pub utilization: f64,
    pub elapsed_us: u64,
    pub free_blocks: usize,
    pub heap_extensions: u64,
    /// Validator passes run, including the final one.
    pub checks: usize,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("allocator init failed: {0}")]
    Init(#[source] AllocError),
    #[error("op {op}: allocating {size} bytes for id {id} failed")]
    OutOfMemory { op: usize, id: usize, size: usize },
    #[error("op {op}: id {id} got misaligned payload {ptr}")]
    Misaligned { op: usize, id: usize, ptr: usize },
    #[error("op {op}: id {id} payload [{ptr}, {end}) lies outside the {heap_size}-byte heap")]
    OutOfBounds {
        op: usize,
        id: usize,
        ptr: usize,
        end: usize,
        heap_size: usize,
    },
    #[error("op {op}: id {id} payload at {ptr} overlaps id {other} at {other_ptr}")]
    Overlap {
        op: usize,
        id: usize,
        ptr: usize,
        other: usize,
        other_ptr: usize,
    },
    #[error("op {op}: payload of id {id} was corrupted at byte {offset}")]
    Corrupted { op: usize, id: usize, offset: usize },
    #[error("op {op}: {source}")]
    Heap {
        op: usize,
        #[source]
        source: HeapCheckError,
    },
}

/// Byte `index` of id `id`'s payload.
fn pattern_byte(id: usize, index: usize) -> u8 {
    (id as u8).wrapping_mul(0x9D) ^ (index as u8).wrapping_add((index >> 8) as u8)
}

#[derive(Debug, Clone, Copy)]
struct Live {
    ptr: usize,
    size: usize,
}

struct Replayer {
    alloc: SegAllocator,
    blocks: Vec<Option<Live>>,
    /// Live payload ranges: start -> (end, id).
    ranges: BTreeMap<usize, (usize, usize)>,
    live_bytes: usize,
    peak_live_bytes: usize,
}

impl Replayer {
    fn place(&mut self, op: usize, id: usize, ptr: usize, size: usize) -> Result<(), ReplayError> {
        if ptr % 8 != 0 {
            return Err(ReplayError::Misaligned { op, id, ptr });
        }
        let end = ptr + size;
        let heap_size = self.alloc.heap_size();
        // Payloads end at or before the epilogue header.
        if ptr < 16 || end > heap_size.saturating_sub(4) {
            return Err(ReplayError::OutOfBounds {
                op,
                id,
                ptr,
                end,
                heap_size,
            });
        }
        let overlap = self
            .ranges
            .range(..end)
            .next_back()
            .filter(|(_, (other_end, _))| *other_end > ptr);
        if let Some((&other_ptr, &(_, other))) = overlap {
            return Err(ReplayError::Overlap {
                op,
                id,
                ptr,
                other,
                other_ptr,
            });
        }

        let payload = self
            .alloc
            .payload_mut(ptr)
            .ok_or(ReplayError::Corrupted { op, id, offset: 0 })?;
        for (i, byte) in payload[..size].iter_mut().enumerate() {
            *byte = pattern_byte(id, i);
        }
        self.ranges.insert(ptr, (end, id));
        self.blocks[id] = Some(Live { ptr, size });
        self.live_bytes += size;
        self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
        Ok(())
    }

    /// Verifies `id`'s payload and forgets its range.
    fn retire(&mut self, op: usize, id: usize) -> Result<Live, ReplayError> {
        let Some(live) = self.blocks[id].take() else {
            return Ok(Live { ptr: 0, size: 0 });
        };
        self.ranges.remove(&live.ptr);
        self.live_bytes -= live.size;
        self.verify(op, id, live.ptr, live.size)?;
        Ok(live)
    }

    /// Checks the first `upto` bytes at `ptr` against `id`'s pattern.
    fn verify(&self, op: usize, id: usize, ptr: usize, upto: usize) -> Result<(), ReplayError> {
        let payload = self
            .alloc
            .payload(ptr)
            .ok_or(ReplayError::Corrupted { op, id, offset: 0 })?;
        match (0..upto).find(|&i| payload.get(i) != Some(&pattern_byte(id, i))) {
            Some(offset) => Err(ReplayError::Corrupted { op, id, offset }),
            None => Ok(()),
        }
    }

    fn step(&mut self, op: usize, trace_op: TraceOp) -> Result<(), ReplayError> {
        match trace_op {
            TraceOp::Alloc { id, size } => match self.alloc.malloc(size) {
                Some(ptr) => self.place(op, id, ptr, size),
                None if size == 0 => Ok(()),
                None => Err(ReplayError::OutOfMemory { op, id, size }),
            },
            TraceOp::Realloc { id, size } => {
                // The old payload is checked before realloc frees it.
                let old = self.retire(op, id)?;
                match self.alloc.realloc(old.ptr, size) {
                    Some(ptr) => {
                        self.verify(op, id, ptr, old.size.min(size))?;
                        self.place(op, id, ptr, size)
                    }
                    None if size == 0 => Ok(()),
                    None => Err(ReplayError::OutOfMemory { op, id, size }),
                }
            }
            TraceOp::Free { id } => {
                let old = self.retire(op, id)?;
                self.alloc.free(old.ptr);
                Ok(())
            }
        }
    }
}

/// One past the largest id any op touches.
fn id_span(trace: &Trace) -> usize {
    trace.ops.iter().map(|op| op.id().saturating_add(1)).max().unwrap_or(0)
}

/// Replays `trace`, discarding allocator lifecycle records.
pub fn replay(trace: &Trace, options: &ReplayOptions) -> Result<ReplayReport, ReplayError> {
    replay_with_sink(trace, options, |_| {})
}

/// Replays `trace`, handing every allocator lifecycle record to `sink` as
/// soon as the operation that produced it finishes.
pub fn replay_with_sink<F>(
    trace: &Trace,
    options: &ReplayOptions,
    mut sink: F,
) -> Result<ReplayReport, ReplayError>
where
    F: FnMut(AllocatorLogRecord),
{
    let started = Instant::now();
    let alloc = SegAllocator::new(options.config.clone()).map_err(ReplayError::Init)?;
    let mut replayer = Replayer {
        alloc,
        // Sized from the ops, not the header, so a hand-built trace cannot
        // force a huge table.
        blocks: vec![None; id_span(trace)],
        ranges: BTreeMap::new(),
        live_bytes: 0,
        peak_live_bytes: 0,
    };
    replayer.alloc.drain_lifecycle_logs().into_iter().for_each(&mut sink);

    let mut counts = [0usize; 3];
    let mut checks = 0;
    for (op, &trace_op) in trace.ops.iter().enumerate() {
        counts[match trace_op {
            TraceOp::Alloc { .. } => 0,
            TraceOp::Realloc { .. } => 1,
            TraceOp::Free { .. } => 2,
        }] += 1;
        let result = replayer.step(op, trace_op);
        replayer.alloc.drain_lifecycle_logs().into_iter().for_each(&mut sink);
        result?;

        if options.check_each_op {
            checks += 1;
            replayer
                .alloc
                .validate()
                .into_result()
                .map_err(|source| ReplayError::Heap { op, source })?;
        }
    }

    let final_report = replayer
        .alloc
        .validate()
        .into_result()
        .map_err(|source| ReplayError::Heap {
            op: trace.ops.len(),
            source,
        })?;
    checks += 1;

    let heap_size = replayer.alloc.heap_size();
    let elapsed = started.elapsed();
    Ok(ReplayReport {
        trace: trace.name.clone(),
        ops: trace.ops.len(),
        allocs: counts[0],
        reallocs: counts[1],
        frees: counts[2],
        peak_live_bytes: replayer.peak_live_bytes,
        heap_size,
        utilization: replayer.peak_live_bytes as f64 / heap_size as f64,
        elapsed_us: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        free_blocks: final_report.free_blocks,
        heap_extensions: replayer.alloc.stats().heap_extensions,
        checks,
    })
}
