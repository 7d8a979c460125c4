//! `.rep` allocation traces.
//!
//! A trace opens with four header numbers, one per line: suggested heap
//! size, number of distinct ids, number of operations and a weight. Every
//! following line is one operation on an id:
//!
//! ```text
//! a <id> <bytes>    allocate
//! r <id> <bytes>    reallocate
//! f <id>            free
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Parsing also checks
//! that ids stay in range and that frees and reallocs only touch live ids.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// One trace operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Alloc { id: usize, size: usize },
    Realloc { id: usize, size: usize },
    Free { id: usize },
}

impl TraceOp {
    #[must_use]
    pub fn id(self) -> usize {
        match self {
            Self::Alloc { id, .. } | Self::Realloc { id, .. } | Self::Free { id } => id,
        }
    }
}

/// A parsed trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    /// File stem for traces read from disk.
    pub name: String,
    pub suggested_heap_size: usize,
    pub num_ids: usize,
    pub weight: u32,
    pub ops: Vec<TraceOp>,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: missing header field `{field}`")]
    MissingHeader { line: usize, field: &'static str },
    #[error("line {line}: invalid {field} {value:?}")]
    BadNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: unrecognized operation {text:?}")]
    BadOp { line: usize, text: String },
    #[error("line {line}: id {id} is outside 0..{num_ids}")]
    IdOutOfRange {
        line: usize,
        id: usize,
        num_ids: usize,
    },
    #[error("line {line}: id {id} is not live")]
    UnknownId { line: usize, id: usize },
    #[error("line {line}: id {id} is already live")]
    IdInUse { line: usize, id: usize },
    #[error("line {line}: id count {num_ids} exceeds the limit of {max}")]
    IdCountTooLarge {
        line: usize,
        num_ids: usize,
        max: usize,
    },
    #[error("header promises {expected} operations, found {actual}")]
    OpCountMismatch { expected: usize, actual: usize },
}

const HEADER_FIELDS: [&str; 4] = ["heap size", "id count", "op count", "weight"];

/// Largest id count a trace header may declare.
pub const MAX_TRACE_IDS: usize = 1 << 20;

/// Ops reserved up front; longer traces grow the vector as they parse.
const OP_PREALLOC: usize = 1 << 20;

impl Trace {
    /// Parses trace text. The result is named `inline`.
    pub fn parse(text: &str) -> Result<Self, TraceError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let mut header = [0usize; 4];
        let mut header_lines = [0usize; 4];
        let mut last_line = 0;
        for ((slot, field), at) in header.iter_mut().zip(HEADER_FIELDS).zip(&mut header_lines) {
            let Some((line, value)) = lines.next() else {
                return Err(TraceError::MissingHeader {
                    line: last_line + 1,
                    field,
                });
            };
            *slot = parse_number(line, field, value)?;
            *at = line;
            last_line = line;
        }
        let [suggested_heap_size, num_ids, num_ops, weight] = header;
        let weight = u32::try_from(weight).map_err(|_| TraceError::BadNumber {
            line: last_line,
            field: "weight",
            value: weight.to_string(),
        })?;

        if num_ids > MAX_TRACE_IDS {
            return Err(TraceError::IdCountTooLarge {
                line: header_lines[1],
                num_ids,
                max: MAX_TRACE_IDS,
            });
        }

        let mut live = vec![false; num_ids];
        let mut ops = Vec::with_capacity(num_ops.min(OP_PREALLOC));
        for (line, text) in lines {
            let op = parse_op(line, text)?;
            let id = op.id();
            let Some(is_live) = live.get_mut(id) else {
                return Err(TraceError::IdOutOfRange { line, id, num_ids });
            };
            match op {
                TraceOp::Alloc { .. } if *is_live => return Err(TraceError::IdInUse { line, id }),
                TraceOp::Alloc { .. } => *is_live = true,
                TraceOp::Realloc { .. } if !*is_live => {
                    return Err(TraceError::UnknownId { line, id });
                }
                TraceOp::Realloc { .. } => {}
                TraceOp::Free { .. } if !*is_live => return Err(TraceError::UnknownId { line, id }),
                TraceOp::Free { .. } => *is_live = false,
            }
            ops.push(op);
        }

        if ops.len() != num_ops {
            return Err(TraceError::OpCountMismatch {
                expected: num_ops,
                actual: ops.len(),
            });
        }
        Ok(Self {
            name: "inline".to_string(),
            suggested_heap_size,
            num_ids,
            weight,
            ops,
        })
    }

    /// Reads and parses a trace file, naming it after the file stem.
    pub fn from_file(path: &Path) -> Result<Self, TraceError> {
        let text = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut trace = Self::parse(&text)?;
        if let Some(stem) = path.file_stem() {
            trace.name = stem.to_string_lossy().into_owned();
        }
        Ok(trace)
    }

    /// Renders the trace back into `.rep` text.
    #[must_use]
    pub fn to_rep(&self) -> String {
        let mut out = format!(
            "{}\n{}\n{}\n{}\n",
            self.suggested_heap_size,
            self.num_ids,
            self.ops.len(),
            self.weight
        );
        for op in &self.ops {
            let line = match *op {
                TraceOp::Alloc { id, size } => format!("a {id} {size}\n"),
                TraceOp::Realloc { id, size } => format!("r {id} {size}\n"),
                TraceOp::Free { id } => format!("f {id}\n"),
            };
            out.push_str(&line);
        }
        out
    }
}

fn parse_number(line: usize, field: &'static str, value: &str) -> Result<usize, TraceError> {
    value.parse().map_err(|_| TraceError::BadNumber {
        line,
        field,
        value: value.to_string(),
    })
}

fn parse_op(line: usize, text: &str) -> Result<TraceOp, TraceError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    match tokens.as_slice() {
        ["a", id, size] => Ok(TraceOp::Alloc {
            id: parse_number(line, "id", id)?,
            size: parse_number(line, "size", size)?,
        }),
        ["r", id, size] => Ok(TraceOp::Realloc {
            id: parse_number(line, "id", id)?,
            size: parse_number(line, "size", size)?,
        }),
        ["f", id] => Ok(TraceOp::Free {
            id: parse_number(line, "id", id)?,
        }),
        _ => Err(TraceError::BadOp {
            line,
            text: text.to_string(),
        }),
    }
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // A zero state never leaves zero.
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Generates a well-formed trace of at most `ops` operations with request
/// sizes in `1..=max_size`. Every id is allocated once and freed by the end.
#[must_use]
pub fn synth(seed: u64, ops: usize, max_size: usize) -> Trace {
    let mut rng = XorShift64::new(seed);
    let max_size = max_size.max(1);
    let mut out = Vec::with_capacity(ops);
    let mut live: Vec<(usize, usize)> = Vec::new();
    let mut live_bytes = 0usize;
    let mut peak = 0usize;
    let mut next_id = 0;

    // Pending frees for live ids count against the budget.
    while out.len() + live.len() < ops {
        let budget = ops - out.len() - live.len();
        let roll = rng.gen_range(0, 5);
        if budget >= 2 && (live.is_empty() || roll < 3) {
            let size = rng.gen_range(1, max_size);
            out.push(TraceOp::Alloc { id: next_id, size });
            live.push((next_id, size));
            next_id += 1;
            live_bytes += size;
        } else if live.is_empty() {
            break;
        } else {
            let idx = rng.gen_range(0, live.len() - 1);
            if roll == 3 {
                let size = rng.gen_range(1, max_size);
                let (id, old) = live[idx];
                out.push(TraceOp::Realloc { id, size });
                live[idx].1 = size;
                live_bytes = live_bytes - old + size;
            } else {
                let (id, size) = live.swap_remove(idx);
                out.push(TraceOp::Free { id });
                live_bytes -= size;
            }
        }
        peak = peak.max(live_bytes);
    }
    out.extend(live.into_iter().map(|(id, _)| TraceOp::Free { id }));

    Trace {
        name: format!("synth-{seed:016x}"),
        suggested_heap_size: peak,
        num_ids: next_id,
        weight: 1,
        ops: out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &str = "\
20000
2
5
1
a 0 512
a 1 128
r 0 640
f 1
f 0
";

    #[test]
    fn parses_header_and_ops() {
        let trace = Trace::parse(SHORT).unwrap();
        assert_eq!(trace.suggested_heap_size, 20000);
        assert_eq!(trace.num_ids, 2);
        assert_eq!(trace.weight, 1);
        assert_eq!(
            trace.ops,
            vec![
                TraceOp::Alloc { id: 0, size: 512 },
                TraceOp::Alloc { id: 1, size: 128 },
                TraceOp::Realloc { id: 0, size: 640 },
                TraceOp::Free { id: 1 },
                TraceOp::Free { id: 0 },
            ]
        );
    }

    #[test]
    fn rep_text_round_trips() {
        let trace = Trace::parse(SHORT).unwrap();
        assert_eq!(trace.to_rep(), SHORT);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = "# header\n100\n\n1\n2\n1\n# ops\na 0 8\n\nf 0\n";
        assert_eq!(Trace::parse(text).unwrap().ops.len(), 2);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = Trace::parse("100\n1\n1\n1\nx 0 8\n").unwrap_err();
        assert!(matches!(err, TraceError::BadOp { line: 5, .. }), "{err}");

        let err = Trace::parse("100\n1\n1\n1\na 0 lots\n").unwrap_err();
        assert!(matches!(err, TraceError::BadNumber { line: 5, field: "size", .. }));

        let err = Trace::parse("100\n1\n1\n1\na 3 8\n").unwrap_err();
        assert!(matches!(err, TraceError::IdOutOfRange { line: 5, id: 3, num_ids: 1 }));

        let err = Trace::parse("100\n1\n").unwrap_err();
        assert!(matches!(err, TraceError::MissingHeader { line: 3, field: "op count" }));
    }

    #[test]
    fn oversized_id_count_is_rejected_before_allocating() {
        let err = Trace::parse(&format!("0\n{}\n0\n1\n", usize::MAX)).unwrap_err();
        assert!(
            matches!(
                err,
                TraceError::IdCountTooLarge {
                    line: 2,
                    num_ids: usize::MAX,
                    max: MAX_TRACE_IDS
                }
            ),
            "{err}"
        );

        let over = format!("# ids below\n0\n{}\n0\n1\n", MAX_TRACE_IDS + 1);
        let err = Trace::parse(&over).unwrap_err();
        assert!(matches!(err, TraceError::IdCountTooLarge { line: 3, .. }), "{err}");

        let at_limit = format!("0\n{MAX_TRACE_IDS}\n1\n1\na 0 8\n");
        assert_eq!(Trace::parse(&at_limit).unwrap().num_ids, MAX_TRACE_IDS);
    }

    #[test]
    fn liveness_is_enforced() {
        let err = Trace::parse("100\n1\n1\n1\nf 0\n").unwrap_err();
        assert!(matches!(err, TraceError::UnknownId { line: 5, id: 0 }));

        let err = Trace::parse("100\n1\n2\n1\na 0 8\na 0 8\n").unwrap_err();
        assert!(matches!(err, TraceError::IdInUse { line: 6, id: 0 }));

        let err = Trace::parse("100\n1\n2\n1\na 0 8\n").unwrap_err();
        assert!(matches!(
            err,
            TraceError::OpCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn synth_traces_are_well_formed() {
        for (seed, ops) in [(1, 1000), (0, 17), (0xDEAD_BEEF, 2)] {
            let trace = synth(seed, ops, 300);
            assert!(trace.ops.len() <= ops);
            assert!(trace.ops.len() + 1 >= ops);
            let reparsed = Trace::parse(&trace.to_rep()).unwrap();
            assert_eq!(reparsed.ops, trace.ops);
            assert!(trace.ops.iter().all(|op| match *op {
                TraceOp::Alloc { size, .. } | TraceOp::Realloc { size, .. } =>
                    (1..=300).contains(&size),
                TraceOp::Free { .. } => true,
            }));
        }
    }

    #[test]
    fn synth_is_deterministic() {
        assert_eq!(synth(7, 500, 64), synth(7, 500, 64));
        assert_ne!(synth(7, 500, 64).ops, synth(8, 500, 64).ops);
    }
}
