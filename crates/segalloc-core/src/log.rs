//! Allocator lifecycle records.
//!
//! The allocator does not write anywhere. It keeps structured records in
//! memory; callers read or drain them and decide where they go (the harness
//! turns them into JSONL).

use serde::{Deserialize, Serialize};

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parse a level filter (case-insensitive). `None` means logging is off;
    /// unknown strings yield `Err(())`.
    #[allow(clippy::result_unit_err)]
    pub fn parse_filter(s: &str) -> Result<Option<Self>, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "all" => Ok(Some(Self::Trace)),
            "debug" => Ok(Some(Self::Debug)),
            "info" | "default" => Ok(Some(Self::Info)),
            "warn" | "warning" => Ok(Some(Self::Warn)),
            "error" => Ok(Some(Self::Error)),
            "off" | "none" | "disabled" => Ok(None),
            _ => Err(()),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    pub level: AllocatorLogLevel,
    /// API symbol (`malloc`, `free`, `calloc`, `realloc`, `check`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `heap_extend`, `oom`, ...).
    pub event: &'static str,
    /// Payload offset involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Size-class bucket involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<usize>,
    /// Outcome label (`success`, `oom`, `noop`, ...).
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: arena break.
    pub heap_size: usize,
    /// Snapshot: bytes held by allocated blocks.
    pub allocated_bytes: usize,
    /// Snapshot: number of allocated blocks.
    pub allocated_blocks: usize,
}

/// Fields of a record supplied by the caller; the log fills in ids and the
/// caller-provided snapshot.
pub(crate) struct RecordFields {
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub bucket: Option<usize>,
    pub outcome: &'static str,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Snapshot {
    pub heap_size: usize,
    pub allocated_bytes: usize,
    pub allocated_blocks: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct LifecycleLog {
    threshold: Option<AllocatorLogLevel>,
    next_decision_id: u64,
    records: Vec<AllocatorLogRecord>,
}

impl LifecycleLog {
    pub fn new(threshold: Option<AllocatorLogLevel>) -> Self {
        Self {
            threshold,
            next_decision_id: 1,
            records: Vec::new(),
        }
    }

    pub fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.threshold.is_some_and(|min| level >= min)
    }

    pub fn record(
        &mut self,
        level: AllocatorLogLevel,
        fields: RecordFields,
        details: impl Into<String>,
        snapshot: Snapshot,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        self.records.push(AllocatorLogRecord {
            decision_id,
            trace_id: format!("segalloc::{}::{:016x}", fields.symbol, decision_id),
            level,
            symbol: fields.symbol,
            event: fields.event,
            ptr: fields.ptr,
            size: fields.size,
            bucket: fields.bucket,
            outcome: fields.outcome,
            details: details.into(),
            heap_size: snapshot.heap_size,
            allocated_bytes: snapshot.allocated_bytes,
            allocated_blocks: snapshot.allocated_blocks,
        });
    }

    pub fn records(&self) -> &[AllocatorLogRecord] {
        &self.records
    }

    pub fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(event: &'static str) -> RecordFields {
        RecordFields {
            symbol: "malloc",
            event,
            ptr: Some(16),
            size: Some(24),
            bucket: Some(1),
            outcome: "success",
        }
    }

    #[test]
    fn parse_filter_is_loose() {
        assert_eq!(
            AllocatorLogLevel::parse_filter("TRACE"),
            Ok(Some(AllocatorLogLevel::Trace))
        );
        assert_eq!(
            AllocatorLogLevel::parse_filter(" warning "),
            Ok(Some(AllocatorLogLevel::Warn))
        );
        assert_eq!(AllocatorLogLevel::parse_filter("off"), Ok(None));
        assert_eq!(AllocatorLogLevel::parse_filter("loud"), Err(()));
    }

    #[test]
    fn records_below_threshold_are_dropped() {
        let mut log = LifecycleLog::new(Some(AllocatorLogLevel::Info));
        log.record(
            AllocatorLogLevel::Trace,
            fields("alloc"),
            "dropped",
            Snapshot::default(),
        );
        log.record(
            AllocatorLogLevel::Warn,
            fields("oom"),
            "kept",
            Snapshot::default(),
        );
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.records()[0].event, "oom");
        assert_eq!(log.records()[0].decision_id, 1);
    }

    #[test]
    fn disabled_log_records_nothing() {
        let mut log = LifecycleLog::new(None);
        assert!(!log.enabled(AllocatorLogLevel::Error));
        log.record(
            AllocatorLogLevel::Error,
            fields("heap_check_failed"),
            "",
            Snapshot::default(),
        );
        assert!(log.records().is_empty());
    }

    #[test]
    fn drain_empties_and_ids_keep_increasing() {
        let mut log = LifecycleLog::new(Some(AllocatorLogLevel::Trace));
        log.record(AllocatorLogLevel::Trace, fields("alloc"), "", Snapshot::default());
        let first = log.drain();
        assert_eq!(first.len(), 1);
        assert!(log.records().is_empty());
        log.record(AllocatorLogLevel::Trace, fields("alloc"), "", Snapshot::default());
        assert_eq!(log.records()[0].decision_id, 2);
        assert!(log.records()[0].trace_id.starts_with("segalloc::malloc::"));
    }

    #[test]
    fn record_serializes_without_empty_optionals() {
        let mut log = LifecycleLog::new(Some(AllocatorLogLevel::Trace));
        let mut f = fields("heap_extend");
        f.ptr = None;
        log.record(AllocatorLogLevel::Info, f, "chunk", Snapshot::default());
        let json = serde_json::to_value(&log.records()[0]).unwrap();
        assert_eq!(json["level"], "info");
        assert_eq!(json["event"], "heap_extend");
        assert!(json.get("ptr").is_none());
        assert_eq!(json["size"], 24);
    }
}
