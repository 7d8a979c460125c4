//! Allocator configuration.
//!
//! Defaults match the classic segregated-fit allocator: grow the arena in
//! 4 KiB chunks, cap it at 20 MiB, record Info-and-above lifecycle events and
//! leave the per-call heap check off. Each field can be overridden from the
//! environment:
//!
//! - `SEGALLOC_CHUNK_SIZE`: minimum arena growth step in bytes.
//! - `SEGALLOC_MAX_HEAP`: arena byte limit.
//! - `SEGALLOC_LOG`: `trace`, `debug`, `info`, `warn`, `error` or `off`.
//! - `SEGALLOC_CHECK_HEAP`: `1`/`true`/`on` to validate after every call.

use serde::{Deserialize, Serialize};

use crate::arena::{DEFAULT_HEAP_LIMIT, MAX_ARENA_SIZE};
use crate::block::{MIN_BLOCK_SIZE, is_aligned};
use crate::error::ConfigError;
use crate::log::AllocatorLogLevel;

/// Default arena growth step.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

const ENV_CHUNK_SIZE: &str = "SEGALLOC_CHUNK_SIZE";
const ENV_MAX_HEAP: &str = "SEGALLOC_MAX_HEAP";
const ENV_LOG: &str = "SEGALLOC_LOG";
const ENV_CHECK_HEAP: &str = "SEGALLOC_CHECK_HEAP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Minimum number of bytes requested from the arena on a miss.
    pub chunk_size: usize,
    /// Arena byte limit handed to the default [`MemArena`](crate::MemArena).
    pub max_heap: usize,
    /// Lowest lifecycle level recorded; `None` disables recording.
    pub log_level: Option<AllocatorLogLevel>,
    /// Run the heap validator after every mutating call.
    pub check_heap: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_heap: DEFAULT_HEAP_LIMIT,
            log_level: Some(AllocatorLogLevel::Info),
            check_heap: false,
        }
    }
}

impl AllocatorConfig {
    /// Defaults with any `SEGALLOC_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            config.chunk_size = parse_size(ENV_CHUNK_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_HEAP) {
            config.max_heap = parse_size(ENV_MAX_HEAP, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG) {
            config.log_level =
                AllocatorLogLevel::parse_filter(&raw).map_err(|()| ConfigError::InvalidEnv {
                    var: ENV_LOG,
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup(ENV_CHECK_HEAP) {
            config.check_heap = parse_flag(ENV_CHECK_HEAP, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_BLOCK_SIZE || !is_aligned(self.chunk_size) {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.max_heap > MAX_ARENA_SIZE {
            return Err(ConfigError::HeapLimit {
                limit: self.max_heap,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_max_heap(mut self, max_heap: usize) -> Self {
        self.max_heap = max_heap;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: Option<AllocatorLogLevel>) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_check_heap(mut self, check_heap: bool) -> Self {
        self.check_heap = check_heap;
        self
    }
}

/// Accepts decimal, `0x` hex, `_` separators and a `k`/`m` binary suffix.
fn parse_size(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    };
    let cleaned = raw.trim().replace('_', "").to_ascii_lowercase();
    let (digits, scale) = if let Some(rest) = cleaned.strip_suffix('k') {
        (rest, 1usize << 10)
    } else if let Some(rest) = cleaned.strip_suffix('m') {
        (rest, 1usize << 20)
    } else {
        (cleaned.as_str(), 1)
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        usize::from_str_radix(hex, 16)
    } else {
        digits.parse::<usize>()
    }
    .map_err(|_| invalid())?;
    value.checked_mul(scale).ok_or_else(invalid)
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: raw.to_string(),
        }),
    }
}
