//! Arena growth.
//!
//! The allocator never holds raw addresses: every block, pointer and link is
//! an offset into one contiguous region owned by an [`ArenaProvider`]. The
//! provider only has to grow that region at its high-water mark, the way
//! `sbrk` moves the program break.

use crate::error::ArenaError;

/// Largest arena an allocator can address with one-word links.
pub const MAX_ARENA_SIZE: usize = (u32::MAX as usize).saturating_add(1);

/// Default byte limit for [`MemArena`].
pub const DEFAULT_HEAP_LIMIT: usize = 20 * (1 << 20);

/// Source of arena bytes.
pub trait ArenaProvider {
    /// Extends the region by exactly `additional` bytes directly after the
    /// current break and returns the old break. On failure the region is left
    /// untouched.
    fn grow(&mut self, additional: usize) -> Result<usize, ArenaError>;

    /// The whole current region.
    fn bytes(&self) -> &[u8];

    /// The whole current region, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Current break.
    fn len(&self) -> usize {
        self.bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory arena over an owned, zero-initialized `Vec<u8>` with a byte
/// limit.
#[derive(Debug, Clone)]
pub struct MemArena {
    bytes: Vec<u8>,
    limit: usize,
}

impl MemArena {
    /// Creates an empty arena that refuses to grow past `limit` bytes.
    /// The limit is clamped to [`MAX_ARENA_SIZE`].
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit: limit.min(MAX_ARENA_SIZE),
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for MemArena {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_LIMIT)
    }
}

impl ArenaProvider for MemArena {
    fn grow(&mut self, additional: usize) -> Result<usize, ArenaError> {
        let old_brk = self.bytes.len();
        let exhausted = ArenaError::Exhausted {
            requested: additional,
            used: old_brk,
            limit: self.limit,
        };
        let new_brk = old_brk.checked_add(additional).ok_or(exhausted.clone())?;
        if new_brk > self.limit {
            return Err(exhausted);
        }
        self.bytes.try_reserve_exact(additional)?;
        self.bytes.resize(new_brk, 0);
        Ok(old_brk)
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_returns_previous_break() {
        let mut arena = MemArena::new(1024);
        assert!(arena.is_empty());
        assert_eq!(arena.grow(16).unwrap(), 0);
        assert_eq!(arena.grow(32).unwrap(), 16);
        assert_eq!(arena.len(), 48);
        assert!(arena.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn grow_preserves_existing_contents() {
        let mut arena = MemArena::new(1 << 16);
        arena.grow(8).unwrap();
        arena.bytes_mut().copy_from_slice(b"segalloc");
        arena.grow(4096).unwrap();
        assert_eq!(&arena.bytes()[..8], b"segalloc");
    }

    #[test]
    fn grow_past_limit_fails_without_side_effects() {
        let mut arena = MemArena::new(64);
        arena.grow(48).unwrap();
        let err = arena.grow(32).unwrap_err();
        assert_eq!(
            err,
            ArenaError::Exhausted {
                requested: 32,
                used: 48,
                limit: 64
            }
        );
        assert_eq!(arena.len(), 48);
        assert_eq!(arena.grow(16).unwrap(), 48);
    }

    #[test]
    fn overflowing_request_is_exhaustion() {
        let mut arena = MemArena::new(64);
        arena.grow(8).unwrap();
        assert!(matches!(
            arena.grow(usize::MAX),
            Err(ArenaError::Exhausted { .. })
        ));
    }

    #[test]
    fn limit_is_clamped_to_offset_range() {
        assert_eq!(MemArena::new(usize::MAX).limit(), MAX_ARENA_SIZE);
        assert_eq!(MemArena::default().limit(), DEFAULT_HEAP_LIMIT);
    }
}
