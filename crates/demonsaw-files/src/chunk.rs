//! Chunk addressing and claim tracking.
//!
//! A file is cut into fixed-size strides; the last chunk may be short.
//! Shards race to claim strides through a [`ChunkSet`], which hands each
//! offset to exactly one claimant:
//!
//! ```text
//! file:    |  0  | 128K | 256K (short) |
//! claimed:    A     B
//! next:                   ^ first gap
//! ```

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk {
    /// Byte offset
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl Chunk {
    /// The chunk at `offset` for a file of `file_size` cut into `chunk_size` strides.
    #[must_use]
    pub fn at(offset: u64, file_size: u64, chunk_size: u64) -> Self {
        Self {
            offset,
            size: chunk_size.min(file_size.saturating_sub(offset)),
        }
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Number of chunks a file occupies.
#[must_use]
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

#[derive(Debug, Default)]
struct ChunkState {
    claimed: BTreeSet<u64>,
    acked: BTreeSet<u64>,
}

impl ChunkState {
    fn first_gap(&self, file_size: u64, chunk_size: u64) -> Option<u64> {
        if chunk_size == 0 {
            return None;
        }
        (0..file_size)
            .step_by(usize::try_from(chunk_size).unwrap_or(usize::MAX))
            .find(|offset| !self.claimed.contains(offset) && !self.acked.contains(offset))
    }
}

/// Per-transfer claim set.
///
/// Offsets move from *claimed* (requested, in flight) to *acknowledged*
/// (data received). Both operations are idempotent and report whether the
/// caller was the first to perform them. The set carries its own lock,
/// independent of whatever owns the transfer.
#[derive(Debug, Default)]
pub struct ChunkSet {
    state: Mutex<ChunkState>,
}

impl ChunkSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ChunkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `offset`. Returns `true` only for the first claimant; an offset
    /// that is already claimed or acknowledged is refused.
    pub fn add_chunk(&self, offset: u64) -> bool {
        let mut state = self.lock();
        !state.acked.contains(&offset) && state.claimed.insert(offset)
    }

    /// Record completion of `offset`. Returns `true` only the first time, so
    /// duplicate deliveries are never counted twice.
    pub fn ack_chunk(&self, offset: u64) -> bool {
        let mut state = self.lock();
        state.claimed.remove(&offset);
        state.acked.insert(offset)
    }

    /// Drop an in-flight claim so another shard can take the offset.
    pub fn release(&self, offset: u64) {
        self.lock().claimed.remove(&offset);
    }

    /// Whether `offset` has been acknowledged.
    #[must_use]
    pub fn is_acked(&self, offset: u64) -> bool {
        self.lock().acked.contains(&offset)
    }

    /// First stride neither claimed nor acknowledged, or `fallback` once
    /// every stride below `file_size` is taken.
    #[must_use]
    pub fn next_chunk(&self, file_size: u64, chunk_size: u64, fallback: u64) -> u64 {
        self.lock()
            .first_gap(file_size, chunk_size)
            .unwrap_or(fallback)
    }

    /// Number of in-flight claims.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.lock().claimed.len()
    }

    /// Number of acknowledged chunks.
    #[must_use]
    pub fn acked(&self) -> usize {
        self.lock().acked.len()
    }

    /// Forget in-flight claims, keeping acknowledgements.
    pub fn clear_claims(&self) {
        self.lock().claimed.clear();
    }

    /// Forget everything.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.claimed.clear();
        state.acked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_add_chunk_idempotent() {
        let set = ChunkSet::new();
        assert!(set.add_chunk(0));
        assert!(!set.add_chunk(0));
        assert!(set.add_chunk(4096));
    }

    #[test]
    fn test_acked_offsets_cannot_be_reclaimed() {
        let set = ChunkSet::new();
        assert!(set.add_chunk(0));
        assert!(set.ack_chunk(0));
        assert!(!set.ack_chunk(0));
        assert!(!set.add_chunk(0));
        assert_eq!(set.claimed(), 0);
        assert_eq!(set.acked(), 1);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let set = Arc::new(ChunkSet::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    for offset in (0..64u64).map(|i| i * 1024) {
                        if set.add_chunk(offset) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one winner per offset
        assert_eq!(winners.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_next_chunk_first_gap() {
        let set = ChunkSet::new();
        let kib = 1024;
        assert_eq!(set.next_chunk(300 * kib, 128 * kib, 0), 0);
        set.add_chunk(0);
        set.ack_chunk(128 * kib);
        assert_eq!(set.next_chunk(300 * kib, 128 * kib, 0), 256 * kib);
        set.add_chunk(256 * kib);

        // No gap left: fall back to the caller's transferred size
        assert_eq!(set.next_chunk(300 * kib, 128 * kib, 1234), 1234);
    }

    #[test]
    fn test_release_and_clear_claims() {
        let set = ChunkSet::new();
        set.add_chunk(0);
        set.add_chunk(10);
        set.ack_chunk(20);
        set.release(0);
        assert!(set.add_chunk(0));
        set.clear_claims();
        assert_eq!(set.claimed(), 0);
        assert!(set.is_acked(20));
        set.clear();
        assert!(!set.is_acked(20));
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(10, 0), 0);
    }
}
