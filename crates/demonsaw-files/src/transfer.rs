//! Per-file transfer accounting.
//!
//! A [`Transfer`] is shared by every shard working on one file. Counters are
//! atomics so shards report progress without a lock; the claim set and the
//! outstanding-request list carry their own locks.
//!
//! ## Lifecycle
//!
//! ```text
//!   queued --resume()--> active --stop()--> stopped --resume()--> active ...
//!                          |
//!                          +-- size >= file_size --> complete
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::chunk::{Chunk, ChunkSet};

/// Poll delays applied after consecutive empty responses, in milliseconds.
pub const WAIT_BACKOFF_MS: [u64; 10] = [0, 100, 100, 200, 300, 500, 800, 1300, 2100, 3400];

/// Backoff delay for the `attempt`-th consecutive empty poll.
#[must_use]
pub fn wait_backoff(attempt: usize) -> Duration {
    let index = attempt.min(WAIT_BACKOFF_MS.len() - 1);
    Duration::from_millis(WAIT_BACKOFF_MS[index])
}

/// Whether a cancelled transfer goes back to the pending list.
///
/// A transfer that made progress since its last reset may retry as long as
/// retries are enabled; a stalled one is bounded by `max_retries`.
#[must_use]
pub fn should_retry(max_retries: usize, retries: usize, updated: bool) -> bool {
    max_retries > 0 && (updated || retries < max_retries)
}

/// Render milliseconds as `HH:MM:SS`, rounding up by one second so that a
/// running transfer never shows all zeros.
#[must_use]
pub fn format_time(ms: u64) -> String {
    if ms == 0 {
        return "00:00:00".to_string();
    }
    let secs = ms / 1000 + 1;
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

#[derive(Debug)]
struct Clock {
    started: Instant,
    touched: Instant,
}

impl Clock {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            touched: now,
        }
    }
}

/// Shared progress state of one file transfer.
#[derive(Debug)]
pub struct Transfer {
    file_size: u64,
    size: AtomicU64,
    progress: AtomicU64,
    chunk: AtomicU64,
    shards: AtomicUsize,
    retries: AtomicUsize,
    stopped: AtomicBool,
    valid: AtomicBool,
    updated: AtomicBool,
    clock: Mutex<Clock>,
    chunks: ChunkSet,
    requests: Mutex<BTreeSet<u64>>,
}

impl Transfer {
    /// Create a stopped transfer for a file of `file_size` bytes.
    #[must_use]
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            size: AtomicU64::new(0),
            progress: AtomicU64::new(0),
            chunk: AtomicU64::new(0),
            shards: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            stopped: AtomicBool::new(true),
            valid: AtomicBool::new(false),
            updated: AtomicBool::new(false),
            clock: Mutex::new(Clock::new()),
            chunks: ChunkSet::new(),
            requests: Mutex::new(BTreeSet::new()),
        }
    }

    fn clock(&self) -> MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============ Sizes ============

    /// File size in bytes.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes transferred so far.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Overwrite the transferred size (used when resuming from disk).
    pub fn set_size(&self, size: u64) {
        self.size.store(size.min(self.file_size), Ordering::Release);
    }

    /// Bytes transferred since the last resume.
    #[must_use]
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Bytes left.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.size())
    }

    /// Record `bytes` of newly transferred data.
    pub fn update(&self, bytes: u64) {
        let file_size = self.file_size;
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |size| {
                Some(size.saturating_add(bytes).min(file_size))
            });
        self.progress.fetch_add(bytes, Ordering::AcqRel);
        self.updated.store(true, Ordering::Release);
        self.clock().touched = Instant::now();
    }

    /// Whether every byte has arrived.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.size() >= self.file_size
    }

    /// Fraction complete in `[0, 1]`; an empty file counts as done.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        let size = self.size();
        if self.file_size > 0 && size < self.file_size {
            size as f64 / self.file_size as f64
        } else {
            1.0
        }
    }

    // ============ Chunks ============

    /// Claim set shared by this transfer's shards.
    #[must_use]
    pub fn chunks(&self) -> &ChunkSet {
        &self.chunks
    }

    /// Pick the next chunk with [`Transfer::next_chunk`], claim it and
    /// advance the cursor to it.
    ///
    /// Losing a race to another shard moves on to the next gap. Returns
    /// `None` once the pick lands past the end of the file, off a stride
    /// boundary, or on an offset that is already taken.
    #[must_use]
    pub fn claim_next(&self, chunk_size: u64) -> Option<Chunk> {
        if chunk_size == 0 {
            return None;
        }
        let mut lost = None;
        loop {
            let offset = self.next_chunk(chunk_size);
            if offset >= self.file_size || offset % chunk_size != 0 || lost == Some(offset) {
                return None;
            }
            if self.chunks.add_chunk(offset) {
                self.chunk.store(offset, Ordering::Release);
                return Some(Chunk::at(offset, self.file_size, chunk_size));
            }
            lost = Some(offset);
        }
    }

    /// First unclaimed offset, or the transferred size once none is left.
    #[must_use]
    pub fn next_chunk(&self, chunk_size: u64) -> u64 {
        self.chunks
            .next_chunk(self.file_size, chunk_size, self.size())
    }

    /// Offset most recently handed to a shard.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.chunk.load(Ordering::Acquire)
    }

    /// Remember that `offset` has been requested from the remote side.
    pub fn add_request(&self, offset: u64) -> bool {
        self.requests().insert(offset)
    }

    /// Forget a satisfied or abandoned request.
    pub fn remove_request(&self, offset: u64) -> bool {
        self.requests().remove(&offset)
    }

    /// Outstanding requests.
    #[must_use]
    pub fn requests_len(&self) -> usize {
        self.requests().len()
    }

    // ============ Shards ============

    /// Register a running shard, returning the new count.
    pub fn add_shard(&self) -> usize {
        self.shards.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregister a shard, returning the remaining count.
    pub fn remove_shard(&self) -> usize {
        let previous = self
            .shards
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Running shards.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards.load(Ordering::Acquire)
    }

    // ============ Lifecycle ============

    /// Arm the transfer for a (new) run: clear the request list, zero the
    /// speed accumulator and restart the timer/timeout pair.
    pub fn resume(&self) {
        self.requests().clear();
        self.progress.store(0, Ordering::Release);
        *self.clock() = Clock::new();
        self.stopped.store(false, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Halt: zero the shard count and drop in-flight claims.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.valid.store(false, Ordering::Release);
        self.shards.store(0, Ordering::Release);
        self.chunks.clear_claims();
    }

    /// Clear the progress-since-reset marker.
    pub fn reset(&self) {
        self.updated.store(false, Ordering::Release);
    }

    /// Whether [`Transfer::stop`] was called since the last resume.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether the transfer is in flight.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Whether progress was made since the last [`Transfer::reset`].
    #[must_use]
    pub fn updated(&self) -> bool {
        self.updated.load(Ordering::Acquire)
    }

    /// Count one retry, returning the new total.
    pub fn add_retry(&self) -> usize {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Retries used.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Acquire)
    }

    // ============ Metrics ============

    /// Time since the last resume.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock().started.elapsed()
    }

    /// Time since data last arrived (or since resume).
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.clock().touched.elapsed()
    }

    /// Bytes per second since resume; the raw byte count under one second.
    #[must_use]
    pub fn speed(&self) -> u64 {
        let progress = self.progress();
        match self.elapsed().as_secs() {
            0 => progress,
            secs => progress / secs,
        }
    }

    /// Estimated remaining milliseconds while in flight, elapsed otherwise.
    #[must_use]
    pub fn time_ms(&self) -> u64 {
        let elapsed = self.elapsed().as_millis() as u64;
        let progress = self.progress();
        if self.valid() && progress > 0 {
            (elapsed as f64 * (self.remaining() as f64 / progress as f64)) as u64
        } else {
            elapsed
        }
    }

    /// [`Transfer::time_ms`] rendered as `HH:MM:SS`.
    #[must_use]
    pub fn time(&self) -> String {
        format_time(self.time_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_boundary() {
        let transfer = Transfer::new(1000);
        transfer.update(999);
        assert!(!transfer.complete());
        transfer.update(1);
        assert!(transfer.complete());
        assert_eq!(transfer.ratio(), 1.0);
    }

    #[test]
    fn test_size_capped_at_file_size() {
        let transfer = Transfer::new(100);
        transfer.update(250);
        assert_eq!(transfer.size(), 100);
        assert_eq!(transfer.remaining(), 0);
    }

    #[test]
    fn test_ratio_monotonic_and_empty_file() {
        let transfer = Transfer::new(10);
        let mut last = transfer.ratio();
        for _ in 0..10 {
            transfer.update(1);
            let ratio = transfer.ratio();
            assert!(ratio >= last);
            last = ratio;
        }
        assert_eq!(Transfer::new(0).ratio(), 1.0);
        assert!(Transfer::new(0).complete());
    }

    #[test]
    fn test_claim_next_short_tail() {
        let kib = 1024;
        let transfer = Transfer::new(300 * kib);
        let first = transfer.claim_next(128 * kib).unwrap();
        let second = transfer.claim_next(128 * kib).unwrap();
        let third = transfer.claim_next(128 * kib).unwrap();
        assert_eq!(first, Chunk { offset: 0, size: 131_072 });
        assert_eq!(second, Chunk { offset: 131_072, size: 131_072 });
        assert_eq!(third, Chunk { offset: 262_144, size: 38_912 });
        assert_eq!(transfer.cursor(), 262_144);
        assert!(transfer.claim_next(128 * kib).is_none());
        assert!(transfer.claim_next(0).is_none());
    }

    #[test]
    fn test_claim_next_skips_taken_offsets() {
        let kib = 1024;
        let transfer = Transfer::new(300 * kib);
        assert!(transfer.chunks().add_chunk(0));
        transfer.chunks().ack_chunk(128 * kib);
        transfer.update(128 * kib);

        assert_eq!(transfer.claim_next(128 * kib).map(|c| c.offset), Some(256 * kib));

        // Every stride taken: the fallback is the transferred size, which is
        // already acknowledged, so nothing is claimed
        assert_eq!(transfer.next_chunk(128 * kib), 128 * kib);
        assert!(transfer.claim_next(128 * kib).is_none());

        transfer.chunks().release(0);
        assert_eq!(transfer.claim_next(128 * kib).map(|c| c.offset), Some(0));
    }

    #[test]
    fn test_two_shards_split_file() {
        use std::sync::Arc;

        let kib = 1024;
        let transfer = Arc::new(Transfer::new(300 * kib));
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let transfer = Arc::clone(&transfer);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    while let Some(chunk) = transfer.claim_next(128 * kib) {
                        mine.push(chunk);
                    }
                    mine
                })
            })
            .collect();

        let mut all: Vec<Chunk> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort();
        assert_eq!(
            all,
            vec![
                Chunk { offset: 0, size: 131_072 },
                Chunk { offset: 131_072, size: 131_072 },
                Chunk { offset: 262_144, size: 38_912 },
            ]
        );
        assert_eq!(transfer.chunks().claimed(), 3);
    }

    #[test]
    fn test_stop_clears_shards_and_claims() {
        let transfer = Transfer::new(4096);
        transfer.resume();
        transfer.add_shard();
        transfer.add_shard();
        assert!(transfer.chunks().add_chunk(0));
        transfer.stop();
        assert_eq!(transfer.shards(), 0);
        assert!(transfer.chunks().add_chunk(0));
        assert!(!transfer.valid());
        assert!(transfer.stopped());
    }

    #[test]
    fn test_resume_clears_requests_and_progress() {
        let transfer = Transfer::new(4096);
        transfer.resume();
        transfer.add_request(0);
        transfer.update(512);
        transfer.resume();
        assert_eq!(transfer.requests_len(), 0);
        assert_eq!(transfer.progress(), 0);
        assert_eq!(transfer.size(), 512);
        assert!(transfer.valid());
    }

    #[test]
    fn test_retry_budget_boundary() {
        let max_retries = 3;
        let transfer = Transfer::new(100);
        for _ in 0..max_retries {
            transfer.add_retry();
        }
        transfer.reset();
        assert!(!should_retry(max_retries, transfer.retries(), transfer.updated()));

        // Progress since the reset keeps it alive
        transfer.update(1);
        assert!(should_retry(max_retries, transfer.retries(), transfer.updated()));

        // Retries disabled entirely
        assert!(!should_retry(0, 0, true));
    }

    #[test]
    fn test_speed_sub_second_is_raw_bytes() {
        let transfer = Transfer::new(1 << 20);
        transfer.resume();
        transfer.update(4096);
        assert_eq!(transfer.speed(), 4096);
    }

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0), "00:00:00");
        assert_eq!(format_time(1), "00:00:01");
        assert_eq!(format_time(59_000), "00:01:00");
        assert_eq!(format_time(3_600_000), "01:00:01");
    }

    #[test]
    fn test_time_falls_back_to_elapsed_when_not_valid() {
        let transfer = Transfer::new(100);
        assert!(!transfer.valid());
        assert!(transfer.time_ms() < 1000);
    }

    #[test]
    fn test_wait_backoff_saturates() {
        assert_eq!(wait_backoff(0), Duration::ZERO);
        assert_eq!(wait_backoff(4), Duration::from_millis(300));
        assert_eq!(wait_backoff(100), Duration::from_millis(3400));
    }

    #[test]
    fn test_shard_counter() {
        let transfer = Transfer::new(1);
        assert_eq!(transfer.add_shard(), 1);
        assert_eq!(transfer.add_shard(), 2);
        assert_eq!(transfer.remove_shard(), 1);
        assert_eq!(transfer.remove_shard(), 0);
        assert_eq!(transfer.remove_shard(), 0);
    }
}
