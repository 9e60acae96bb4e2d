//! # Demonsaw Files
//!
//! Transfer engine building blocks for the Demonsaw protocol.
//!
//! This crate provides:
//! - Chunk addressing and an idempotent per-transfer claim set
//! - Lock-free progress, speed and ETA accounting
//! - Retry policy and poll backoff
//! - Download/upload admission with upload priority
//! - Positional chunk file I/O

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod file;
pub mod scheduler;
pub mod transfer;

pub use chunk::{Chunk, ChunkSet};
pub use error::TransferError;
pub use file::{FileReader, FileWriter};
pub use scheduler::{Limits, PriorityPolicy, Queued, TransferQueue};
pub use transfer::{Transfer, format_time, should_retry, wait_backoff};

/// Default chunk size (768 KiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 768 * 1024;

/// Smallest chunk size (1 KiB)
pub const MIN_CHUNK_SIZE: u64 = 1024;

/// Largest chunk size (32 MiB)
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Files below this size are transferred by a single shard (4 MiB)
pub const DEFAULT_THREAD_SIZE: u64 = 4 * 1024 * 1024;

/// Number of shards to run for a transfer.
///
/// Small files and routers on the legacy 2.5 line (or that report no
/// version) get a single shard.
#[must_use]
pub fn shard_count(configured: usize, file_size: u64, thread_size: u64, router_version: &str) -> usize {
    let configured = configured.max(1);
    if file_size < thread_size {
        return 1;
    }
    if router_version.is_empty() || router_version.starts_with("2.5") {
        return 1;
    }
    configured
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_count_small_file() {
        assert_eq!(shard_count(4, 1024, DEFAULT_THREAD_SIZE, "2.7.2"), 1);
        assert_eq!(shard_count(4, DEFAULT_THREAD_SIZE, DEFAULT_THREAD_SIZE, "2.7.2"), 4);
    }

    #[test]
    fn test_shard_count_legacy_router() {
        let big = 64 * 1024 * 1024;
        assert_eq!(shard_count(4, big, DEFAULT_THREAD_SIZE, "2.5.1"), 1);
        assert_eq!(shard_count(4, big, DEFAULT_THREAD_SIZE, ""), 1);
        assert_eq!(shard_count(4, big, DEFAULT_THREAD_SIZE, "2.6.0"), 4);
        assert_eq!(shard_count(0, big, DEFAULT_THREAD_SIZE, "2.6.0"), 1);
    }
}
