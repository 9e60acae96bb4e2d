//! Transfer error types.

use thiserror::Error;

/// Errors raised by the transfer engine's file layer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Underlying file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk lies outside the file
    #[error("chunk out of range: offset {offset}, size {size}, file size {file_size}")]
    OutOfRange {
        /// Chunk offset
        offset: u64,
        /// Chunk length
        size: u64,
        /// File size
        file_size: u64,
    },

    /// Chunk data length does not match the requested size
    #[error("short chunk at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortChunk {
        /// Chunk offset
        offset: u64,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },
}
