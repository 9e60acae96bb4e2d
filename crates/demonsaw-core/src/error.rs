//! Error types for the Demonsaw core.
//!
//! Errors fall into four families that drive the state machines:
//!
//! - **Configuration**: malformed endpoints or options. Reported as a
//!   warning; never consumes a retry.
//! - **Transport**: socket open/read/write failures and timeouts. Reported
//!   as an error and followed by a restart with backoff.
//! - **Protocol**: malformed framing, unknown sessions, unsupported message
//!   types. Answered with the matching HTTP status.
//! - **Cryptographic**: failed key agreement or decryption. Always answered
//!   with bad request and never partially applied.

use std::borrow::Cow;

use thiserror::Error;

use crate::http::HttpStatus;

/// Errors raised by the core.
#[derive(Debug, Error)]
pub enum Error {
    // ============ Configuration Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(Cow<'static, str>),

    // ============ Transport Errors ============
    /// Socket operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Protocol Errors ============
    /// Malformed header, message or data
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Remote side answered with a non-OK status
    #[error("Remote status: {0}")]
    Status(HttpStatus),

    // ============ Cryptographic Errors ============
    /// Key agreement, derivation or decryption failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] demonsaw_crypto::CryptoError),

    // ============ Transfer Errors ============
    /// File layer failed
    #[error("Transfer error: {0}")]
    Transfer(#[from] demonsaw_files::TransferError),

    // ============ Operational Errors ============
    /// Entropy source produced nothing
    #[error("{0}")]
    Entropy(String),

    /// The owning machine is stopping
    #[error("Stopped")]
    Stopped,
}

impl Error {
    /// Returns true if a retry after backoff may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Status(status) => status.is_transient(),
            _ => false,
        }
    }

    /// Returns true for configuration problems.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Status reported to a peer whose request caused this error.
    #[must_use]
    pub fn status(&self) -> HttpStatus {
        match self {
            Error::Protocol(_) | Error::Crypto(_) => HttpStatus::BadRequest,
            Error::Status(status) => *status,
            Error::Timeout(_) => HttpStatus::None,
            Error::Config(_)
            | Error::Transport(_)
            | Error::Io(_)
            | Error::Transfer(_)
            | Error::Entropy(_)
            | Error::Stopped => HttpStatus::InternalError,
        }
    }

    /// Create a configuration error with static context
    #[must_use]
    pub const fn config(context: &'static str) -> Self {
        Error::Config(Cow::Borrowed(context))
    }

    /// Create a transport error with static context
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        Error::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        Error::Timeout(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        Error::Protocol(Cow::Borrowed(context))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(Cow::Owned(err.to_string()))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Protocol(Cow::Owned(err.to_string()))
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
