//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Ciphertext shorter than the nonce it must carry
    #[error("ciphertext truncated: {0} bytes")]
    Truncated(usize),

    /// Invalid nonce length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Diffie-Hellman group parameters rejected
    #[error("invalid group parameters: {0}")]
    InvalidGroup(&'static str),

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Agreement has not been initialized
    #[error("invalid state for operation")]
    InvalidState,

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
