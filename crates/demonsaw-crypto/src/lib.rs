//! # Demonsaw Crypto
//!
//! Security primitives for the Demonsaw protocol, selected by the string
//! names peers exchange during the handshake.
//!
//! This crate provides:
//! - Hash and HMAC families (`md5`, `sha1`, `sha224`, `sha256`, `sha384`, `sha512`)
//! - PBKDF2 key derivation over any of those hashes
//! - AEAD ciphers (`aes`, `xchacha20`) with random per-message nonces
//! - Finite-field Diffie-Hellman over safe-prime MODP groups
//! - Secure random ids
//!
//! ## Name resolution
//!
//! | Capability | Known names | Fallback |
//! |------------|-------------|----------|
//! | Hash / HMAC / PBKDF | md5, sha1, sha224, sha256, sha384, sha512 | sha1 |
//! | Cipher | aes, xchacha20 (chacha20) | aes |
//! | Key agreement | dh | - |
//!
//! Falling back instead of failing keeps legacy peers that announce other
//! algorithm names interoperable.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cipher;
pub mod dh;
pub mod error;
pub mod hash;
pub mod pbkdf;
pub mod random;

pub use cipher::{AesCipher, Cipher, CipherAlgorithm, create_cipher, create_cipher_with_key};
pub use dh::DiffieHellman;
pub use error::CryptoError;
pub use hash::{HashAlgorithm, Hmac};
pub use pbkdf::Pbkdf;

/// Parameters that turn a secret into a keyed cipher.
///
/// The same parameters on both ends derive the same cipher from the same
/// secret: `cipher(name, PBKDF(hash, salt, iterations)(secret, key_size / 8))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParameters {
    /// Cipher name
    pub cipher: String,
    /// Key size in bits
    pub key_size: usize,
    /// PBKDF hash name
    pub hash: String,
    /// PBKDF salt
    pub salt: String,
    /// PBKDF iterations
    pub iterations: u32,
}

impl Default for KeyParameters {
    fn default() -> Self {
        Self {
            cipher: CipherAlgorithm::Aes.name().to_string(),
            key_size: 256,
            hash: HashAlgorithm::Sha256.name().to_string(),
            salt: String::new(),
            iterations: 1,
        }
    }
}

impl KeyParameters {
    /// Derive the raw key bytes for `secret`.
    #[must_use]
    pub fn derive_key(&self, secret: &[u8]) -> zeroize::Zeroizing<Vec<u8>> {
        Pbkdf::new(&self.hash).compute(
            secret,
            self.salt.as_bytes(),
            self.iterations,
            self.key_size / 8,
        )
    }

    /// Derive a keyed cipher for `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] when `key_size` does not suit
    /// the named cipher.
    pub fn create_cipher(&self, secret: &[u8]) -> Result<Box<dyn Cipher>, CryptoError> {
        let key = self.derive_key(secret);
        create_cipher_with_key(&self.cipher, &key)
    }
}
