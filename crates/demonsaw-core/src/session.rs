//! Per-connection session state.
//!
//! Before a handshake every session shares the bootstrap cipher derived from
//! a fixed secret (or the configured password). The handshake replaces it with
//! a cipher keyed from the Diffie-Hellman shared secret.

use std::fmt;

use demonsaw_crypto::{AesCipher, Cipher, DiffieHellman, KeyParameters};
use zeroize::Zeroizing;

use crate::error::Result;

/// Secret used for the bootstrap cipher when no password is set.
pub const BOOTSTRAP_SECRET: &str = "demonsaw";

/// Key size of the bootstrap cipher in bits.
pub const BOOTSTRAP_KEY_SIZE: usize = 256;

/// Abbreviate an id for log lines.
#[must_use]
pub fn short_id(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}

/// The bootstrap cipher for `password`, or for [`BOOTSTRAP_SECRET`] when the
/// password is absent or empty. Routers seal handshake traffic with it.
#[must_use]
pub fn bootstrap_cipher(password: Option<&str>) -> Box<dyn Cipher> {
    let secret = password.filter(|p| !p.is_empty()).unwrap_or(BOOTSTRAP_SECRET);
    let params = KeyParameters {
        key_size: BOOTSTRAP_KEY_SIZE,
        ..KeyParameters::default()
    };
    let derived = params.derive_key(secret.as_bytes());
    let mut key = Zeroizing::new([0u8; BOOTSTRAP_KEY_SIZE / 8]);
    key.copy_from_slice(&derived);
    Box::new(AesCipher::from_key256(&key))
}

/// Session state owned by one connection.
pub struct Session {
    id: String,
    name: String,
    password: Option<String>,
    cipher: Box<dyn Cipher>,
    dh: DiffieHellman,
}

impl Session {
    /// A session keyed with the shared bootstrap cipher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            password: None,
            cipher: bootstrap_cipher(None),
            dh: DiffieHellman::new(),
        }
    }

    /// A session whose bootstrap cipher is derived from `password`.
    #[must_use]
    pub fn with_password(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            cipher: bootstrap_cipher(Some(password)),
            ..Self::new()
        }
    }

    /// Router-assigned id, empty before the first handshake.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Store the router-assigned id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Password the bootstrap cipher was derived from.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Current cipher.
    #[must_use]
    pub fn cipher(&self) -> &dyn Cipher {
        self.cipher.as_ref()
    }

    /// Replace the cipher wholesale.
    pub fn set_cipher(&mut self, cipher: Box<dyn Cipher>) {
        self.cipher = cipher;
    }

    /// Key agreement state.
    #[must_use]
    pub fn dh(&self) -> &DiffieHellman {
        &self.dh
    }

    /// Mutable key agreement state.
    pub fn dh_mut(&mut self) -> &mut DiffieHellman {
        &mut self.dh
    }

    /// Drop DH and name state and fall back to the bootstrap cipher. The id
    /// is kept.
    pub fn clear(&mut self) {
        self.dh.clear();
        self.name.clear();
        self.cipher = bootstrap_cipher(self.password.as_deref());
    }

    /// Encrypt under the current cipher.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Crypto`] on cipher failure.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.cipher.encrypt(plaintext)?)
    }

    /// Decrypt under the current cipher.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Crypto`] when authentication fails.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.cipher.decrypt(ciphertext)?)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &short_id(&self.id))
            .field("name", &self.name)
            .field("cipher", &self.cipher.name())
            .field("dh", &self.dh.is_initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demonsaw_crypto::create_cipher_with_key;

    #[test]
    fn test_bootstrap_cipher_shared() {
        let a = Session::new();
        let b = Session::new();
        let sealed = a.encrypt(b"hello").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_password_changes_bootstrap() {
        let open = Session::new();
        let locked = Session::with_password("hunter2");
        let sealed = locked.encrypt(b"hello").unwrap();
        assert!(open.decrypt(&sealed).is_err());
        assert_eq!(Session::with_password("hunter2").decrypt(&sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_clear_restores_bootstrap_keeps_id() {
        let mut session = Session::new();
        session.set_id("abcd");
        session.set_name("alice");
        session.dh_mut().init(128).unwrap();
        session.set_cipher(create_cipher_with_key("aes", &[9u8; 32]).unwrap());

        session.clear();
        assert_eq!(session.id(), "abcd");
        assert!(session.name().is_empty());
        assert!(!session.dh().is_initialized());
        let sealed = Session::new().encrypt(b"x").unwrap();
        assert_eq!(session.decrypt(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_empty_password_is_default() {
        let sealed = Session::with_password("").encrypt(b"x").unwrap();
        assert_eq!(Session::new().decrypt(&sealed).unwrap(), b"x");
        assert_eq!(bootstrap_cipher(None).decrypt(&sealed).unwrap(), b"x");
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(short_id("abc"), "abc");
    }
}
