//! Named symmetric ciphers.
//!
//! Every cipher is an AEAD with a random nonce per message, so encrypting the
//! same plaintext twice yields different ciphertexts while decryption stays a
//! pure function of key and ciphertext.
//!
//! ## Ciphertext layout
//!
//! ```text
//! +-----------------+------------------------------+
//! | nonce (12 / 24) | sealed plaintext + tag (16)  |
//! +-----------------+------------------------------+
//! ```

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20poly1305::XChaCha20Poly1305;
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::random::fill_random;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM nonce size
pub const AES_NONCE_SIZE: usize = 12;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Authentication tag size shared by both AEADs
pub const TAG_SIZE: usize = 16;

/// Symmetric cipher capability set.
pub trait Cipher: Send + Sync {
    /// Wire name of the cipher.
    fn name(&self) -> &'static str;

    /// Current key bytes.
    fn key(&self) -> &[u8];

    /// Replace the key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] when the cipher cannot use
    /// a key of this length.
    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError>;

    /// Nonce length prefixed to every ciphertext.
    fn nonce_size(&self) -> usize;

    /// Encrypt under an explicit nonce.
    ///
    /// # Errors
    ///
    /// Returns an error if the nonce length is wrong or the key is unset.
    fn encrypt_with_nonce(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt a `nonce || sealed` buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unset or the CSPRNG fails.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = vec![0u8; self.nonce_size()];
        fill_random(&mut nonce)?;
        self.encrypt_with_nonce(&nonce, plaintext)
    }
}

/// Cipher family selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherAlgorithm {
    /// AES-GCM, key length picks AES-128/192/256
    #[default]
    Aes,
    /// XChaCha20-Poly1305
    XChaCha20,
}

impl CipherAlgorithm {
    /// Resolve by name; unknown names (including legacy block ciphers this
    /// build does not carry) resolve to AES.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "xchacha20" | "chacha20" | "xchacha20poly1305" => Self::XChaCha20,
            _ => Self::Aes,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes => "aes",
            Self::XChaCha20 => "xchacha20",
        }
    }
}

/// Build an unkeyed cipher by name.
#[must_use]
pub fn create_cipher(name: &str) -> Box<dyn Cipher> {
    match CipherAlgorithm::from_name(name) {
        CipherAlgorithm::Aes => Box::new(AesCipher::default()),
        CipherAlgorithm::XChaCha20 => Box::new(XChaChaCipher::default()),
    }
}

/// Build a cipher by name and install `key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyLength`] if the key does not suit the cipher.
pub fn create_cipher_with_key(name: &str, key: &[u8]) -> Result<Box<dyn Cipher>, CryptoError> {
    let mut cipher = create_cipher(name);
    cipher.set_key(key)?;
    Ok(cipher)
}

fn split_nonce(ciphertext: &[u8], nonce_size: usize) -> Result<(&[u8], &[u8]), CryptoError> {
    if ciphertext.len() < nonce_size + TAG_SIZE {
        return Err(CryptoError::Truncated(ciphertext.len()));
    }
    Ok(ciphertext.split_at(nonce_size))
}

fn seal<A: Aead>(aead: &A, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let sealed = aead
        .encrypt(nonce.into(), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let mut out = Vec::with_capacity(nonce.len() + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open<A: Aead>(aead: &A, nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    aead.decrypt(nonce.into(), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// AES-GCM with a 128, 192 or 256-bit key.
#[derive(Default)]
pub struct AesCipher {
    key: Zeroizing<Vec<u8>>,
}

impl AesCipher {
    /// AES-256-GCM keyed with a fixed-size key; cannot fail.
    #[must_use]
    pub fn from_key256(key: &[u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
        }
    }

    fn invalid_key(&self) -> CryptoError {
        CryptoError::InvalidKeyLength {
            expected: 32,
            actual: self.key.len(),
        }
    }
}

impl Cipher for AesCipher {
    fn name(&self) -> &'static str {
        CipherAlgorithm::Aes.name()
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: key.len(),
            });
        }
        self.key = Zeroizing::new(key.to_vec());
        Ok(())
    }

    fn nonce_size(&self) -> usize {
        AES_NONCE_SIZE
    }

    fn encrypt_with_nonce(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != AES_NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength);
        }
        match self.key.len() {
            16 => seal(&Aes128Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, plaintext),
            24 => seal(&Aes192Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, plaintext),
            32 => seal(&Aes256Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, plaintext),
            _ => Err(self.invalid_key()),
        }
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (nonce, sealed) = split_nonce(ciphertext, AES_NONCE_SIZE)?;
        match self.key.len() {
            16 => open(&Aes128Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, sealed),
            24 => open(&Aes192Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, sealed),
            32 => open(&Aes256Gcm::new_from_slice(&self.key).map_err(|_| self.invalid_key())?, nonce, sealed),
            _ => Err(self.invalid_key()),
        }
    }
}

/// XChaCha20-Poly1305 with a 256-bit key.
#[derive(Default)]
pub struct XChaChaCipher {
    key: Zeroizing<Vec<u8>>,
}

impl XChaChaCipher {
    fn aead(&self) -> Result<XChaCha20Poly1305, CryptoError> {
        XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: self.key.len(),
        })
    }
}

impl Cipher for XChaChaCipher {
    fn name(&self) -> &'static str {
        CipherAlgorithm::XChaCha20.name()
    }

    fn key(&self) -> &[u8] {
        &self.key
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: key.len(),
            });
        }
        self.key = Zeroizing::new(key.to_vec());
        Ok(())
    }

    fn nonce_size(&self) -> usize {
        XCHACHA_NONCE_SIZE
    }

    fn encrypt_with_nonce(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != XCHACHA_NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength);
        }
        seal(&self.aead()?, nonce, plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (nonce, sealed) = split_nonce(ciphertext, XCHACHA_NONCE_SIZE)?;
        open(&self.aead()?, nonce, sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_cipher_falls_back_to_aes() {
        for name in ["mars", "rc6", "serpent", "twofish", "", "AES"] {
            assert_eq!(create_cipher(name).name(), "aes");
        }
        assert_eq!(create_cipher("xchacha20").name(), "xchacha20");
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let cipher = create_cipher_with_key("aes", &[7u8; 32]).unwrap();
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"same plaintext");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_aes_key_sizes() {
        for len in [16, 24, 32] {
            let cipher = create_cipher_with_key("aes", &vec![1u8; len]).unwrap();
            let ct = cipher.encrypt(b"payload").unwrap();
            assert_eq!(cipher.decrypt(&ct).unwrap(), b"payload");
        }
        assert!(create_cipher_with_key("aes", &[1u8; 20]).is_err());
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let cipher = create_cipher_with_key("xchacha20", &[9u8; 32]).unwrap();
        let ct = cipher.encrypt(b"payload").unwrap();
        assert_eq!(ct.len(), XCHACHA_NONCE_SIZE + 7 + TAG_SIZE);
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = create_cipher_with_key("aes", &[1u8; 32]).unwrap();
        let b = create_cipher_with_key("aes", &[2u8; 32]).unwrap();
        let ct = a.encrypt(b"secret").unwrap();
        assert!(matches!(b.decrypt(&ct), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_truncated_ciphertext() {
        let cipher = create_cipher_with_key("aes", &[1u8; 32]).unwrap();
        assert!(matches!(cipher.decrypt(&[0u8; 8]), Err(CryptoError::Truncated(8))));
    }

    #[test]
    fn test_unkeyed_cipher_errors() {
        let cipher = create_cipher("aes");
        assert!(cipher.encrypt(b"x").is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sealed_len_is_nonce_plus_tag(
                xchacha in any::<bool>(),
                plaintext in prop::collection::vec(any::<u8>(), 0..1024),
            ) {
                let name = if xchacha { "xchacha20" } else { "aes" };
                let cipher = create_cipher_with_key(name, &[3u8; 32]).unwrap();
                let sealed = cipher.encrypt(&plaintext).unwrap();
                prop_assert_eq!(sealed.len(), cipher.nonce_size() + plaintext.len() + TAG_SIZE);
                prop_assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
            }

            #[test]
            fn flipped_bit_rejected(
                plaintext in prop::collection::vec(any::<u8>(), 1..256),
                index in any::<prop::sample::Index>(),
            ) {
                let cipher = create_cipher_with_key("aes", &[5u8; 32]).unwrap();
                let mut sealed = cipher.encrypt(&plaintext).unwrap();
                let at = index.index(sealed.len());
                sealed[at] ^= 0x01;
                prop_assert!(cipher.decrypt(&sealed).is_err());
            }
        }
    }
}
