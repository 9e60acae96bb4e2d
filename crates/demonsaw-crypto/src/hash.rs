//! Named hash and HMAC algorithms.
//!
//! Algorithms are selected by the lowercase names exchanged on the wire.
//! Unrecognized names resolve to SHA-1 so that peers announcing algorithms
//! this build does not know still agree on a digest.

use hmac::{Hmac as HmacImpl, Mac};
use sha2::Digest;
use zeroize::Zeroizing;

use crate::CryptoError;

/// Dispatch a generic body over the concrete digest type of an algorithm.
macro_rules! with_digest {
    ($alg:expr, $d:ident => $body:expr) => {
        match $alg {
            HashAlgorithm::Md5 => {
                type $d = md5::Md5;
                $body
            }
            HashAlgorithm::Sha1 => {
                type $d = sha1::Sha1;
                $body
            }
            HashAlgorithm::Sha224 => {
                type $d = sha2::Sha224;
                $body
            }
            HashAlgorithm::Sha256 => {
                type $d = sha2::Sha256;
                $body
            }
            HashAlgorithm::Sha384 => {
                type $d = sha2::Sha384;
                $body
            }
            HashAlgorithm::Sha512 => {
                type $d = sha2::Sha512;
                $body
            }
        }
    };
}

pub(crate) use with_digest;

/// Hash algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5 (legacy peers only)
    Md5,
    /// SHA-1, the fallback for unknown names
    #[default]
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Resolve an algorithm by name, falling back to SHA-1.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "md5" => Self::Md5,
            "sha1" => Self::Sha1,
            "sha224" => Self::Sha224,
            "sha256" => Self::Sha256,
            "sha384" => Self::Sha384,
            "sha512" => Self::Sha512,
            _ => Self::Sha1,
        }
    }

    /// Wire name of the algorithm.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest size in bytes.
    #[must_use]
    pub fn output_size(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Hash `data` in one shot.
    #[must_use]
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        with_digest!(self, D => D::digest(data).to_vec())
    }
}

/// Keyed HMAC with an appended salt.
///
/// `compute(input)` authenticates `input || salt` under `key`, matching the
/// way group ids are folded.
pub struct Hmac {
    algorithm: HashAlgorithm,
    key: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
}

impl Hmac {
    /// Create an HMAC for the named algorithm (SHA-1 when unknown).
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_algorithm(HashAlgorithm::from_name(name))
    }

    /// Create an HMAC for a resolved algorithm.
    #[must_use]
    pub fn with_algorithm(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            key: Zeroizing::new(Vec::new()),
            salt: Vec::new(),
        }
    }

    /// Set the MAC key.
    pub fn set_key(&mut self, key: &[u8]) {
        self.key = Zeroizing::new(key.to_vec());
    }

    /// Set the salt appended to every input.
    pub fn set_salt(&mut self, salt: &[u8]) {
        self.salt = salt.to_vec();
    }

    /// Algorithm in use.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Authenticate `input || salt`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyDerivationFailed`] if the MAC rejects the key.
    pub fn compute(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        with_digest!(self.algorithm, D => {
            let mut mac = <HmacImpl<D> as Mac>::new_from_slice(&self.key)
                .map_err(|_| CryptoError::KeyDerivationFailed)?;
            mac.update(input);
            mac.update(&self.salt);
            Ok(mac.finalize().into_bytes().to_vec())
        })
    }

    /// Authenticate and hex-encode.
    ///
    /// # Errors
    ///
    /// See [`Hmac::compute`].
    pub fn compute_hex(&self, input: &[u8]) -> Result<String, CryptoError> {
        self.compute(input).map(hex::encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_name_falls_back_to_sha1() {
        assert_eq!(HashAlgorithm::from_name("whirlpool"), HashAlgorithm::Sha1);
        assert_eq!(HashAlgorithm::from_name(""), HashAlgorithm::Sha1);
        assert_eq!(HashAlgorithm::from_name("SHA256"), HashAlgorithm::Sha256);
    }

    #[test]
    fn test_digest_sizes() {
        for alg in [
            HashAlgorithm::Md5,
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha224,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(alg.digest(b"demonsaw").len(), alg.output_size());
        }
    }

    #[test]
    fn test_sha256_known_vector() {
        let digest = HashAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_salt_is_appended() {
        let mut salted = Hmac::new("sha256");
        salted.set_key(b"key");
        salted.set_salt(b"salt");

        let mut plain = Hmac::new("sha256");
        plain.set_key(b"key");

        // Salt behaves exactly like a suffix on the input
        assert_eq!(
            salted.compute(b"input").unwrap(),
            plain.compute(b"inputsalt").unwrap()
        );
    }

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let mut hmac = Hmac::new("sha256");
        hmac.set_key(b"Jefe");
        let out = hmac.compute_hex(b"what do ya want for nothing?").unwrap();
        assert_eq!(
            out,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
