//! Password-based key derivation (PBKDF2-HMAC over a named hash).

use zeroize::Zeroizing;

use crate::hash::{HashAlgorithm, with_digest};

/// Lowest iteration count accepted; smaller values are raised to it.
pub const MIN_ITERATIONS: u32 = 1;

/// PBKDF2 keyed by hash name.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pbkdf {
    algorithm: HashAlgorithm,
}

impl Pbkdf {
    /// Create a PBKDF for the named hash (SHA-1 when unknown).
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            algorithm: HashAlgorithm::from_name(name),
        }
    }

    /// Underlying hash.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Derive `output_size` bytes from `secret` and `salt`.
    #[must_use]
    pub fn compute(
        &self,
        secret: &[u8],
        salt: &[u8],
        iterations: u32,
        output_size: usize,
    ) -> Zeroizing<Vec<u8>> {
        let rounds = iterations.max(MIN_ITERATIONS);
        let mut out = Zeroizing::new(vec![0u8; output_size]);
        with_digest!(self.algorithm, D => pbkdf2::pbkdf2_hmac::<D>(secret, salt, rounds, &mut out));
        out
    }
}
