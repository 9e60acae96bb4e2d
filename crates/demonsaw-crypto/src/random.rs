//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use rand_core::{OsRng, RngCore};

use crate::CryptoError;

/// Default size of a random session or transfer id, in bytes.
pub const ID_SIZE: usize = 16;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|_| CryptoError::RandomFailed)
}

/// Generate `len` random bytes.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random hex id of [`ID_SIZE`] bytes.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the underlying OS CSPRNG fails.
pub fn random_id() -> Result<String, CryptoError> {
    random_bytes(ID_SIZE).map(hex::encode)
}
