//! OS randomness helpers.

use crate::CryptoError;

/// Fill a buffer with cryptographically secure random bytes.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if the OS entropy source fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a fixed-size array of random bytes.
///
/// # Errors
///
/// Returns `CryptoError::RandomFailed` if the OS entropy source fails.
pub fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut out = [0u8; N];
    fill_random(&mut out)?;
    Ok(out)
}
