//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication tag mismatch)
    #[error("decryption failed: authentication tag mismatch")]
    TagFailed,

    /// No key available for an operation that requires one
    #[error("no key available")]
    KeyMissing,

    /// Key bytes had the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length received
        actual: usize,
    },

    /// Sealed blob too short to contain nonce and tag
    #[error("sealed data truncated: {0} bytes")]
    Truncated(usize),

    /// Key derivation failed
    #[error("key derivation failed: {0}")]
    Derivation(String),

    /// Recovery phrase could not be parsed or has wrong entropy size
    #[error("invalid recovery phrase: {0}")]
    InvalidPhrase(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
