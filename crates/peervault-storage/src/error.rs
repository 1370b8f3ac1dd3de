//! Storage error types.

use thiserror::Error;

/// Storage adapter errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("io error on key {key:?}: {source}")]
    Io {
        /// Key being accessed
        key: String,
        /// Source error
        #[source]
        source: std::io::Error,
    },

    /// Key contains bytes that cannot be mapped to the backend
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// Cryptographic failure in the encryption wrapper
    #[error(transparent)]
    Crypto(#[from] peervault_crypto::CryptoError),

    /// Encrypted value header declares a version this build does not know
    #[error("unsupported encryption header version: {0}")]
    UnsupportedVersion(u8),
}

impl StorageError {
    pub(crate) fn io(key: &str, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }
}
