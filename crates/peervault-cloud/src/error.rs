//! Cloud sync error types.

use thiserror::Error;

/// Cloud sync errors
#[derive(Debug, Error)]
pub enum CloudError {
    /// Bucket operation failed
    #[error("bucket error on {key:?}: {detail}")]
    Bucket {
        /// Object key
        key: String,
        /// Failure description from the bucket backend
        detail: String,
    },

    /// Expected object is absent
    #[error("missing object: {0}")]
    MissingObject(String),

    /// A stored record could not be parsed
    #[error("corrupt object at {key}: {detail}")]
    Corrupt {
        /// Object key
        key: String,
        /// Parse failure detail
        detail: String,
    },

    /// The manifest was written under a different vault key
    #[error("vault key mismatch: manifest has {manifest}, local key is {local}")]
    KeyMismatch {
        /// Fingerprint recorded in the manifest
        manifest: String,
        /// Fingerprint of the local key
        local: String,
    },

    /// Cryptographic failure sealing or opening a delta
    #[error(transparent)]
    Crypto(#[from] peervault_crypto::CryptoError),
}
