//! Blob store error types.

use thiserror::Error;

/// Blob store errors
#[derive(Debug, Error)]
pub enum BlobError {
    /// Blob exceeds the configured size cap
    #[error("blob too large: {size} bytes exceeds cap of {max} bytes")]
    TooLarge {
        /// Size of the rejected content
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// No blob stored under the given hash
    #[error("unknown blob: {0}")]
    NotFound(String),

    /// Metadata record could not be parsed
    #[error("corrupt metadata for blob {hash}: {source}")]
    CorruptMeta {
        /// Blob hash
        hash: String,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },

    /// Underlying storage failure
    #[error(transparent)]
    Storage(#[from] peervault_storage::StorageError),
}
