//! # PeerVault Blobs
//!
//! Content-addressed storage for binary attachments. Every blob is keyed by
//! the lowercase hex SHA-256 of its content; alongside the bytes lives a
//! JSON metadata record with a reference count maintained by the document
//! layer. Orphan reclamation takes the set of hashes referenced by the live
//! file tree as ground truth.
//!
//! Layout on the storage adapter:
//! - `blob:<hexhash>` — raw content bytes
//! - `blob-meta:<hexhash>` — metadata record

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod store;

pub use error::BlobError;
pub use store::{BlobMeta, BlobStore, OrphanReport, DEFAULT_MAX_BLOB_SIZE};

/// Result alias for blob operations.
pub type Result<T> = std::result::Result<T, BlobError>;
