//! # PeerVault Storage
//!
//! A key→bytes storage adapter shared by every persistent component of the
//! vault (CRDT snapshots, blobs, peer records, schema version), with:
//! - [`MemoryStorage`] for tests and ephemeral vaults
//! - [`FileStorage`] for production, one file per key with a bounded LRU
//!   read cache
//! - [`EncryptedStorage`], a transparent at-rest encryption wrapper that
//!   stays readable over legacy plaintext values
//!
//! Adapters guarantee last-writer-wins per key and atomicity per mutating
//! call; `read` of an absent key is `Ok(None)`, never an error.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod encrypted;
pub mod error;
pub mod file;
pub mod memory;

use async_trait::async_trait;

pub use cache::{CacheConfig, ReadCache};
pub use encrypted::{CryptoReport, EncryptedStorage, ENCRYPTION_HEADER_SIZE, ENCRYPTION_MAGIC};
pub use error::StorageError;
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Key→bytes mapping with prefix listing.
///
/// Implementations must make each mutating call atomic per key. Concurrent
/// writers to the same key resolve last-writer-wins.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value at `key`, or `None` if absent.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` at `key`, replacing any existing value.
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Delete the value at `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key starting with `prefix`.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether a value exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;
}
