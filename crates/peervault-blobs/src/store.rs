//! The content-addressed blob store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use peervault_storage::Storage;

use crate::{BlobError, Result};

/// Default blob size cap: 500 MiB.
pub const DEFAULT_MAX_BLOB_SIZE: usize = 500 * 1024 * 1024;

/// Upper bound on concurrent existence probes in `get_missing`.
const MISSING_PROBE_BATCH: usize = 20;

/// Upper bound on concurrent metadata reads when summing sizes.
const SIZE_SUM_BATCH: usize = 10;

const BLOB_PREFIX: &str = "blob:";
const META_PREFIX: &str = "blob-meta:";

/// Metadata persisted next to each blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    /// Content size in bytes
    pub size: u64,
    /// MIME type, when the importer knew one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Number of document nodes referencing this hash
    pub ref_count: u32,
}

/// Result of an orphan-reclamation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrphanReport {
    /// Blobs removed
    pub count: usize,
    /// Content bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Blobs that failed to delete (pass continues past them)
    pub failed: usize,
}

/// Content-addressed blob store with reference counting.
pub struct BlobStore {
    storage: Arc<dyn Storage>,
    max_blob_size: usize,
    // Total-size cache; invalidated by any mutation
    total_size: Mutex<Option<u64>>,
}

impl BlobStore {
    /// Create a store over `storage` with the default size cap.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_max_size(storage, DEFAULT_MAX_BLOB_SIZE)
    }

    /// Create a store with a custom per-blob size cap.
    #[must_use]
    pub fn with_max_size(storage: Arc<dyn Storage>, max_blob_size: usize) -> Self {
        Self {
            storage,
            max_blob_size,
            total_size: Mutex::new(None),
        }
    }

    /// Hex SHA-256 of `content`.
    #[must_use]
    pub fn hash_content(content: &[u8]) -> String {
        hex::encode(Sha256::digest(content))
    }

    fn blob_key(hash: &str) -> String {
        format!("{BLOB_PREFIX}{hash}")
    }

    fn meta_key(hash: &str) -> String {
        format!("{META_PREFIX}{hash}")
    }

    async fn invalidate_total(&self) {
        *self.total_size.lock().await = None;
    }

    /// Add content, returning its hash.
    ///
    /// If the hash already exists the reference count is incremented and no
    /// bytes are written.
    ///
    /// # Errors
    ///
    /// Returns `BlobError::TooLarge` above the configured cap (nothing is
    /// written), or a storage error.
    pub async fn add(&self, content: &[u8], mime_type: Option<&str>) -> Result<String> {
        if content.len() > self.max_blob_size {
            return Err(BlobError::TooLarge {
                size: content.len(),
                max: self.max_blob_size,
            });
        }

        let hash = Self::hash_content(content);

        if let Some(mut meta) = self.read_meta(&hash).await? {
            meta.ref_count += 1;
            self.write_meta(&hash, &meta).await?;
            debug!(hash = %hash, ref_count = meta.ref_count, "blob ref count incremented");
            return Ok(hash);
        }

        let meta = BlobMeta {
            size: content.len() as u64,
            mime_type: mime_type.map(String::from),
            created_at: now_ms(),
            ref_count: 1,
        };
        self.storage.write(&Self::blob_key(&hash), content).await?;
        self.write_meta(&hash, &meta).await?;
        self.invalidate_total().await;
        debug!(hash = %hash, size = meta.size, "blob added");
        Ok(hash)
    }

    /// Read the content at `hash`.
    ///
    /// # Errors
    ///
    /// Returns `BlobError::NotFound` for unknown hashes.
    pub async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        self.storage
            .read(&Self::blob_key(hash))
            .await?
            .ok_or_else(|| BlobError::NotFound(hash.to_string()))
    }

    /// Whether content exists at `hash`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn has(&self, hash: &str) -> Result<bool> {
        Ok(self.storage.exists(&Self::blob_key(hash)).await?)
    }

    /// Read the metadata record for `hash`.
    ///
    /// # Errors
    ///
    /// Returns `BlobError::NotFound` for unknown hashes.
    pub async fn get_meta(&self, hash: &str) -> Result<BlobMeta> {
        self.read_meta(hash)
            .await?
            .ok_or_else(|| BlobError::NotFound(hash.to_string()))
    }

    async fn read_meta(&self, hash: &str) -> Result<Option<BlobMeta>> {
        match self.storage.read(&Self::meta_key(hash)).await? {
            Some(bytes) => {
                let meta =
                    serde_json::from_slice(&bytes).map_err(|source| BlobError::CorruptMeta {
                        hash: hash.to_string(),
                        source,
                    })?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    async fn write_meta(&self, hash: &str, meta: &BlobMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta).expect("blob meta serializes");
        self.storage.write(&Self::meta_key(hash), &bytes).await?;
        Ok(())
    }

    /// List every stored hash.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list(&self) -> Result<Vec<String>> {
        let keys = self.storage.list_prefix(META_PREFIX).await?;
        Ok(keys
            .into_iter()
            .map(|k| k[META_PREFIX.len()..].to_string())
            .collect())
    }

    /// Decrement the reference count at `hash`; at zero, content and
    /// metadata are removed. Returns the remaining count.
    ///
    /// # Errors
    ///
    /// Returns `BlobError::NotFound` for unknown hashes.
    pub async fn release(&self, hash: &str) -> Result<u32> {
        let mut meta = self.get_meta(hash).await?;
        meta.ref_count = meta.ref_count.saturating_sub(1);

        if meta.ref_count == 0 {
            self.storage.delete(&Self::blob_key(hash)).await?;
            self.storage.delete(&Self::meta_key(hash)).await?;
            self.invalidate_total().await;
            debug!(hash = %hash, "blob released and removed");
        } else {
            self.write_meta(hash, &meta).await?;
        }
        Ok(meta.ref_count)
    }

    /// Of `hashes`, return those with no stored content, probing in bounded
    /// concurrent batches.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn get_missing(&self, hashes: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for batch in hashes.chunks(MISSING_PROBE_BATCH) {
            let mut probes = JoinSet::new();
            for hash in batch {
                let storage = Arc::clone(&self.storage);
                let hash = hash.clone();
                probes.spawn(async move {
                    let exists = storage.exists(&BlobStore::blob_key(&hash)).await?;
                    Ok::<_, BlobError>((hash, exists))
                });
            }
            while let Some(joined) = probes.join_next().await {
                let (hash, exists) = joined.expect("probe task panicked")?;
                if !exists {
                    missing.push(hash);
                }
            }
        }
        missing.sort();
        Ok(missing)
    }

    /// Total content bytes across all blobs. Cached until the next mutation.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn total_size(&self) -> Result<u64> {
        let mut cached = self.total_size.lock().await;
        if let Some(total) = *cached {
            return Ok(total);
        }

        let hashes = self.list().await?;
        let mut total = 0u64;
        for batch in hashes.chunks(SIZE_SUM_BATCH) {
            let mut reads = JoinSet::new();
            for hash in batch {
                let storage = Arc::clone(&self.storage);
                let key = Self::meta_key(hash);
                reads.spawn(async move { storage.read(&key).await });
            }
            while let Some(joined) = reads.join_next().await {
                if let Some(bytes) = joined.expect("meta read task panicked")? {
                    if let Ok(meta) = serde_json::from_slice::<BlobMeta>(&bytes) {
                        total += meta.size;
                    }
                }
            }
        }

        *cached = Some(total);
        Ok(total)
    }

    /// Hashes present in the store but absent from `referenced`.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn find_orphans(&self, referenced: &HashSet<String>) -> Result<Vec<String>> {
        let mut orphans: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|h| !referenced.contains(h))
            .collect();
        orphans.sort();
        Ok(orphans)
    }

    /// Remove every orphan. Per-blob failures are counted and skipped; the
    /// pass never aborts part-way.
    ///
    /// # Errors
    ///
    /// Propagates only the initial listing failure.
    pub async fn clean_orphans(&self, referenced: &HashSet<String>) -> Result<OrphanReport> {
        let orphans = self.find_orphans(referenced).await?;
        let mut report = OrphanReport::default();

        for hash in &orphans {
            let size = match self.read_meta(hash).await {
                Ok(Some(meta)) => meta.size,
                Ok(None) => 0,
                Err(e) => {
                    warn!(hash = %hash, error = %e, "skipping orphan with unreadable metadata");
                    report.failed += 1;
                    continue;
                }
            };

            let deleted = async {
                self.storage.delete(&Self::blob_key(hash)).await?;
                self.storage.delete(&Self::meta_key(hash)).await?;
                Ok::<(), BlobError>(())
            };
            match deleted.await {
                Ok(()) => {
                    report.count += 1;
                    report.bytes_reclaimed += size;
                }
                Err(e) => {
                    warn!(hash = %hash, error = %e, "failed to delete orphan blob");
                    report.failed += 1;
                }
            }
        }

        if report.count > 0 {
            self.invalidate_total().await;
        }
        debug!(
            removed = report.count,
            bytes = report.bytes_reclaimed,
            failed = report.failed,
            "orphan cleanup complete"
        );
        Ok(report)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
