//! Publishing and pulling encrypted deltas.

use std::sync::Arc;

use peervault_crypto::VaultKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::bucket::ObjectBucket;
use crate::manifest::{
    CloudManifest, CommitRecord, DeltaMeta, VaultLayout, MANIFEST_FORMAT_VERSION,
};
use crate::{CloudError, Result};

/// AAD binding delta ciphertexts to their object id.
fn delta_aad(delta_id: &str) -> Vec<u8> {
    format!("peervault-delta:{delta_id}").into_bytes()
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    /// New head commit hash
    pub head_commit: String,
    /// Id of the published delta
    pub delta_id: String,
    /// Encrypted delta size in bytes
    pub delta_size: u64,
}

/// Outcome of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Decrypted delta payloads, oldest first, ready for import
    pub deltas: Vec<Vec<u8>>,
    /// Remote head after the pull, to persist as the local cloud head
    pub head_commit: Option<String>,
}

/// Encrypted delta-log sync against one vault prefix of a bucket.
pub struct CloudSync {
    bucket: Arc<dyn ObjectBucket>,
    layout: VaultLayout,
    key: VaultKey,
    vault_id: String,
}

impl CloudSync {
    /// Create a sync engine for `vault_id` under `prefix`.
    #[must_use]
    pub fn new(
        bucket: Arc<dyn ObjectBucket>,
        prefix: &str,
        vault_id: &str,
        key: VaultKey,
    ) -> Self {
        Self {
            bucket,
            layout: VaultLayout::new(prefix, vault_id),
            key,
            vault_id: vault_id.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.bucket.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CloudError::Corrupt {
                    key: key.to_string(),
                    detail: e.to_string(),
                }),
        }
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).expect("record serializes");
        self.bucket.put(key, &bytes).await
    }

    /// Read the manifest, verifying it was written under the same vault
    /// key.
    ///
    /// # Errors
    ///
    /// Fails with `KeyMismatch` when the fingerprints differ.
    pub async fn read_manifest(&self) -> Result<Option<CloudManifest>> {
        let Some(manifest) = self
            .get_json::<CloudManifest>(&self.layout.manifest())
            .await?
        else {
            return Ok(None);
        };
        let local = self.key.fingerprint().to_string();
        if manifest.key_fingerprint != local {
            return Err(CloudError::KeyMismatch {
                manifest: manifest.key_fingerprint,
                local,
            });
        }
        Ok(Some(manifest))
    }

    /// The remote head commit hash, if any.
    pub async fn remote_head(&self) -> Result<Option<String>> {
        Ok(self
            .bucket
            .get(&self.layout.head_ref())
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())
            .filter(|head| !head.is_empty()))
    }

    /// Publish one incremental update batch as an encrypted delta and
    /// advance `refs/HEAD`.
    ///
    /// `doc_version` is the publisher's version vector; it travels sealed
    /// inside the commit so other devices can pick a `since` without
    /// decrypting deltas.
    ///
    /// # Errors
    ///
    /// Propagates bucket and crypto failures.
    pub async fn push(
        &self,
        updates: &[u8],
        doc_version: &[u8],
        timestamp_ms: i64,
    ) -> Result<PushResult> {
        let previous_head = self.remote_head().await?;
        let previous_manifest = self.read_manifest().await?;

        let content_hash = hex::encode(&Sha256::digest(updates)[..8]);
        let delta_id = format!("{timestamp_ms}-{content_hash}");

        let sealed = self.key.seal(updates, &delta_aad(&delta_id))?;
        let sealed_doc_version = self.key.seal(doc_version, &delta_aad(&delta_id))?;
        self.bucket
            .put(&self.layout.delta(&delta_id), &sealed)
            .await?;

        let previous_delta_id = previous_manifest
            .as_ref()
            .and_then(|m| m.latest_delta_id.clone());
        let delta = DeltaMeta {
            id: delta_id.clone(),
            timestamp: timestamp_ms,
            hash: hex::encode(Sha256::digest(&sealed)),
            size: sealed.len() as u64,
            encrypted_doc_version: hex::encode(&sealed_doc_version),
            previous_delta_id,
        };

        // Commit hash covers the delta object and the parent commit
        let mut hasher = Sha256::new();
        hasher.update(&sealed);
        if let Some(parent) = &previous_head {
            hasher.update(parent.as_bytes());
        }
        let commit_hash = hex::encode(hasher.finalize());

        let commit = CommitRecord {
            hash: commit_hash.clone(),
            timestamp: timestamp_ms,
            delta,
            previous_commit: previous_head,
        };
        self.put_json(&self.layout.commit(&commit_hash), &commit)
            .await?;
        self.bucket
            .put(&self.layout.head_ref(), commit_hash.as_bytes())
            .await?;

        let manifest = CloudManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            vault_id: self.vault_id.clone(),
            created_at: previous_manifest
                .as_ref()
                .map_or(timestamp_ms, |m| m.created_at),
            updated_at: timestamp_ms,
            head_commit: Some(commit_hash.clone()),
            latest_delta_id: Some(delta_id.clone()),
            key_fingerprint: self.key.fingerprint().to_string(),
            sequence: Some(
                previous_manifest
                    .as_ref()
                    .and_then(|m| m.sequence)
                    .unwrap_or(0)
                    + 1,
            ),
        };
        self.put_json(&self.layout.manifest(), &manifest).await?;

        info!(
            delta = %delta_id,
            head = %commit_hash,
            bytes = sealed.len(),
            "delta published"
        );
        Ok(PushResult {
            head_commit: commit_hash,
            delta_id,
            delta_size: sealed.len() as u64,
        })
    }

    /// Fetch and decrypt every delta published after `local_head`,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Fails on a broken commit chain, a missing delta object, or a
    /// decryption failure.
    pub async fn pull(&self, local_head: Option<&str>) -> Result<PullResult> {
        let Some(remote_head) = self.remote_head().await? else {
            return Ok(PullResult {
                deltas: Vec::new(),
                head_commit: None,
            });
        };
        if Some(remote_head.as_str()) == local_head {
            return Ok(PullResult {
                deltas: Vec::new(),
                head_commit: Some(remote_head),
            });
        }
        // Verify the key before walking the chain
        self.read_manifest().await?;

        // Walk commits newest-to-oldest until the local head
        let mut chain = Vec::new();
        let mut cursor = Some(remote_head.clone());
        while let Some(hash) = cursor {
            if Some(hash.as_str()) == local_head {
                break;
            }
            let key = self.layout.commit(&hash);
            let commit: CommitRecord = self
                .get_json(&key)
                .await?
                .ok_or_else(|| CloudError::MissingObject(key))?;
            cursor = commit.previous_commit.clone();
            chain.push(commit);
        }
        chain.reverse();

        let mut deltas = Vec::with_capacity(chain.len());
        for commit in &chain {
            let key = self.layout.delta(&commit.delta.id);
            let sealed = self
                .bucket
                .get(&key)
                .await?
                .ok_or_else(|| CloudError::MissingObject(key))?;
            let plain = self.key.open(&sealed, &delta_aad(&commit.delta.id))?;
            deltas.push(plain);
        }

        debug!(count = deltas.len(), head = %remote_head, "deltas pulled");
        Ok(PullResult {
            deltas,
            head_commit: Some(remote_head),
        })
    }
}
