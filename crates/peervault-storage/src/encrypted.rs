//! Transparent at-rest encryption over any [`Storage`].
//!
//! Encrypted values carry a 16-byte header followed by the AEAD blob:
//!
//! ```text
//! +-------------+--------------+--------------------+---------------------+
//! | magic 'PVE1'| version 0x01 | reserved (11 zero) | nonce || ct || tag  |
//! +-------------+--------------+--------------------+---------------------+
//! ```
//!
//! Values without the header are returned as plaintext, so a vault that
//! enables encryption later keeps reading its history. `reencrypt_all`
//! brings such legacy values under the current key in one pass.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use peervault_crypto::{CryptoError, VaultKey};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::{Result, Storage};

/// Magic bytes of the encrypted-value header.
pub const ENCRYPTION_MAGIC: [u8; 4] = *b"PVE1";

/// Current header version.
pub const ENCRYPTION_VERSION: u8 = 0x01;

/// Total header size in bytes.
pub const ENCRYPTION_HEADER_SIZE: usize = 16;

/// Outcome of a bulk re-encryption pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CryptoReport {
    /// Values written under the current key (or to plaintext for
    /// `decrypt_all`)
    pub changed: usize,
    /// Values left untouched
    pub skipped: usize,
    /// Values that could not be converted
    pub failed: usize,
}

/// Storage wrapper that encrypts values when a key is present.
pub struct EncryptedStorage {
    inner: Arc<dyn Storage>,
    key: RwLock<Option<VaultKey>>,
    /// Keys that must stay plaintext: the key-bootstrap material itself
    /// cannot be sealed under the key it unlocks.
    plaintext_keys: std::collections::HashSet<String>,
}

impl EncryptedStorage {
    /// Wrap `inner`, encrypting with `key` when one is given.
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, key: Option<VaultKey>) -> Self {
        Self {
            inner,
            key: RwLock::new(key),
            plaintext_keys: std::collections::HashSet::new(),
        }
    }

    /// Exempt the given storage keys from encryption entirely.
    #[must_use]
    pub fn with_plaintext_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.plaintext_keys.extend(keys);
        self
    }

    /// Install or replace the encryption key. Existing values are not
    /// rewritten; call [`EncryptedStorage::reencrypt_all`] for that.
    pub fn set_key(&self, key: VaultKey) {
        *self.key.write().expect("key lock poisoned") = Some(key);
    }

    /// Remove the key. Reads of encrypted values will fail until a key is
    /// installed again.
    pub fn clear_key(&self) {
        *self.key.write().expect("key lock poisoned") = None;
    }

    /// Whether writes are currently encrypted.
    #[must_use]
    pub fn encryption_enabled(&self) -> bool {
        self.key.read().expect("key lock poisoned").is_some()
    }

    /// Fingerprint of the active key, when one is installed.
    #[must_use]
    pub fn key_fingerprint(&self) -> Option<String> {
        self.key
            .read()
            .expect("key lock poisoned")
            .as_ref()
            .map(|key| key.fingerprint().to_string())
    }

    /// The inner, unencrypted adapter.
    #[must_use]
    pub fn inner(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.inner)
    }

    fn current_key(&self) -> Option<VaultKey> {
        self.key.read().expect("key lock poisoned").clone()
    }

    /// Whether `value` carries the encryption header.
    #[must_use]
    pub fn is_encrypted(value: &[u8]) -> bool {
        value.len() >= ENCRYPTION_HEADER_SIZE && value[..4] == ENCRYPTION_MAGIC
    }

    fn encrypt_value(key: &VaultKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = key.seal(plaintext, &[])?;
        let mut out = Vec::with_capacity(ENCRYPTION_HEADER_SIZE + sealed.len());
        out.extend_from_slice(&ENCRYPTION_MAGIC);
        out.push(ENCRYPTION_VERSION);
        out.extend_from_slice(&[0u8; 11]);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt_value(key: Option<&VaultKey>, value: Vec<u8>) -> Result<Vec<u8>> {
        if !Self::is_encrypted(&value) {
            return Ok(value);
        }
        let version = value[4];
        if version != ENCRYPTION_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let key = key.ok_or(StorageError::Crypto(CryptoError::KeyMissing))?;
        Ok(key.open(&value[ENCRYPTION_HEADER_SIZE..], &[])?)
    }

    /// Re-encrypt every value under the current key.
    ///
    /// Encrypted values are opened with `previous` when given (key
    /// rotation), otherwise they are assumed to already be under the
    /// current key and are skipped. Plaintext values are encrypted.
    /// `progress(done, total)` is called after each key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyMissing` if no key is installed. Per-value
    /// failures do not abort the pass; they are counted in the report.
    pub async fn reencrypt_all(
        &self,
        previous: Option<&VaultKey>,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<CryptoReport> {
        let key = self
            .current_key()
            .ok_or(StorageError::Crypto(CryptoError::KeyMissing))?;

        let keys = self.inner.list_prefix("").await?;
        let total = keys.len();
        let mut report = CryptoReport::default();

        for (done, storage_key) in keys.iter().enumerate() {
            if self.plaintext_keys.contains(storage_key) {
                report.skipped += 1;
                progress(done + 1, total);
                continue;
            }
            match self.reencrypt_one(&key, previous, storage_key).await {
                Ok(true) => report.changed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "re-encryption failed for value");
                    report.failed += 1;
                }
            }
            progress(done + 1, total);
        }

        debug!(
            changed = report.changed,
            skipped = report.skipped,
            failed = report.failed,
            "re-encryption pass complete"
        );
        Ok(report)
    }

    async fn reencrypt_one(
        &self,
        key: &VaultKey,
        previous: Option<&VaultKey>,
        storage_key: &str,
    ) -> Result<bool> {
        let Some(raw) = self.inner.read(storage_key).await? else {
            return Ok(false);
        };

        let plaintext = if Self::is_encrypted(&raw) {
            match previous {
                Some(old) => Self::decrypt_value(Some(old), raw)?,
                // Already under the current key
                None => return Ok(false),
            }
        } else {
            raw
        };

        let encrypted = Self::encrypt_value(key, &plaintext)?;
        self.inner.write(storage_key, &encrypted).await?;
        Ok(true)
    }

    /// Decrypt every encrypted value back to plaintext.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyMissing` if no key is installed. Per-value
    /// failures are counted, not fatal.
    pub async fn decrypt_all(
        &self,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<CryptoReport> {
        let key = self
            .current_key()
            .ok_or(StorageError::Crypto(CryptoError::KeyMissing))?;

        let keys = self.inner.list_prefix("").await?;
        let total = keys.len();
        let mut report = CryptoReport::default();

        for (done, storage_key) in keys.iter().enumerate() {
            let step = async {
                let Some(raw) = self.inner.read(storage_key).await? else {
                    return Ok::<bool, StorageError>(false);
                };
                if !Self::is_encrypted(&raw) {
                    return Ok(false);
                }
                let plaintext = Self::decrypt_value(Some(&key), raw)?;
                self.inner.write(storage_key, &plaintext).await?;
                Ok(true)
            };
            match step.await {
                Ok(true) => report.changed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "decryption failed for value");
                    report.failed += 1;
                }
            }
            progress(done + 1, total);
        }
        Ok(report)
    }
}

#[async_trait]
impl Storage for EncryptedStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.inner.read(key).await? {
            Some(value) => Ok(Some(Self::decrypt_value(
                self.current_key().as_ref(),
                value,
            )?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.plaintext_keys.contains(key) {
            return self.inner.write(key, value).await;
        }
        match self.current_key() {
            Some(vault_key) => {
                let encrypted = Self::encrypt_value(&vault_key, value)?;
                self.inner.write(key, &encrypted).await
            }
            None => self.inner.write(key, value).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_prefix(prefix).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;

    fn key_a() -> VaultKey {
        VaultKey::from_bytes(&[0xA1; 32]).unwrap()
    }

    fn key_b() -> VaultKey {
        VaultKey::from_bytes(&[0xB2; 32]).unwrap()
    }

    fn encrypted_over_memory(key: Option<VaultKey>) -> (Arc<MemoryStorage>, EncryptedStorage) {
        let inner = Arc::new(MemoryStorage::new());
        let wrapped = EncryptedStorage::new(inner.clone() as Arc<dyn Storage>, key);
        (inner, wrapped)
    }

    #[tokio::test]
    async fn test_roundtrip_encrypted() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("doc", b"secret contents").await.unwrap();

        // On disk: header + ciphertext, not plaintext
        let raw = inner.read("doc").await.unwrap().unwrap();
        assert_eq!(&raw[..4], b"PVE1");
        assert_eq!(raw[4], 0x01);
        assert_eq!(&raw[5..16], &[0u8; 11]);
        assert!(!raw.windows(15).any(|w| w == b"secret contents"));

        assert_eq!(store.read("doc").await.unwrap().unwrap(), b"secret contents");
    }

    #[tokio::test]
    async fn test_plaintext_backward_compat() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        // A value written before encryption was enabled
        inner.write("legacy", b"old plaintext").await.unwrap();
        assert_eq!(
            store.read("legacy").await.unwrap().unwrap(),
            b"old plaintext"
        );
    }

    #[tokio::test]
    async fn test_passthrough_without_key() {
        let (inner, store) = encrypted_over_memory(None);
        store.write("k", b"visible").await.unwrap();
        assert_eq!(inner.read("k").await.unwrap().unwrap(), b"visible");
    }

    #[tokio::test]
    async fn test_encrypted_read_without_key_fails() {
        let (_inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("k", b"secret").await.unwrap();
        store.clear_key();

        assert!(matches!(
            store.read("k").await,
            Err(StorageError::Crypto(CryptoError::KeyMissing))
        ));
    }

    #[tokio::test]
    async fn test_unknown_header_version_rejected() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("k", b"secret").await.unwrap();

        let mut raw = inner.read("k").await.unwrap().unwrap();
        raw[4] = 0x7F;
        inner.write("k", &raw).await.unwrap();

        assert!(matches!(
            store.read("k").await,
            Err(StorageError::UnsupportedVersion(0x7F))
        ));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("k", b"secret").await.unwrap();

        let mut raw = inner.read("k").await.unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        inner.write("k", &raw).await.unwrap();

        assert!(matches!(
            store.read("k").await,
            Err(StorageError::Crypto(CryptoError::TagFailed))
        ));
    }

    #[tokio::test]
    async fn test_reencrypt_all_encrypts_legacy_values() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        inner.write("plain-1", b"one").await.unwrap();
        inner.write("plain-2", b"two").await.unwrap();
        store.write("already", b"three").await.unwrap();

        let mut calls = 0;
        let report = store
            .reencrypt_all(None, |_done, _total| calls += 1)
            .await
            .unwrap();

        assert_eq!(report.changed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(calls, 3);

        for key in ["plain-1", "plain-2", "already"] {
            let raw = inner.read(key).await.unwrap().unwrap();
            assert!(EncryptedStorage::is_encrypted(&raw), "{key} not encrypted");
        }
        assert_eq!(store.read("plain-1").await.unwrap().unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_reencrypt_all_rotates_key() {
        let (_inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("doc", b"contents").await.unwrap();

        let old = key_a();
        store.set_key(key_b());
        let report = store.reencrypt_all(Some(&old), |_, _| {}).await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(store.read("doc").await.unwrap().unwrap(), b"contents");
    }

    #[tokio::test]
    async fn test_decrypt_all() {
        let (inner, store) = encrypted_over_memory(Some(key_a()));
        store.write("a", b"one").await.unwrap();
        inner.write("b", b"two").await.unwrap();

        let report = store.decrypt_all(|_, _| {}).await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);

        assert_eq!(inner.read("a").await.unwrap().unwrap(), b"one");
        assert_eq!(inner.read("b").await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_plaintext_keys_stay_plaintext() {
        let inner = Arc::new(MemoryStorage::new());
        let store = EncryptedStorage::new(inner.clone() as Arc<dyn Storage>, Some(key_a()))
            .with_plaintext_keys(["bootstrap-key".to_string()]);

        store.write("bootstrap-key", b"material").await.unwrap();
        store.write("normal", b"secret").await.unwrap();

        assert_eq!(
            inner.read("bootstrap-key").await.unwrap().unwrap(),
            b"material"
        );
        assert!(EncryptedStorage::is_encrypted(
            &inner.read("normal").await.unwrap().unwrap()
        ));

        // Bulk re-encryption leaves the exempt key alone
        let report = store.reencrypt_all(None, |_, _| {}).await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(
            inner.read("bootstrap-key").await.unwrap().unwrap(),
            b"material"
        );
    }

    #[tokio::test]
    async fn test_reencrypt_counts_failures() {
        let (inner, store) = encrypted_over_memory(Some(key_b()));
        // Encrypted under a key the store no longer has, rotating from the
        // wrong previous key
        let other = EncryptedStorage::new(inner.clone() as Arc<dyn Storage>, Some(key_a()));
        other.write("foreign", b"unreadable").await.unwrap();

        let wrong_previous = key_b();
        let report = store
            .reencrypt_all(Some(&wrong_previous), |_, _| {})
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
    }
}
