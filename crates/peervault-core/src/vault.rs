//! The vault orchestrator: what the host talks to.
//!
//! `Vault::open` assembles the whole stack — encrypted storage over the
//! host-provided adapter, schema migrations, the CRDT document, the blob
//! store, the garbage collector, and the peer manager — and returns the
//! host event stream. Host file events flow in through the `handle_file_*`
//! methods; everything else happens in background tasks.
//!
//! Key bootstrap: `peervault-transport-key` holds 32 random bytes, kept
//! plaintext; the device secret derived from it seals the vault key at
//! `vaultkey-encrypted`. All other values go through the encryption
//! wrapper once a vault key exists.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use peervault_blobs::{BlobError, BlobStore};
use peervault_crypto::{DeviceSecret, VaultKey};
use peervault_storage::{EncryptedStorage, Storage};

use crate::config::VaultConfig;
use crate::document::VaultDocument;
use crate::events::VaultEvent;
use crate::gc::{GarbageCollector, GcReport};
use crate::keys::{TRANSPORT_KEY, VAULT_KEY_KEY};
use crate::migrations::{MigrationRunner, CURRENT_SCHEMA_VERSION};
use crate::sync::peers::{PeerManager, PeerRecord};
use crate::transport::VaultTransport;
use crate::{Result, VaultError};

/// New content for a file, as supplied by the host shim.
#[derive(Debug, Clone)]
pub enum FileContent {
    /// UTF-8 text content
    Text(String),
    /// Binary content, stored content-addressed
    Binary {
        /// Raw bytes
        bytes: Vec<u8>,
        /// MIME type, when the host knows one
        mime: Option<String>,
    },
}

/// Snapshot of the vault's identity and size for host display.
#[derive(Debug, Clone)]
pub struct VaultStatus {
    /// Stable vault identifier
    pub vault_id: String,
    /// This device's node id
    pub node_id: String,
    /// Live file count
    pub file_count: usize,
    /// Known peers
    pub peer_count: usize,
    /// Fingerprint of the active encryption key, when encryption is on
    pub key_fingerprint: Option<String>,
}

/// One synchronized vault instance.
pub struct Vault {
    config: VaultConfig,
    inner_storage: Arc<dyn Storage>,
    storage: Arc<EncryptedStorage>,
    document: Arc<VaultDocument>,
    blobs: Arc<BlobStore>,
    gc: GarbageCollector,
    peers: Arc<PeerManager>,
    device_secret: DeviceSecret,
    events_tx: mpsc::Sender<VaultEvent>,
    key_installer: JoinHandle<()>,
    file_event_pump: JoinHandle<()>,
}

impl Vault {
    /// Assemble and start a vault over the given storage adapter and
    /// transport. Returns the vault and the host event stream.
    ///
    /// # Errors
    ///
    /// Fails on storage errors, an unreadable sealed vault key, or a
    /// failed schema migration.
    pub async fn open(
        inner_storage: Arc<dyn Storage>,
        transport: Arc<dyn VaultTransport>,
        config: VaultConfig,
    ) -> Result<(Self, mpsc::Receiver<VaultEvent>)> {
        // Device secret, from plaintext bootstrap material
        let material = match inner_storage.read(TRANSPORT_KEY).await? {
            Some(bytes) => bytes,
            None => {
                let mut fresh = [0u8; 32];
                peervault_crypto::fill_random(&mut fresh)?;
                inner_storage.write(TRANSPORT_KEY, &fresh).await?;
                fresh.to_vec()
            }
        };
        let device_secret = DeviceSecret::derive(&material)?;

        // Vault key, when one was created or received before
        let vault_key = match inner_storage.read(VAULT_KEY_KEY).await? {
            Some(sealed) => Some(device_secret.open_vault_key(&sealed)?),
            None => None,
        };
        if let Some(key) = &vault_key {
            info!(fingerprint = %key.fingerprint(), "storage encryption enabled");
        }

        let storage = Arc::new(
            EncryptedStorage::new(Arc::clone(&inner_storage), vault_key).with_plaintext_keys([
                TRANSPORT_KEY.to_string(),
                VAULT_KEY_KEY.to_string(),
            ]),
        );
        let shared: Arc<dyn Storage> = Arc::clone(&storage) as Arc<dyn Storage>;

        // Schema first: the document must not load a stale layout
        let runner = MigrationRunner::new(Arc::clone(&shared));
        if runner.stored_version().await == 0 {
            runner.mark_current().await?;
        } else {
            match runner.run(CURRENT_SCHEMA_VERSION, |_, _| {}).await? {
                crate::migrations::MigrationOutcome::Failed { error, .. } => {
                    return Err(VaultError::MigrationFailed(error));
                }
                _ => {}
            }
        }

        let document = Arc::new(VaultDocument::load(Arc::clone(&shared)).await?);
        let blobs = Arc::new(BlobStore::with_max_size(
            Arc::clone(&shared),
            config.max_blob_size,
        ));
        let gc = GarbageCollector::new(
            Arc::clone(&shared),
            Arc::clone(&document),
            Arc::clone(&blobs),
            config.gc,
        );

        let (events_tx, events_rx) = mpsc::channel(256);
        let (peers, accepted_keys_rx) = PeerManager::new(
            Arc::clone(&shared),
            Arc::clone(&document),
            Arc::clone(&blobs),
            transport,
            config.session,
            config.hostname.clone(),
            config.nickname.clone(),
            events_tx.clone(),
        );
        peers.start().await?;

        let key_installer = Self::spawn_key_installer(
            accepted_keys_rx,
            Arc::clone(&storage),
            Arc::clone(&inner_storage),
            DeviceSecret::derive(&material)?,
            events_tx.clone(),
        );

        // Forward document file events to the host stream
        let file_event_pump = {
            let mut file_events = document.subscribe_file_events();
            let events = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match file_events.recv().await {
                        Ok(event) => {
                            let _ = events.send(VaultEvent::File(event)).await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            })
        };

        let vault = Self {
            config,
            inner_storage,
            storage,
            document,
            blobs,
            gc,
            peers,
            device_secret,
            events_tx,
            key_installer,
            file_event_pump,
        };
        Ok((vault, events_rx))
    }

    /// Installs vault keys accepted during pairing: enables encryption,
    /// persists the key sealed under the device secret, and re-encrypts
    /// existing values.
    fn spawn_key_installer(
        mut accepted_keys: mpsc::Receiver<Vec<u8>>,
        storage: Arc<EncryptedStorage>,
        inner_storage: Arc<dyn Storage>,
        device_secret: DeviceSecret,
        events: mpsc::Sender<VaultEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(payload) = accepted_keys.recv().await {
                let key = match VaultKey::from_bytes(&payload) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "received unusable vault key");
                        continue;
                    }
                };
                let fingerprint = key.fingerprint().to_string();

                let sealed = match device_secret.seal_vault_key(&key) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(error = %e, "failed to seal received vault key");
                        continue;
                    }
                };
                if let Err(e) = inner_storage.write(VAULT_KEY_KEY, &sealed).await {
                    warn!(error = %e, "failed to persist received vault key");
                    continue;
                }
                storage.set_key(key);
                if let Err(e) = storage.reencrypt_all(None, |_, _| {}).await {
                    warn!(error = %e, "re-encryption after key install failed");
                }
                info!(fingerprint = %fingerprint, "vault key installed");
                let _ = events.send(VaultEvent::VaultKeyReceived { fingerprint }).await;
            }
        })
    }

    // ---- host file events ----------------------------------------------

    /// A file appeared on the host side.
    ///
    /// # Errors
    ///
    /// Propagates document failures.
    pub async fn handle_file_create(&self, path: &str, content: Option<FileContent>) -> Result<()> {
        self.document.handle_file_create(path, None)?;
        if let Some(content) = content {
            self.apply_content(path, content).await?;
        }
        Ok(())
    }

    /// A file's content changed on the host side. Unknown paths are
    /// created first.
    ///
    /// # Errors
    ///
    /// Propagates document and blob failures.
    pub async fn handle_file_modify(&self, path: &str, content: FileContent) -> Result<()> {
        if self.document.get_node(path).is_none() {
            self.document.handle_file_create(path, None)?;
        }
        self.apply_content(path, content).await
    }

    async fn apply_content(&self, path: &str, content: FileContent) -> Result<()> {
        match content {
            FileContent::Text(text) => {
                self.document.set_text_content(path, &text)?;
            }
            FileContent::Binary { bytes, mime } => {
                let hash = self.blobs.add(&bytes, mime.as_deref()).await?;
                if let Some(previous) = self.document.set_blob_hash(path, &hash)? {
                    self.release_blob(&previous).await;
                }
            }
        }
        Ok(())
    }

    /// A file disappeared on the host side.
    ///
    /// # Errors
    ///
    /// Propagates document failures.
    pub async fn handle_file_delete(&self, path: &str) -> Result<()> {
        for hash in self.document.handle_file_delete(path)? {
            self.release_blob(&hash).await;
        }
        Ok(())
    }

    /// A file moved on the host side.
    ///
    /// # Errors
    ///
    /// Propagates document failures.
    pub fn handle_file_rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.document.handle_file_rename(old_path, new_path)
    }

    async fn release_blob(&self, hash: &str) {
        match self.blobs.release(hash).await {
            Ok(_) => {}
            Err(BlobError::NotFound(_)) => {}
            Err(e) => warn!(error = %e, "blob release failed"),
        }
    }

    // ---- peers and sync ------------------------------------------------

    /// Reconnect every known peer and flush the document to storage.
    ///
    /// # Errors
    ///
    /// Propagates persistence failures.
    pub async fn sync(&self) -> Result<()> {
        self.document.save().await?;
        self.peers.reconnect_all();
        Ok(())
    }

    /// Pair with a peer by ticket. Returns the peer's node id.
    ///
    /// # Errors
    ///
    /// Fails on an unusable ticket.
    pub async fn add_peer(&self, ticket: &str) -> Result<String> {
        self.peers.add_peer(ticket).await
    }

    /// Remove a peer and notify it.
    ///
    /// # Errors
    ///
    /// Fails with `PeerNotFound` for unknown ids.
    pub async fn remove_peer(&self, node_id: &str) -> Result<()> {
        self.peers.remove_peer(node_id).await
    }

    /// A ticket other devices can use to pair with this vault.
    #[must_use]
    pub fn generate_invite(&self) -> String {
        self.peers.ticket()
    }

    /// Run garbage collection; `force` bypasses the size and consensus
    /// gates.
    ///
    /// # Errors
    ///
    /// Propagates GC failures.
    pub async fn run_gc(&self, force: bool) -> Result<Option<GcReport>> {
        let peers = self.peers.list_peers();
        let report = self.gc.maybe_run(&peers, force).await?;
        if report.is_some() {
            self.gc.prune_checkpoints(self.config.gc.keep_checkpoints).await?;
        }
        Ok(report)
    }

    // ---- keys ----------------------------------------------------------

    /// Create a fresh vault encryption key, enable encryption, and bring
    /// existing values under it. Returns the key fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates crypto and storage failures.
    pub async fn create_vault_key(&self) -> Result<String> {
        let key = VaultKey::generate()?;
        let fingerprint = key.fingerprint().to_string();

        let sealed = self.device_secret.seal_vault_key(&key)?;
        self.inner_storage.write(VAULT_KEY_KEY, &sealed).await?;
        self.storage.set_key(key);
        self.storage.reencrypt_all(None, |_, _| {}).await?;
        info!(fingerprint = %fingerprint, "vault key created");
        Ok(fingerprint)
    }

    /// Install a vault key supplied by the host (e.g. typed in as a
    /// recovery phrase). Returns the key fingerprint.
    ///
    /// # Errors
    ///
    /// Fails on malformed key bytes.
    pub async fn import_vault_key(&self, key_bytes: &[u8]) -> Result<String> {
        let key = VaultKey::from_bytes(key_bytes)?;
        let fingerprint = key.fingerprint().to_string();

        let sealed = self.device_secret.seal_vault_key(&key)?;
        self.inner_storage.write(VAULT_KEY_KEY, &sealed).await?;
        self.storage.set_key(key);
        self.storage.reencrypt_all(None, |_, _| {}).await?;
        let _ = self
            .events_tx
            .send(VaultEvent::VaultKeyReceived {
                fingerprint: fingerprint.clone(),
            })
            .await;
        Ok(fingerprint)
    }

    /// Offer this vault's encryption key to a paired peer.
    ///
    /// # Errors
    ///
    /// Fails with `KeyMissing` when encryption is off, or on transport
    /// failures.
    pub async fn offer_vault_key(&self, node_id: &str) -> Result<()> {
        let sealed = self
            .inner_storage
            .read(VAULT_KEY_KEY)
            .await?
            .ok_or(VaultError::Crypto(peervault_crypto::CryptoError::KeyMissing))?;
        let key = self.device_secret.open_vault_key(&sealed)?;
        self.peers.offer_vault_key(node_id, key.as_bytes()).await
    }

    // ---- accessors -----------------------------------------------------

    /// The vault's stable identifier.
    #[must_use]
    pub fn vault_id(&self) -> String {
        self.document.vault_id()
    }

    /// The CRDT document manager.
    #[must_use]
    pub fn document(&self) -> &Arc<VaultDocument> {
        &self.document
    }

    /// The blob store.
    #[must_use]
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// Known peers, as copies.
    #[must_use]
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        self.peers.list_peers()
    }

    /// Identity and size summary for host display.
    #[must_use]
    pub fn status(&self) -> VaultStatus {
        VaultStatus {
            vault_id: self.document.vault_id(),
            node_id: self.peers.node_id(),
            file_count: self.document.list_all_paths().len(),
            peer_count: self.peers.list_peers().len(),
            key_fingerprint: self.storage.key_fingerprint(),
        }
    }

    /// Flush state and stop all background work. Timers stop first, then
    /// sessions close, then the document flushes.
    ///
    /// # Errors
    ///
    /// Propagates the final persistence failure.
    pub async fn shutdown(self) -> Result<()> {
        self.key_installer.abort();
        self.file_event_pump.abort();
        self.peers.shutdown().await;
        self.document.save().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::VaultEvent;
    use crate::transport::MemoryHub;
    use peervault_storage::MemoryStorage;

    async fn open_vault(
        hub: &Arc<crate::transport::MemoryHub>,
        name: &str,
    ) -> (Vault, mpsc::Receiver<VaultEvent>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(hub.endpoint(name));
        let (vault, events) = Vault::open(
            storage.clone() as Arc<dyn Storage>,
            transport,
            VaultConfig::default(),
        )
        .await
        .unwrap();
        (vault, events, storage)
    }

    #[tokio::test]
    async fn test_open_initializes_bootstrap_material() {
        let hub = MemoryHub::new();
        let (vault, _events, storage) = open_vault(&hub, "solo").await;

        assert_eq!(
            storage.read(TRANSPORT_KEY).await.unwrap().unwrap().len(),
            32
        );
        assert_eq!(vault.vault_id().len(), 36);
        let status = vault.status();
        assert_eq!(status.node_id, "solo");
        assert_eq!(status.key_fingerprint, None);
    }

    #[tokio::test]
    async fn test_file_lifecycle_through_vault() {
        let hub = MemoryHub::new();
        let (vault, _events, _storage) = open_vault(&hub, "solo").await;

        vault
            .handle_file_create("notes/a.md", Some(FileContent::Text("Hello".into())))
            .await
            .unwrap();
        assert_eq!(vault.document().get_content("notes/a.md").unwrap(), "Hello");

        vault
            .handle_file_modify("notes/a.md", FileContent::Text("Hello, world".into()))
            .await
            .unwrap();
        assert_eq!(
            vault.document().get_content("notes/a.md").unwrap(),
            "Hello, world"
        );

        vault.handle_file_rename("notes/a.md", "notes/b.md").unwrap();
        assert!(vault.document().get_content("notes/b.md").is_some());

        vault.handle_file_delete("notes/b.md").await.unwrap();
        assert!(vault.document().get_content("notes/b.md").is_none());
    }

    #[tokio::test]
    async fn test_binary_content_reaches_blob_store() {
        let hub = MemoryHub::new();
        let (vault, _events, _storage) = open_vault(&hub, "solo").await;

        let png = vec![0x89, 0x50, 0x4E, 0x47];
        vault
            .handle_file_modify(
                "img.png",
                FileContent::Binary {
                    bytes: png.clone(),
                    mime: Some("image/png".into()),
                },
            )
            .await
            .unwrap();

        let hash = vault.document().get_blob_hash("img.png").unwrap();
        assert!(vault.blobs().has(&hash).await.unwrap());
        assert_eq!(vault.blobs().get(&hash).await.unwrap(), png);

        // Replacing the content releases the old blob
        vault
            .handle_file_modify(
                "img.png",
                FileContent::Binary {
                    bytes: vec![1, 2, 3],
                    mime: None,
                },
            )
            .await
            .unwrap();
        assert!(!vault.blobs().has(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_vault_key_encrypts_storage() {
        let hub = MemoryHub::new();
        let (vault, _events, storage) = open_vault(&hub, "solo").await;

        vault
            .handle_file_create("secret.md", Some(FileContent::Text("hidden".into())))
            .await
            .unwrap();
        vault.sync().await.unwrap();

        let fingerprint = vault.create_vault_key().await.unwrap();
        assert_eq!(fingerprint.len(), 16);
        assert_eq!(vault.status().key_fingerprint.as_deref(), Some(fingerprint.as_str()));

        // The persisted snapshot is now ciphertext
        let raw = storage
            .read(crate::keys::SNAPSHOT_KEY)
            .await
            .unwrap()
            .unwrap();
        assert!(EncryptedStorage::is_encrypted(&raw));
        // But the bootstrap material is not
        let material = storage.read(TRANSPORT_KEY).await.unwrap().unwrap();
        assert!(!EncryptedStorage::is_encrypted(&material));

        // Content still reads through the wrapper
        assert_eq!(vault.document().get_content("secret.md").unwrap(), "hidden");
    }

    #[tokio::test]
    async fn test_encrypted_vault_reopens_with_persisted_key() {
        let hub = MemoryHub::new();
        let storage = Arc::new(MemoryStorage::new());

        {
            let transport = Arc::new(hub.endpoint("solo"));
            let (vault, _events) = Vault::open(
                storage.clone() as Arc<dyn Storage>,
                transport,
                VaultConfig::default(),
            )
            .await
            .unwrap();
            vault
                .handle_file_create("k.md", Some(FileContent::Text("keep".into())))
                .await
                .unwrap();
            vault.create_vault_key().await.unwrap();
            vault.shutdown().await.unwrap();
        }

        let transport = Arc::new(hub.endpoint("solo"));
        let (vault, _events) = Vault::open(
            storage as Arc<dyn Storage>,
            transport,
            VaultConfig::default(),
        )
        .await
        .unwrap();
        assert!(vault.status().key_fingerprint.is_some());
        assert_eq!(vault.document().get_content("k.md").unwrap(), "keep");
    }

    #[tokio::test]
    async fn test_generate_invite_matches_transport() {
        let hub = MemoryHub::new();
        let (vault, _events, _storage) = open_vault(&hub, "solo").await;
        assert_eq!(vault.generate_invite(), "mem:solo");
    }

    #[tokio::test]
    async fn test_run_gc_gated_then_forced() {
        let hub = MemoryHub::new();
        let (vault, _events, _storage) = open_vault(&hub, "solo").await;
        vault
            .handle_file_create("a.md", Some(FileContent::Text("content".into())))
            .await
            .unwrap();
        vault.sync().await.unwrap();

        // Fresh vault is far below the size gate
        assert!(vault.run_gc(false).await.unwrap().is_none());
        // Forced run compacts regardless
        assert!(vault.run_gc(true).await.unwrap().is_some());
        assert_eq!(vault.document().get_content("a.md").unwrap(), "content");
    }
}
