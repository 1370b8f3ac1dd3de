//! The CRDT document manager.
//!
//! Wraps a [`loro::LoroDoc`] holding:
//! - a root tree container `files`: one node per file/folder, node
//!   metadata in the node's map (`name`, `kind`, timestamps, tombstone,
//!   `blobHash`), per-file text in a child text container under `content`
//! - a root map `vault`: `vaultId`, `schemaVersion`, `createdAt`
//!
//! Path lookup goes through derived caches (path → node id and inverse)
//! rebuilt by a depth-first walk after load, import, checkout, and
//! compaction. Nodes are soft-deleted: tombstoned nodes stay in the tree
//! but disappear from the caches, so history and concurrent edits survive.
//!
//! File-change events are computed by diffing per-node signatures across a
//! mutation or import, which gives identical event semantics for local and
//! remote changes.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, RwLock};

use loro::{
    Container, ExportMode, Frontiers, LoroDoc, LoroMap, LoroText, LoroValue, Subscription, TreeID,
    TreeParentId, ValueOrContainer, VersionVector, ID,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use peervault_storage::Storage;

use crate::clock::now_ms;
use crate::diff::compute_text_edits;
use crate::events::{EventOrigin, FileChange, FileEvent};
use crate::keys::SNAPSHOT_KEY;
use crate::{Result, VaultError};

const TREE_NAME: &str = "files";
const VAULT_MAP_NAME: &str = "vault";

const META_NAME: &str = "name";
const META_KIND: &str = "kind";
const META_MIME: &str = "mime";
const META_CTIME: &str = "ctime";
const META_MTIME: &str = "mtime";
const META_DELETED: &str = "deleted";
const META_DELETED_AT: &str = "deletedAt";
const META_BLOB_HASH: &str = "blobHash";
const META_CONTENT: &str = "content";

const KIND_FILE: &str = "file";
const KIND_FOLDER: &str = "folder";
const KIND_BINARY: &str = "binary";

/// Event channel capacity. Slow subscribers miss events rather than
/// blocking the document.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a node is, as a discriminated view over its metadata map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// A folder; holds children only
    Folder,
    /// A text file with collaborative content
    File {
        /// MIME type, when known
        mime: Option<String>,
    },
    /// A binary attachment referencing the blob store
    Binary {
        /// Hex SHA-256 of the content
        blob_hash: String,
        /// MIME type, when known
        mime: Option<String>,
    },
}

/// Read-only view of one node's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    /// Full path of the node
    pub path: String,
    /// What the node is
    pub kind: NodeKind,
    /// Creation time, epoch ms
    pub ctime: i64,
    /// Last modification time, epoch ms
    pub mtime: i64,
}

/// One entry of the version history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Encoded frontier usable with [`VaultDocument::checkout`]
    pub frontiers: Vec<u8>,
    /// Change wall-clock time, epoch ms
    pub timestamp_ms: i64,
    /// CRDT peer that authored the change
    pub peer: u64,
    /// Lamport timestamp of the change
    pub lamport: u32,
    /// Commit message, when one was recorded
    pub message: Option<String>,
}

/// Sizes before and after a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    /// Full snapshot size before compaction
    pub before_size: usize,
    /// Shallow snapshot size after compaction
    pub after_size: usize,
}

#[derive(Default)]
struct PathCaches {
    forward: HashMap<String, TreeID>,
    inverse: HashMap<TreeID, String>,
}

/// Per-node signature used to derive file events across a mutation.
#[derive(Clone, PartialEq, Eq)]
struct NodeSignature {
    path: String,
    kind: String,
    mtime: i64,
    blob_hash: Option<String>,
    text_len: Option<usize>,
}

/// The CRDT document manager. See the module docs.
pub struct VaultDocument {
    storage: Arc<dyn Storage>,
    doc: RwLock<LoroDoc>,
    caches: RwLock<PathCaches>,
    file_events_tx: broadcast::Sender<FileEvent>,
    local_updates_tx: broadcast::Sender<Vec<u8>>,
    // Held to keep the local-update subscription alive; replaced when
    // compaction swaps the doc handle.
    local_update_sub: Mutex<Option<Subscription>>,
}

impl VaultDocument {
    /// Load the document from `peervault-snapshot`, or initialize a fresh
    /// vault with a new id.
    ///
    /// # Errors
    ///
    /// Propagates storage failures and snapshot import failures.
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_record_timestamp(true);

        match storage.read(SNAPSHOT_KEY).await? {
            Some(snapshot) => {
                doc.import(&snapshot)
                    .map_err(|e| VaultError::BadUpdate(e.to_string()))?;
                debug!(bytes = snapshot.len(), "loaded document snapshot");
            }
            None => {
                let vault = doc.get_map(VAULT_MAP_NAME);
                vault.insert("vaultId", new_vault_id())?;
                vault.insert("schemaVersion", 1i64)?;
                vault.insert("createdAt", now_ms())?;
                doc.commit();
                debug!("initialized fresh vault document");
            }
        }

        let (file_events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (local_updates_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let document = Self {
            storage,
            doc: RwLock::new(doc),
            caches: RwLock::new(PathCaches::default()),
            file_events_tx,
            local_updates_tx,
            local_update_sub: Mutex::new(None),
        };
        document.install_update_subscription();
        document.rebuild_caches();
        Ok(document)
    }

    fn install_update_subscription(&self) {
        let tx = self.local_updates_tx.clone();
        let doc = self.doc.read().expect("doc lock poisoned");
        let sub = doc.subscribe_local_update(Box::new(move |update| {
            // No receivers is fine; live sessions resubscribe on start
            let _ = tx.send(update.to_vec());
            true
        }));
        *self.local_update_sub.lock().expect("sub lock poisoned") = Some(sub);
    }

    /// Subscribe to file-change events (local and remote).
    #[must_use]
    pub fn subscribe_file_events(&self) -> broadcast::Receiver<FileEvent> {
        self.file_events_tx.subscribe()
    }

    /// Subscribe to local update bytes, one payload per committed local
    /// transaction. Sessions frame these as `UPDATES`.
    #[must_use]
    pub fn subscribe_local_updates(&self) -> broadcast::Receiver<Vec<u8>> {
        self.local_updates_tx.subscribe()
    }

    /// The vault's stable identifier.
    #[must_use]
    pub fn vault_id(&self) -> String {
        let doc = self.doc.read().expect("doc lock poisoned");
        doc.get_map(VAULT_MAP_NAME)
            .get("vaultId")
            .and_then(|v| value_string(&v))
            .unwrap_or_default()
    }

    /// Overwrite the vault id (adoption during pairing).
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn set_vault_id(&self, vault_id: &str) -> Result<()> {
        let doc = self.doc.write().expect("doc lock poisoned");
        doc.get_map(VAULT_MAP_NAME).insert("vaultId", vault_id)?;
        doc.commit();
        Ok(())
    }

    /// Whether the vault has never held a file node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let doc = self.doc.read().expect("doc lock poisoned");
        doc.get_tree(TREE_NAME)
            .children(TreeParentId::Root)
            .map_or(true, |roots| roots.is_empty())
    }

    // ---- tree mutators -------------------------------------------------

    /// Create a file node at `path`; parent folders appear implicitly.
    /// Creating an existing live path only bumps its `mtime`.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn handle_file_create(&self, path: &str, mime: Option<&str>) -> Result<()> {
        self.mutate(EventOrigin::Local, |doc, caches| {
            if let Some(&node) = caches.forward.get(path) {
                let meta = doc.get_tree(TREE_NAME).get_meta(node)?;
                meta.insert(META_MTIME, now_ms())?;
                return Ok(());
            }
            let node = create_at_path(doc, caches, path)?;
            let meta = doc.get_tree(TREE_NAME).get_meta(node)?;
            meta.insert(META_KIND, KIND_FILE)?;
            if let Some(mime) = mime {
                meta.insert(META_MIME, mime)?;
            }
            Ok(())
        })
    }

    /// Bump `mtime` at `path`. Missing paths log and no-op.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn handle_file_modify(&self, path: &str) -> Result<()> {
        self.mutate(EventOrigin::Local, |doc, caches| {
            let Some(&node) = caches.forward.get(path) else {
                warn!(path, "modify of unknown path ignored");
                return Ok(());
            };
            let meta = doc.get_tree(TREE_NAME).get_meta(node)?;
            meta.insert(META_MTIME, now_ms())?;
            Ok(())
        })
    }

    /// Soft-delete the node at `path` (and its subtree, for folders).
    /// Returns blob hashes that lost a reference, for release by the
    /// caller. Missing paths log and no-op.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn handle_file_delete(&self, path: &str) -> Result<Vec<String>> {
        let mut released = Vec::new();
        self.mutate(EventOrigin::Local, |doc, caches| {
            let Some(&node) = caches.forward.get(path) else {
                warn!(path, "delete of unknown path ignored");
                return Ok(());
            };
            let tree = doc.get_tree(TREE_NAME);
            let mut stack = vec![node];
            let stamp = now_ms();
            while let Some(current) = stack.pop() {
                let meta = tree.get_meta(current)?;
                if meta_bool(&meta, META_DELETED).unwrap_or(false) {
                    continue;
                }
                if let Some(hash) = meta_string(&meta, META_BLOB_HASH) {
                    released.push(hash);
                }
                meta.insert(META_DELETED, true)?;
                meta.insert(META_DELETED_AT, stamp)?;
                if let Some(children) = tree.children(TreeParentId::Node(current)) {
                    stack.extend(children);
                }
            }
            Ok(())
        })?;
        Ok(released)
    }

    /// Move/rename the node at `old_path` to `new_path`, preserving its
    /// identity so history survives the move. A deleted parent on the new
    /// path is recreated lazily. Missing sources log and no-op.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn handle_file_rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.mutate(EventOrigin::Local, |doc, caches| {
            let Some(&node) = caches.forward.get(old_path) else {
                warn!(old_path, new_path, "rename of unknown path ignored");
                return Ok(());
            };
            let tree = doc.get_tree(TREE_NAME);

            let (parent_path, new_name) = split_path(new_path);
            let parent = match parent_path {
                Some(parent_path) => {
                    let parent_id = ensure_folder(doc, caches, parent_path)?;
                    TreeParentId::Node(parent_id)
                }
                None => TreeParentId::Root,
            };

            tree.mov(node, parent)?;
            let meta = tree.get_meta(node)?;
            meta.insert(META_NAME, new_name)?;
            meta.insert(META_MTIME, now_ms())?;
            Ok(())
        })
    }

    /// Replace the text content at `path` with `new_text` via minimal
    /// edits, so only the difference travels to peers.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures. Missing paths log and no-op.
    pub fn set_text_content(&self, path: &str, new_text: &str) -> Result<()> {
        self.mutate(EventOrigin::Local, |doc, caches| {
            let Some(&node) = caches.forward.get(path) else {
                warn!(path, "text update for unknown path ignored");
                return Ok(());
            };
            let meta = doc.get_tree(TREE_NAME).get_meta(node)?;
            let text = meta.get_or_create_container(META_CONTENT, LoroText::new())?;

            let current = text.to_string();
            let mut edits = compute_text_edits(&current, new_text);
            // Descending position order keeps earlier offsets valid
            edits.sort_by(|a, b| b.pos.cmp(&a.pos));
            for edit in &edits {
                if edit.delete > 0 {
                    text.delete(edit.pos, edit.delete)?;
                }
                if !edit.insert.is_empty() {
                    text.insert(edit.pos, &edit.insert)?;
                }
            }

            meta.insert(META_MTIME, now_ms())?;
            Ok(())
        })
    }

    /// Current text content at `path`, if it is a live text file.
    #[must_use]
    pub fn get_content(&self, path: &str) -> Option<String> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let node = *caches.forward.get(path)?;
        let doc = self.doc.read().expect("doc lock poisoned");
        let meta = doc.get_tree(TREE_NAME).get_meta(node).ok()?;
        node_text(&meta).map(|t| t.to_string())
    }

    /// Flip the node at `path` to a binary reference. Returns the hash it
    /// previously referenced, if any, so the caller can release it.
    ///
    /// # Errors
    ///
    /// Propagates CRDT failures.
    pub fn set_blob_hash(&self, path: &str, hash: &str) -> Result<Option<String>> {
        let mut previous = None;
        self.mutate(EventOrigin::Local, |doc, caches| {
            let Some(&node) = caches.forward.get(path) else {
                warn!(path, "blob update for unknown path ignored");
                return Ok(());
            };
            let meta = doc.get_tree(TREE_NAME).get_meta(node)?;
            previous = meta_string(&meta, META_BLOB_HASH).filter(|old| old != hash);
            meta.insert(META_KIND, KIND_BINARY)?;
            meta.insert(META_BLOB_HASH, hash)?;
            meta.insert(META_MTIME, now_ms())?;
            Ok(())
        })?;
        Ok(previous)
    }

    /// The blob hash referenced at `path`, if it is a live binary node.
    #[must_use]
    pub fn get_blob_hash(&self, path: &str) -> Option<String> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let node = *caches.forward.get(path)?;
        let doc = self.doc.read().expect("doc lock poisoned");
        let meta = doc.get_tree(TREE_NAME).get_meta(node).ok()?;
        meta_string(&meta, META_BLOB_HASH)
    }

    /// Metadata view of the node at `path`.
    #[must_use]
    pub fn get_node(&self, path: &str) -> Option<NodeView> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let node = *caches.forward.get(path)?;
        let doc = self.doc.read().expect("doc lock poisoned");
        let meta = doc.get_tree(TREE_NAME).get_meta(node).ok()?;
        let mime = meta_string(&meta, META_MIME);
        let kind = match meta_string(&meta, META_KIND).as_deref() {
            Some(KIND_BINARY) => NodeKind::Binary {
                blob_hash: meta_string(&meta, META_BLOB_HASH).unwrap_or_default(),
                mime,
            },
            Some(KIND_FOLDER) => NodeKind::Folder,
            _ => NodeKind::File { mime },
        };
        Some(NodeView {
            path: path.to_string(),
            kind,
            ctime: meta_i64(&meta, META_CTIME).unwrap_or(0),
            mtime: meta_i64(&meta, META_MTIME).unwrap_or(0),
        })
    }

    /// Every live path, sorted.
    #[must_use]
    pub fn list_all_paths(&self) -> Vec<String> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let mut paths: Vec<String> = caches.forward.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Blob hashes referenced by the live tree.
    #[must_use]
    pub fn referenced_blob_hashes(&self) -> HashSet<String> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let doc = self.doc.read().expect("doc lock poisoned");
        let tree = doc.get_tree(TREE_NAME);
        caches
            .inverse
            .keys()
            .filter_map(|&node| tree.get_meta(node).ok())
            .filter_map(|meta| meta_string(&meta, META_BLOB_HASH))
            .collect()
    }

    // ---- export / import ----------------------------------------------

    /// Persist a full snapshot at `peervault-snapshot`.
    ///
    /// # Errors
    ///
    /// Propagates export and storage failures.
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.export_snapshot()?;
        self.storage.write(SNAPSHOT_KEY, &snapshot).await?;
        debug!(bytes = snapshot.len(), "document snapshot saved");
        Ok(())
    }

    /// Export a full snapshot.
    ///
    /// # Errors
    ///
    /// Propagates export failures.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        let doc = self.doc.read().expect("doc lock poisoned");
        Ok(doc.export(ExportMode::Snapshot)?)
    }

    /// Export updates since an encoded version vector (all history when
    /// `None`).
    ///
    /// # Errors
    ///
    /// Fails with `BadUpdate` on an undecodable version vector.
    pub fn export_updates(&self, since: Option<&[u8]>) -> Result<Vec<u8>> {
        let from = match since {
            Some(bytes) => VersionVector::decode(bytes)
                .map_err(|e| VaultError::BadUpdate(format!("bad version vector: {e}")))?,
            None => VersionVector::new(),
        };
        let doc = self.doc.read().expect("doc lock poisoned");
        Ok(doc.export(ExportMode::Updates {
            from: Cow::Owned(from),
        })?)
    }

    /// Apply snapshot or update bytes from a peer, rebuild the path
    /// caches, and emit `origin=remote` file events in document order.
    ///
    /// # Errors
    ///
    /// Fails with `BadUpdate` when the CRDT rejects the bytes; the
    /// document is left unchanged.
    pub fn import_updates(&self, bytes: &[u8]) -> Result<Vec<FileEvent>> {
        let before = self.signatures();
        {
            let doc = self.doc.read().expect("doc lock poisoned");
            doc.import(bytes)
                .map_err(|e| VaultError::BadUpdate(e.to_string()))?;
        }
        self.rebuild_caches();
        let events = self.diff_signatures(&before, EventOrigin::Remote);
        for event in &events {
            let _ = self.file_events_tx.send(event.clone());
        }
        Ok(events)
    }

    /// Encoded oplog version vector.
    #[must_use]
    pub fn oplog_version(&self) -> Vec<u8> {
        let doc = self.doc.read().expect("doc lock poisoned");
        doc.oplog_vv().encode()
    }

    /// Encoded oplog frontiers.
    #[must_use]
    pub fn oplog_frontiers(&self) -> Vec<u8> {
        let doc = self.doc.read().expect("doc lock poisoned");
        doc.oplog_frontiers().encode()
    }

    /// Whether an encoded remote version vector includes ops this side
    /// lacks.
    #[must_use]
    pub fn remote_is_ahead(&self, remote_version: &[u8]) -> bool {
        let Ok(remote) = VersionVector::decode(remote_version) else {
            return false;
        };
        let doc = self.doc.read().expect("doc lock poisoned");
        let local = doc.oplog_vv();
        match local.partial_cmp(&remote) {
            Some(std::cmp::Ordering::Less) | None => true,
            Some(_) => false,
        }
    }

    // ---- history -------------------------------------------------------

    /// Recent changes, sorted `(lamport desc, timestamp desc)`.
    #[must_use]
    pub fn get_version_history(&self, limit: usize) -> Vec<VersionEntry> {
        let doc = self.doc.read().expect("doc lock poisoned");
        let frontiers = doc.oplog_frontiers();
        let ids: Vec<ID> = frontiers.iter().collect();

        let mut entries = Vec::new();
        let result = doc.travel_change_ancestors(&ids, &mut |change| {
            let head = change.id.inc(change.len.saturating_sub(1) as i32);
            entries.push(VersionEntry {
                frontiers: Frontiers::from(head).encode(),
                timestamp_ms: change.timestamp * 1000,
                peer: change.id.peer,
                lamport: change.lamport,
                message: change.message.map(|m| m.to_string()),
            });
            if entries.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        if let Err(e) = result {
            warn!(error = %e, "history traversal stopped early");
        }

        entries.sort_by(|a, b| {
            b.lamport
                .cmp(&a.lamport)
                .then(b.timestamp_ms.cmp(&a.timestamp_ms))
        });
        entries
    }

    /// Read-only view of the document at an encoded frontier. Undecodable
    /// frontiers fall back to the latest state.
    #[must_use]
    pub fn checkout(&self, frontiers: &[u8]) -> DocumentSnapshot {
        let doc = self.doc.read().expect("doc lock poisoned");
        let forked = match Frontiers::decode(frontiers).and_then(|f| doc.fork_at(&f)) {
            Ok(forked) => forked,
            Err(e) => {
                warn!(error = %e, "checkout fell back to latest");
                doc.fork()
            }
        };
        DocumentSnapshot::new(forked)
    }

    // ---- compaction ----------------------------------------------------

    /// Replace the live handle with one rebuilt from a shallow snapshot at
    /// the current frontiers, discarding detailed op history.
    ///
    /// Runs under the exclusive document lock; snapshots exported earlier
    /// stay valid as detached buffers.
    ///
    /// # Errors
    ///
    /// Propagates export/import failures; on failure the old handle stays.
    pub fn compact(&self) -> Result<CompactionResult> {
        let mut doc = self.doc.write().expect("doc lock poisoned");

        let before_size = doc.export(ExportMode::Snapshot)?.len();
        let frontiers = doc.oplog_frontiers();
        let shallow = doc.export(ExportMode::ShallowSnapshot(Cow::Owned(frontiers)))?;

        let fresh = LoroDoc::new();
        fresh.set_record_timestamp(true);
        fresh
            .import(&shallow)
            .map_err(|e| VaultError::BadUpdate(format!("shallow snapshot reimport: {e}")))?;

        *doc = fresh;
        drop(doc);

        self.install_update_subscription();
        self.rebuild_caches();

        let result = CompactionResult {
            before_size,
            after_size: shallow.len(),
        };
        debug!(
            before = result.before_size,
            after = result.after_size,
            "document compacted"
        );
        Ok(result)
    }

    // ---- caches and signatures ----------------------------------------

    fn mutate(
        &self,
        origin: EventOrigin,
        f: impl FnOnce(&LoroDoc, &PathCaches) -> Result<()>,
    ) -> Result<()> {
        let before = self.signatures();
        {
            let doc = self.doc.read().expect("doc lock poisoned");
            let caches = self.caches.read().expect("cache lock poisoned");
            f(&doc, &caches)?;
            doc.commit();
        }
        self.rebuild_caches();
        for event in self.diff_signatures(&before, origin) {
            let _ = self.file_events_tx.send(event);
        }
        Ok(())
    }

    fn rebuild_caches(&self) {
        let doc = self.doc.read().expect("doc lock poisoned");
        let tree = doc.get_tree(TREE_NAME);
        let mut caches = PathCaches::default();

        // Depth-first walk skipping tombstoned subtrees
        let mut stack: Vec<(TreeID, String)> = Vec::new();
        if let Some(roots) = tree.children(TreeParentId::Root) {
            for root in roots {
                stack.push((root, String::new()));
            }
        }
        while let Some((node, prefix)) = stack.pop() {
            let Ok(meta) = tree.get_meta(node) else {
                continue;
            };
            if meta_bool(&meta, META_DELETED).unwrap_or(false) {
                continue;
            }
            let name = meta_string(&meta, META_NAME).unwrap_or_default();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if let Some(children) = tree.children(TreeParentId::Node(node)) {
                for child in children {
                    stack.push((child, path.clone()));
                }
            }
            caches.inverse.insert(node, path.clone());
            // Concurrent creates can give two nodes the same path; pick
            // the same winner on every replica.
            match caches.forward.get(&path) {
                Some(&existing) if preferred_node(existing, node) == existing => {}
                _ => {
                    caches.forward.insert(path, node);
                }
            }
        }

        *self.caches.write().expect("cache lock poisoned") = caches;
    }

    fn signatures(&self) -> HashMap<TreeID, NodeSignature> {
        let caches = self.caches.read().expect("cache lock poisoned");
        let doc = self.doc.read().expect("doc lock poisoned");
        let tree = doc.get_tree(TREE_NAME);

        let mut map = HashMap::with_capacity(caches.inverse.len());
        for (&node, path) in &caches.inverse {
            let Ok(meta) = tree.get_meta(node) else {
                continue;
            };
            map.insert(
                node,
                NodeSignature {
                    path: path.clone(),
                    kind: meta_string(&meta, META_KIND).unwrap_or_default(),
                    mtime: meta_i64(&meta, META_MTIME).unwrap_or(0),
                    blob_hash: meta_string(&meta, META_BLOB_HASH),
                    text_len: node_text(&meta).map(|t| t.len_unicode()),
                },
            );
        }
        map
    }

    fn diff_signatures(
        &self,
        before: &HashMap<TreeID, NodeSignature>,
        origin: EventOrigin,
    ) -> Vec<FileEvent> {
        let after = self.signatures();
        let mut events = Vec::new();

        for (node, sig) in &after {
            match before.get(node) {
                None => events.push(FileEvent {
                    path: sig.path.clone(),
                    change: FileChange::Created,
                    origin,
                }),
                Some(old) if old.path != sig.path => events.push(FileEvent {
                    path: sig.path.clone(),
                    change: FileChange::Renamed {
                        from: old.path.clone(),
                    },
                    origin,
                }),
                Some(old) if old != sig => events.push(FileEvent {
                    path: sig.path.clone(),
                    change: FileChange::Modified,
                    origin,
                }),
                Some(_) => {}
            }
        }
        for (node, old) in before {
            if !after.contains_key(node) {
                events.push(FileEvent {
                    path: old.path.clone(),
                    change: FileChange::Deleted,
                    origin,
                });
            }
        }

        events.sort_by(|a, b| a.path.cmp(&b.path));
        events
    }
}

/// Read-only document view produced by [`VaultDocument::checkout`].
pub struct DocumentSnapshot {
    doc: LoroDoc,
    paths: HashMap<String, TreeID>,
}

impl DocumentSnapshot {
    fn new(doc: LoroDoc) -> Self {
        let tree = doc.get_tree(TREE_NAME);
        let mut paths = HashMap::new();

        let mut stack: Vec<(TreeID, String)> = Vec::new();
        if let Some(roots) = tree.children(TreeParentId::Root) {
            for root in roots {
                stack.push((root, String::new()));
            }
        }
        while let Some((node, prefix)) = stack.pop() {
            let Ok(meta) = tree.get_meta(node) else {
                continue;
            };
            if meta_bool(&meta, META_DELETED).unwrap_or(false) {
                continue;
            }
            let name = meta_string(&meta, META_NAME).unwrap_or_default();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if let Some(children) = tree.children(TreeParentId::Node(node)) {
                for child in children {
                    stack.push((child, path.clone()));
                }
            }
            match paths.get(&path) {
                Some(&existing) if preferred_node(existing, node) == existing => {}
                _ => {
                    paths.insert(path, node);
                }
            }
        }

        Self { doc, paths }
    }

    /// Every live path at this point of history, sorted.
    #[must_use]
    pub fn list_all_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.paths.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Text content at `path` at this point of history.
    #[must_use]
    pub fn get_content(&self, path: &str) -> Option<String> {
        let node = *self.paths.get(path)?;
        let meta = self.doc.get_tree(TREE_NAME).get_meta(node).ok()?;
        node_text(&meta).map(|t| t.to_string())
    }

    /// Blob hash at `path` at this point of history.
    #[must_use]
    pub fn get_blob_hash(&self, path: &str) -> Option<String> {
        let node = *self.paths.get(path)?;
        let meta = self.doc.get_tree(TREE_NAME).get_meta(node).ok()?;
        meta_string(&meta, META_BLOB_HASH)
    }
}

// ---- free helpers ------------------------------------------------------

/// Deterministic winner when two live nodes share a path: the node with
/// the smaller `(peer, counter)` id, so every replica agrees.
fn preferred_node(a: TreeID, b: TreeID) -> TreeID {
    if (a.peer, a.counter) <= (b.peer, b.counter) {
        a
    } else {
        b
    }
}

fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, path),
    }
}

/// Create a node at `path` with file defaults; parents appear as folders.
fn create_at_path(doc: &LoroDoc, caches: &PathCaches, path: &str) -> Result<TreeID> {
    let (parent_path, name) = split_path(path);
    let parent = match parent_path {
        Some(parent_path) => TreeParentId::Node(ensure_folder(doc, caches, parent_path)?),
        None => TreeParentId::Root,
    };

    let tree = doc.get_tree(TREE_NAME);
    let node = tree.create(parent)?;
    let meta = tree.get_meta(node)?;
    let stamp = now_ms();
    meta.insert(META_NAME, name)?;
    meta.insert(META_KIND, KIND_FILE)?;
    meta.insert(META_CTIME, stamp)?;
    meta.insert(META_MTIME, stamp)?;
    meta.insert(META_DELETED, false)?;
    Ok(node)
}

/// Walk (and create where missing) the folder chain for `path`, returning
/// the deepest folder's node. A tombstoned folder on the way is replaced
/// by a fresh live node.
fn ensure_folder(doc: &LoroDoc, caches: &PathCaches, path: &str) -> Result<TreeID> {
    let tree = doc.get_tree(TREE_NAME);
    let mut parent: Option<TreeID> = None;
    let mut walked = String::new();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if walked.is_empty() {
            walked.push_str(segment);
        } else {
            walked.push('/');
            walked.push_str(segment);
        }

        // The cache only holds live nodes, so deleted ancestors are
        // recreated here rather than resurrected.
        if let Some(&existing) = caches.forward.get(&walked) {
            parent = Some(existing);
            continue;
        }
        if let Some(created) = find_live_child(&tree, parent, segment)? {
            parent = Some(created);
            continue;
        }

        let node = tree.create(match parent {
            Some(p) => TreeParentId::Node(p),
            None => TreeParentId::Root,
        })?;
        let meta = tree.get_meta(node)?;
        let stamp = now_ms();
        meta.insert(META_NAME, segment)?;
        meta.insert(META_KIND, KIND_FOLDER)?;
        meta.insert(META_CTIME, stamp)?;
        meta.insert(META_MTIME, stamp)?;
        meta.insert(META_DELETED, false)?;
        parent = Some(node);
    }

    parent.ok_or_else(|| VaultError::Document(format!("empty folder path: {path:?}")))
}

/// Find a live child by name under `parent`, covering nodes created
/// within the current uncommitted mutation (not yet in the caches).
fn find_live_child(
    tree: &loro::LoroTree,
    parent: Option<TreeID>,
    name: &str,
) -> Result<Option<TreeID>> {
    let parent = match parent {
        Some(p) => TreeParentId::Node(p),
        None => TreeParentId::Root,
    };
    let Some(children) = tree.children(parent) else {
        return Ok(None);
    };
    for child in children {
        let meta = tree.get_meta(child)?;
        if meta_bool(&meta, META_DELETED).unwrap_or(false) {
            continue;
        }
        if meta_string(&meta, META_NAME).as_deref() == Some(name) {
            return Ok(Some(child));
        }
    }
    Ok(None)
}

fn value_string(value: &ValueOrContainer) -> Option<String> {
    match value.as_value()? {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn meta_string(meta: &LoroMap, key: &str) -> Option<String> {
    meta.get(key).as_ref().and_then(value_string)
}

fn meta_i64(meta: &LoroMap, key: &str) -> Option<i64> {
    match meta.get(key)?.as_value()? {
        LoroValue::I64(v) => Some(*v),
        _ => None,
    }
}

fn meta_bool(meta: &LoroMap, key: &str) -> Option<bool> {
    match meta.get(key)?.as_value()? {
        LoroValue::Bool(v) => Some(*v),
        _ => None,
    }
}

fn node_text(meta: &LoroMap) -> Option<LoroText> {
    match meta.get(META_CONTENT)? {
        ValueOrContainer::Container(Container::Text(text)) => Some(text),
        _ => None,
    }
}

fn new_vault_id() -> String {
    let mut bytes: [u8; 16] = rand::random();
    // UUIDv4 shape
    bytes[6] = (bytes[6] & 0x0F) | 0x40;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    let h = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervault_storage::MemoryStorage;

    async fn fresh() -> VaultDocument {
        VaultDocument::load(Arc::new(MemoryStorage::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_vault_has_id() {
        let doc = fresh().await;
        let id = doc.vault_id();
        assert_eq!(id.len(), 36);
        assert!(doc.is_empty());
        assert!(doc.list_all_paths().is_empty());
    }

    #[tokio::test]
    async fn test_create_makes_implicit_folders() {
        let doc = fresh().await;
        doc.handle_file_create("notes/daily/today.md", None).unwrap();

        assert_eq!(
            doc.list_all_paths(),
            vec![
                "notes".to_string(),
                "notes/daily".to_string(),
                "notes/daily/today.md".to_string()
            ]
        );
        assert!(!doc.is_empty());

        let folder = doc.get_node("notes").unwrap();
        assert_eq!(folder.kind, NodeKind::Folder);
    }

    #[tokio::test]
    async fn test_set_and_get_text() {
        let doc = fresh().await;
        doc.handle_file_create("a.md", Some("text/markdown")).unwrap();
        doc.set_text_content("a.md", "Hello").unwrap();
        assert_eq!(doc.get_content("a.md").unwrap(), "Hello");

        doc.set_text_content("a.md", "Hello, world").unwrap();
        assert_eq!(doc.get_content("a.md").unwrap(), "Hello, world");

        let node = doc.get_node("a.md").unwrap();
        assert!(node.mtime >= node.ctime);
    }

    #[tokio::test]
    async fn test_delete_hides_path_and_releases_blob() {
        let doc = fresh().await;
        doc.handle_file_create("img.png", Some("image/png")).unwrap();
        doc.set_blob_hash("img.png", &"ab".repeat(32)).unwrap();

        let released = doc.handle_file_delete("img.png").unwrap();
        assert_eq!(released, vec!["ab".repeat(32)]);
        assert!(doc.get_content("img.png").is_none());
        assert!(!doc.list_all_paths().contains(&"img.png".to_string()));
    }

    #[tokio::test]
    async fn test_delete_folder_releases_subtree() {
        let doc = fresh().await;
        doc.handle_file_create("media/a.bin", None).unwrap();
        doc.handle_file_create("media/b.bin", None).unwrap();
        doc.set_blob_hash("media/a.bin", &"aa".repeat(32)).unwrap();
        doc.set_blob_hash("media/b.bin", &"bb".repeat(32)).unwrap();

        let mut released = doc.handle_file_delete("media").unwrap();
        released.sort();
        assert_eq!(released, vec!["aa".repeat(32), "bb".repeat(32)]);
        assert!(doc.list_all_paths().is_empty());
    }

    #[tokio::test]
    async fn test_rename_preserves_identity_and_content() {
        let doc = fresh().await;
        doc.handle_file_create("old/name.md", None).unwrap();
        doc.set_text_content("old/name.md", "body").unwrap();

        doc.handle_file_rename("old/name.md", "new/dir/name2.md")
            .unwrap();

        assert!(doc.get_content("old/name.md").is_none());
        assert_eq!(doc.get_content("new/dir/name2.md").unwrap(), "body");
        let paths = doc.list_all_paths();
        assert!(paths.contains(&"new/dir".to_string()));
        // The old parent folder survives as an empty folder
        assert!(paths.contains(&"old".to_string()));
    }

    #[tokio::test]
    async fn test_rename_through_deleted_parent_recreates_it() {
        let doc = fresh().await;
        doc.handle_file_create("keep.md", None).unwrap();
        doc.handle_file_create("gone/sub/x.md", None).unwrap();
        doc.handle_file_delete("gone").unwrap();

        doc.handle_file_rename("keep.md", "gone/sub/keep.md").unwrap();
        let paths = doc.list_all_paths();
        assert!(paths.contains(&"gone".to_string()));
        assert!(paths.contains(&"gone/sub".to_string()));
        assert!(paths.contains(&"gone/sub/keep.md".to_string()));
        // The previously deleted file stays deleted
        assert!(!paths.contains(&"gone/sub/x.md".to_string()));
    }

    #[tokio::test]
    async fn test_missing_path_ops_are_noops() {
        let doc = fresh().await;
        doc.handle_file_modify("nope.md").unwrap();
        doc.set_text_content("nope.md", "x").unwrap();
        doc.handle_file_rename("nope.md", "other.md").unwrap();
        assert!(doc.handle_file_delete("nope.md").unwrap().is_empty());
        assert!(doc.list_all_paths().is_empty());
    }

    #[tokio::test]
    async fn test_export_import_converges() {
        let a = fresh().await;
        let b = fresh().await;

        a.handle_file_create("notes/a.md", None).unwrap();
        a.set_text_content("notes/a.md", "Hello").unwrap();

        let updates = a.export_updates(None).unwrap();
        let events = b.import_updates(&updates).unwrap();

        assert_eq!(b.list_all_paths(), a.list_all_paths());
        assert_eq!(b.get_content("notes/a.md").unwrap(), "Hello");
        assert!(events
            .iter()
            .all(|e| e.origin == EventOrigin::Remote));
        assert!(events
            .iter()
            .any(|e| e.path == "notes/a.md" && e.change == FileChange::Created));
    }

    #[tokio::test]
    async fn test_concurrent_creates_converge_both_orders() {
        let a = fresh().await;
        let b = fresh().await;

        a.handle_file_create("shared/x.md", None).unwrap();
        b.handle_file_create("shared/y.md", None).unwrap();

        let from_a = a.export_updates(None).unwrap();
        let from_b = b.export_updates(None).unwrap();

        a.import_updates(&from_b).unwrap();
        b.import_updates(&from_a).unwrap();

        assert_eq!(a.list_all_paths(), b.list_all_paths());
        assert!(a.list_all_paths().contains(&"shared/x.md".to_string()));
        assert!(a.list_all_paths().contains(&"shared/y.md".to_string()));
    }

    #[tokio::test]
    async fn test_incremental_export_since_version() {
        let a = fresh().await;
        let b = fresh().await;

        a.handle_file_create("one.md", None).unwrap();
        b.import_updates(&a.export_updates(None).unwrap()).unwrap();
        let b_version = b.oplog_version();

        a.handle_file_create("two.md", None).unwrap();
        let delta = a.export_updates(Some(&b_version)).unwrap();
        b.import_updates(&delta).unwrap();

        assert_eq!(a.list_all_paths(), b.list_all_paths());
    }

    #[tokio::test]
    async fn test_remote_is_ahead() {
        let a = fresh().await;
        let b = fresh().await;

        a.handle_file_create("x.md", None).unwrap();
        assert!(b.remote_is_ahead(&a.oplog_version()));
        assert!(!a.remote_is_ahead(&b.oplog_version()));

        b.import_updates(&a.export_updates(None).unwrap()).unwrap();
        assert!(!b.remote_is_ahead(&a.oplog_version()));
    }

    #[tokio::test]
    async fn test_garbage_update_rejected() {
        let doc = fresh().await;
        assert!(matches!(
            doc.import_updates(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(VaultError::BadUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_local_update_subscription_fires() {
        let doc = fresh().await;
        let mut updates = doc.subscribe_local_updates();
        doc.handle_file_create("watched.md", None).unwrap();

        let payload = updates.try_recv().expect("update bytes were broadcast");
        assert!(!payload.is_empty());

        // The payload is importable by another document
        let other = fresh().await;
        other.import_updates(&payload).unwrap();
        assert!(other
            .list_all_paths()
            .contains(&"watched.md".to_string()));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
        let vault_id;
        {
            let doc = VaultDocument::load(storage.clone()).await.unwrap();
            doc.handle_file_create("persisted.md", None).unwrap();
            doc.set_text_content("persisted.md", "still here").unwrap();
            vault_id = doc.vault_id();
            doc.save().await.unwrap();
        }
        let doc = VaultDocument::load(storage).await.unwrap();
        assert_eq!(doc.vault_id(), vault_id);
        assert_eq!(doc.get_content("persisted.md").unwrap(), "still here");
    }

    #[tokio::test]
    async fn test_compact_preserves_live_state() {
        let doc = fresh().await;
        doc.handle_file_create("keep/a.md", None).unwrap();
        // Churn to grow the op log
        for i in 0..30 {
            doc.set_text_content("keep/a.md", &format!("revision {i}"))
                .unwrap();
        }
        doc.handle_file_create("keep/img.png", None).unwrap();
        doc.set_blob_hash("keep/img.png", &"cd".repeat(32)).unwrap();

        let paths_before = doc.list_all_paths();
        let content_before = doc.get_content("keep/a.md").unwrap();

        let result = doc.compact().unwrap();
        assert!(result.after_size > 0);

        assert_eq!(doc.list_all_paths(), paths_before);
        assert_eq!(doc.get_content("keep/a.md").unwrap(), content_before);
        assert_eq!(doc.get_blob_hash("keep/img.png").unwrap(), "cd".repeat(32));

        // Document remains usable and observable after the handle swap
        let mut updates = doc.subscribe_local_updates();
        doc.handle_file_create("after.md", None).unwrap();
        assert!(updates.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_version_history_sorted() {
        let doc = fresh().await;
        doc.handle_file_create("h.md", None).unwrap();
        doc.set_text_content("h.md", "one").unwrap();
        doc.set_text_content("h.md", "two").unwrap();

        let history = doc.get_version_history(16);
        assert!(!history.is_empty());
        for pair in history.windows(2) {
            assert!(
                pair[0].lamport > pair[1].lamport
                    || (pair[0].lamport == pair[1].lamport
                        && pair[0].timestamp_ms >= pair[1].timestamp_ms)
            );
        }
    }

    #[tokio::test]
    async fn test_checkout_views_old_state() {
        let doc = fresh().await;
        doc.handle_file_create("story.md", None).unwrap();
        doc.set_text_content("story.md", "draft one").unwrap();
        let old_frontiers = doc.oplog_frontiers();

        doc.set_text_content("story.md", "final text").unwrap();
        doc.handle_file_create("extra.md", None).unwrap();

        let snapshot = doc.checkout(&old_frontiers);
        assert_eq!(snapshot.get_content("story.md").unwrap(), "draft one");
        assert!(!snapshot
            .list_all_paths()
            .contains(&"extra.md".to_string()));

        // Live document is untouched
        assert_eq!(doc.get_content("story.md").unwrap(), "final text");
    }

    #[tokio::test]
    async fn test_checkout_bad_frontiers_falls_back_to_latest() {
        let doc = fresh().await;
        doc.handle_file_create("now.md", None).unwrap();
        let snapshot = doc.checkout(&[0xFF, 0x00, 0x12]);
        assert!(snapshot.list_all_paths().contains(&"now.md".to_string()));
    }

    #[tokio::test]
    async fn test_referenced_blob_hashes() {
        let doc = fresh().await;
        doc.handle_file_create("a.png", None).unwrap();
        doc.handle_file_create("b.png", None).unwrap();
        doc.set_blob_hash("a.png", &"11".repeat(32)).unwrap();
        doc.set_blob_hash("b.png", &"22".repeat(32)).unwrap();
        doc.handle_file_delete("b.png").unwrap();

        let referenced = doc.referenced_blob_hashes();
        assert!(referenced.contains(&"11".repeat(32)));
        assert!(!referenced.contains(&"22".repeat(32)));
    }

    #[tokio::test]
    async fn test_set_blob_hash_returns_previous() {
        let doc = fresh().await;
        doc.handle_file_create("pic.png", None).unwrap();
        assert_eq!(doc.set_blob_hash("pic.png", &"aa".repeat(32)).unwrap(), None);
        assert_eq!(
            doc.set_blob_hash("pic.png", &"bb".repeat(32)).unwrap(),
            Some("aa".repeat(32))
        );
        let node = doc.get_node("pic.png").unwrap();
        assert!(matches!(node.kind, NodeKind::Binary { .. }));
    }
}
