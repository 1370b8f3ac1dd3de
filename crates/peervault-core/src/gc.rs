//! Garbage collection: shallow-snapshot compaction and orphan blobs.
//!
//! Compaction discards detailed op history, so it only runs when every
//! known peer has synced recently enough to have received that history —
//! otherwise a long-offline peer would be unable to catch up incrementally
//! and would be forced into a full snapshot. The freshness rule
//! (`min_history_days`) encodes that, and `require_peer_consensus` gates
//! it. A recovery checkpoint is written before anything is touched.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use peervault_blobs::BlobStore;
use peervault_storage::Storage;

use crate::clock::now_ms;
use crate::config::GcConfig;
use crate::document::VaultDocument;
use crate::keys::{
    gc_checkpoint_meta_key, gc_checkpoint_snapshot_key, timestamp_of, GC_CHECKPOINT_PREFIX,
    SNAPSHOT_KEY,
};
use crate::migrations::CURRENT_SCHEMA_VERSION;
use crate::sync::peers::PeerRecord;
use crate::Result;

const MS_PER_DAY: i64 = 24 * 3600 * 1000;

/// Outcome of the peer-consensus check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusReport {
    /// Whether compaction may proceed
    pub can_compact: bool,
    /// Peers whose last sync is older than the history window
    pub stale_peers: Vec<String>,
    /// Human-readable explanation when compaction is blocked
    pub reason: Option<String>,
}

/// Result of a completed GC run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Full snapshot size before compaction
    pub before_size: usize,
    /// Snapshot size after compaction
    pub after_size: usize,
    /// Orphan blobs removed
    pub blobs_removed: usize,
    /// Blob bytes reclaimed
    pub blob_bytes_reclaimed: u64,
    /// When the run started, epoch ms
    pub timestamp_ms: i64,
    /// Wall-clock duration of the run
    pub duration_ms: u64,
}

/// Checkpoint metadata written next to the checkpoint snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointMeta {
    timestamp: i64,
    document_size: usize,
    schema_version: u32,
}

/// The garbage collector. Owns nothing; borrows the document, blob store,
/// and storage it operates on.
pub struct GarbageCollector {
    storage: Arc<dyn Storage>,
    document: Arc<VaultDocument>,
    blobs: Arc<BlobStore>,
    config: GcConfig,
}

impl GarbageCollector {
    /// Create a collector over the given components.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        document: Arc<VaultDocument>,
        blobs: Arc<BlobStore>,
        config: GcConfig,
    ) -> Self {
        Self {
            storage,
            document,
            blobs,
            config,
        }
    }

    /// Size of the persisted document snapshot in bytes.
    pub async fn current_doc_size(&self) -> Result<usize> {
        Ok(self
            .storage
            .read(SNAPSHOT_KEY)
            .await?
            .map_or(0, |snapshot| snapshot.len()))
    }

    /// Whether the size gate is open.
    pub async fn should_run(&self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let threshold = self.config.max_doc_size_mb as usize * 1024 * 1024;
        Ok(self.current_doc_size().await? >= threshold)
    }

    /// Check the freshness rule against the known peers.
    #[must_use]
    pub fn check_peer_consensus(&self, peers: &[PeerRecord]) -> ConsensusReport {
        if !self.config.require_peer_consensus {
            return ConsensusReport {
                can_compact: true,
                stale_peers: Vec::new(),
                reason: None,
            };
        }

        let cutoff = now_ms() - i64::from(self.config.min_history_days) * MS_PER_DAY;
        let stale_peers: Vec<String> = peers
            .iter()
            .filter(|peer| peer.last_sync_time < cutoff)
            .map(|peer| peer.display_name())
            .collect();

        if stale_peers.is_empty() {
            ConsensusReport {
                can_compact: true,
                stale_peers,
                reason: None,
            }
        } else {
            ConsensusReport {
                can_compact: false,
                reason: Some(format!(
                    "peers not synced within {} days: {}",
                    self.config.min_history_days,
                    stale_peers.join(", ")
                )),
                stale_peers,
            }
        }
    }

    /// Run GC unconditionally: checkpoint, compact, persist, clean
    /// orphan blobs.
    ///
    /// # Errors
    ///
    /// Checkpoint and compaction failures abort the run. Per-blob cleanup
    /// failures are counted, not fatal.
    pub async fn run(
        &self,
        mut progress: impl FnMut(&'static str) + Send,
    ) -> Result<GcReport> {
        let started = Instant::now();
        let timestamp_ms = now_ms();

        progress("checkpoint");
        self.write_checkpoint(timestamp_ms).await?;

        progress("compact");
        let compaction = self.document.compact()?;
        self.document.save().await?;

        progress("blobs");
        let referenced = self.document.referenced_blob_hashes();
        let orphans = self.blobs.clean_orphans(&referenced).await?;
        if orphans.failed > 0 {
            warn!(failed = orphans.failed, "some orphan blobs could not be removed");
        }

        let report = GcReport {
            before_size: compaction.before_size,
            after_size: compaction.after_size,
            blobs_removed: orphans.count,
            blob_bytes_reclaimed: orphans.bytes_reclaimed,
            timestamp_ms,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            before = report.before_size,
            after = report.after_size,
            blobs_removed = report.blobs_removed,
            "gc run complete"
        );
        Ok(report)
    }

    /// Run GC only when the size gate and the consensus rule allow it,
    /// unless `force` is set. Returns `None` when gated.
    ///
    /// # Errors
    ///
    /// Propagates the same failures as [`GarbageCollector::run`].
    pub async fn maybe_run(&self, peers: &[PeerRecord], force: bool) -> Result<Option<GcReport>> {
        if !force {
            if !self.should_run().await? {
                debug!("gc gated: size below threshold or disabled");
                return Ok(None);
            }
            let consensus = self.check_peer_consensus(peers);
            if !consensus.can_compact {
                debug!(reason = ?consensus.reason, "gc gated: peer consensus");
                return Ok(None);
            }
        }
        Ok(Some(self.run(|_| {}).await?))
    }

    /// Delete old checkpoints, keeping the newest `keep` by timestamp.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn prune_checkpoints(&self, keep: usize) -> Result<usize> {
        let keys = self.storage.list_prefix(GC_CHECKPOINT_PREFIX).await?;
        let mut stamps: Vec<i64> = keys
            .iter()
            .filter(|k| k.ends_with("-snapshot"))
            .filter_map(|k| timestamp_of(k))
            .collect();
        stamps.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for &stamp in stamps.iter().skip(keep) {
            self.storage
                .delete(&gc_checkpoint_snapshot_key(stamp))
                .await?;
            self.storage.delete(&gc_checkpoint_meta_key(stamp)).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn write_checkpoint(&self, timestamp_ms: i64) -> Result<()> {
        let snapshot = self.document.export_snapshot()?;
        let meta = CheckpointMeta {
            timestamp: timestamp_ms,
            document_size: snapshot.len(),
            schema_version: CURRENT_SCHEMA_VERSION,
        };

        self.storage
            .write(&gc_checkpoint_snapshot_key(timestamp_ms), &snapshot)
            .await?;
        self.storage
            .write(
                &gc_checkpoint_meta_key(timestamp_ms),
                &serde_json::to_vec(&meta).expect("checkpoint meta serializes"),
            )
            .await?;
        debug!(bytes = snapshot.len(), "gc checkpoint written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::peers::PeerState;
    use peervault_storage::MemoryStorage;

    async fn setup(config: GcConfig) -> (Arc<MemoryStorage>, Arc<VaultDocument>, Arc<BlobStore>, GarbageCollector) {
        let storage = Arc::new(MemoryStorage::new());
        let document = Arc::new(
            VaultDocument::load(storage.clone() as Arc<dyn Storage>)
                .await
                .unwrap(),
        );
        let blobs = Arc::new(BlobStore::new(storage.clone() as Arc<dyn Storage>));
        let gc = GarbageCollector::new(
            storage.clone() as Arc<dyn Storage>,
            document.clone(),
            blobs.clone(),
            config,
        );
        (storage, document, blobs, gc)
    }

    fn peer(name: &str, last_sync_time: i64) -> PeerRecord {
        PeerRecord {
            node_id: format!("{name}-id"),
            ticket: None,
            hostname: None,
            nickname: Some(name.to_string()),
            first_seen: 0,
            last_seen: last_sync_time,
            last_sync_time,
            state: PeerState::Disconnected,
            group_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_should_run_gates() {
        let (_, document, _, gc) = setup(GcConfig {
            max_doc_size_mb: 1,
            ..GcConfig::default()
        })
        .await;
        document.save().await.unwrap();
        // A fresh doc is far below 1 MiB
        assert!(!gc.should_run().await.unwrap());

        let (_, document, _, gc) = setup(GcConfig {
            enabled: false,
            max_doc_size_mb: 0,
            ..GcConfig::default()
        })
        .await;
        document.save().await.unwrap();
        assert!(!gc.should_run().await.unwrap());

        let (_, document, _, gc) = setup(GcConfig {
            max_doc_size_mb: 0,
            ..GcConfig::default()
        })
        .await;
        document.save().await.unwrap();
        assert!(gc.should_run().await.unwrap());
    }

    #[tokio::test]
    async fn test_consensus_names_stale_peers() {
        let (_, _, _, gc) = setup(GcConfig {
            min_history_days: 30,
            ..GcConfig::default()
        })
        .await;

        let fresh_peer = peer("laptop", now_ms());
        let stale_peer = peer("old-phone", now_ms() - 40 * MS_PER_DAY);

        let report = gc.check_peer_consensus(&[fresh_peer.clone(), stale_peer]);
        assert!(!report.can_compact);
        assert_eq!(report.stale_peers, vec!["old-phone".to_string()]);
        assert!(report.reason.as_deref().unwrap().contains("old-phone"));

        let report = gc.check_peer_consensus(&[fresh_peer]);
        assert!(report.can_compact);
        assert!(report.reason.is_none());
    }

    #[tokio::test]
    async fn test_consensus_disabled() {
        let (_, _, _, gc) = setup(GcConfig {
            require_peer_consensus: false,
            ..GcConfig::default()
        })
        .await;
        let report = gc.check_peer_consensus(&[peer("ancient", 0)]);
        assert!(report.can_compact);
    }

    #[tokio::test]
    async fn test_run_compacts_and_cleans() {
        let (storage, document, blobs, gc) = setup(GcConfig::default()).await;

        document.handle_file_create("doc.md", None).unwrap();
        for i in 0..20 {
            document
                .set_text_content("doc.md", &format!("rev {i}"))
                .unwrap();
        }
        document.handle_file_create("img.png", None).unwrap();
        let live = blobs.add(b"live blob", None).await.unwrap();
        document.set_blob_hash("img.png", &live).unwrap();
        blobs.add(b"orphan blob", None).await.unwrap();
        document.save().await.unwrap();

        let mut phases = Vec::new();
        let report = gc.run(|phase| phases.push(phase)).await.unwrap();

        assert_eq!(phases, vec!["checkpoint", "compact", "blobs"]);
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.blob_bytes_reclaimed, 11);
        assert!(blobs.has(&live).await.unwrap());

        // Live state survives
        assert_eq!(document.get_content("doc.md").unwrap(), "rev 19");
        assert_eq!(document.get_blob_hash("img.png").unwrap(), live);

        // Checkpoint pair exists
        let checkpoints = storage.list_prefix(GC_CHECKPOINT_PREFIX).await.unwrap();
        assert_eq!(checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_maybe_run_respects_gates() {
        let (_, document, _, gc) = setup(GcConfig {
            max_doc_size_mb: 0,
            min_history_days: 30,
            ..GcConfig::default()
        })
        .await;
        document.save().await.unwrap();

        // Stale peer blocks the run
        let stale = peer("p", now_ms() - 40 * MS_PER_DAY);
        assert!(gc.maybe_run(&[stale], false).await.unwrap().is_none());

        // Once the peer syncs, the run proceeds
        let synced = peer("p", now_ms());
        assert!(gc.maybe_run(&[synced], false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_overrides_gates() {
        let (_, document, _, gc) = setup(GcConfig {
            enabled: false,
            ..GcConfig::default()
        })
        .await;
        document.save().await.unwrap();
        let stale = peer("p", 0);
        assert!(gc.maybe_run(&[stale], true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_checkpoints_keeps_newest() {
        let (storage, _, _, gc) = setup(GcConfig::default()).await;
        for stamp in [100i64, 200, 300, 400] {
            storage
                .write(&gc_checkpoint_snapshot_key(stamp), b"snap")
                .await
                .unwrap();
            storage
                .write(&gc_checkpoint_meta_key(stamp), b"{}")
                .await
                .unwrap();
        }

        let removed = gc.prune_checkpoints(2).await.unwrap();
        assert_eq!(removed, 2);

        let left = storage.list_prefix(GC_CHECKPOINT_PREFIX).await.unwrap();
        assert!(left.contains(&gc_checkpoint_snapshot_key(400)));
        assert!(left.contains(&gc_checkpoint_snapshot_key(300)));
        assert!(!left.contains(&gc_checkpoint_snapshot_key(200)));
        assert!(!left.contains(&gc_checkpoint_snapshot_key(100)));
    }
}
