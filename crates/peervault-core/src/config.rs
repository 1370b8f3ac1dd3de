//! Vault configuration.

use serde::{Deserialize, Serialize};

/// Garbage collector gates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcConfig {
    /// Master switch
    pub enabled: bool,
    /// Compaction triggers once the stored document reaches this size
    pub max_doc_size_mb: u64,
    /// Peers must have synced within this many days for compaction to run
    pub min_history_days: u32,
    /// Whether the freshness rule is enforced at all
    pub require_peer_consensus: bool,
    /// Checkpoints kept by `prune_checkpoints`
    pub keep_checkpoints: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_doc_size_mb: 64,
            min_history_days: 30,
            require_peer_consensus: true,
            keep_checkpoints: 3,
        }
    }
}

/// Session timing and backpressure tunables.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionTuning {
    /// Snapshot chunk size in bytes
    pub chunk_size: usize,
    /// Handshake deadline, seconds
    pub handshake_timeout_secs: u64,
    /// Snapshot transfer idle deadline, seconds
    pub snapshot_idle_timeout_secs: u64,
    /// Keepalive cadence, seconds
    pub ping_interval_secs: u64,
    /// PONG deadline after a PING, seconds
    pub pong_timeout_secs: u64,
    /// Per-batch blob transfer deadline, seconds
    pub blob_batch_timeout_secs: u64,
    /// Recoverable errors tolerated within the window before the session
    /// is stopped
    pub max_sync_errors: usize,
    /// Error window, seconds
    pub error_window_secs: u64,
    /// Outbound update queue watermark, messages
    pub send_queue_max_messages: usize,
    /// Below this oplog size, catch-up prefers a full snapshot over
    /// incremental updates
    pub small_history_threshold_bytes: usize,
    /// Reconnect attempts before giving up for this process lifetime
    pub max_reconnect_attempts: u32,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024, // 1 MiB
            handshake_timeout_secs: 30,
            snapshot_idle_timeout_secs: 60,
            ping_interval_secs: 30,
            pong_timeout_secs: 15,
            blob_batch_timeout_secs: 120,
            max_sync_errors: 10,
            error_window_secs: 60,
            send_queue_max_messages: 64,
            small_history_threshold_bytes: 4096,
            max_reconnect_attempts: 8,
        }
    }
}

/// Top-level vault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Hostname advertised in handshakes
    pub hostname: String,
    /// Optional nickname advertised in handshakes
    pub nickname: Option<String>,
    /// Per-blob size cap in bytes
    pub max_blob_size: usize,
    /// Read-cache ceilings for file-backed storage
    pub cache_max_entries: usize,
    /// Read-cache byte ceiling
    pub cache_max_bytes: usize,
    /// Garbage collection gates
    pub gc: GcConfig,
    /// Session tunables
    pub session: SessionTuning,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            hostname: "peervault".to_string(),
            nickname: None,
            max_blob_size: peervault_blobs::DEFAULT_MAX_BLOB_SIZE,
            cache_max_entries: 256,
            cache_max_bytes: 32 * 1024 * 1024,
            gc: GcConfig::default(),
            session: SessionTuning::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = VaultConfig::default();
        assert_eq!(config.session.chunk_size, 1024 * 1024);
        assert_eq!(config.session.ping_interval_secs, 30);
        assert_eq!(config.session.pong_timeout_secs, 15);
        assert_eq!(config.session.max_sync_errors, 10);
        assert_eq!(config.session.max_reconnect_attempts, 8);
        assert_eq!(config.gc.min_history_days, 30);
        assert_eq!(config.max_blob_size, 500 * 1024 * 1024);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: VaultConfig =
            serde_json::from_str(r#"{"hostname":"desk","gc":{"enabled":false}}"#).unwrap();
        assert_eq!(config.hostname, "desk");
        assert!(!config.gc.enabled);
        // Untouched fields fall back to defaults
        assert_eq!(config.gc.min_history_days, 30);
        assert_eq!(config.session.chunk_size, 1024 * 1024);
    }
}
