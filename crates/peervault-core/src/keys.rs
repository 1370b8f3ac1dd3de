//! Persisted storage keys and key-format helpers.
//!
//! Every component writes under the shared storage adapter using these
//! fixed keys and prefixes. Changing any of them is a schema migration.

/// Latest full CRDT snapshot.
pub const SNAPSHOT_KEY: &str = "peervault-snapshot";

/// Schema-version record (JSON).
pub const SCHEMA_VERSION_KEY: &str = "peervault-schema-version";

/// 32 bytes of secret material the device secret is derived from.
pub const TRANSPORT_KEY: &str = "peervault-transport-key";

/// Vault encryption key sealed under the device secret.
pub const VAULT_KEY_KEY: &str = "vaultkey-encrypted";

/// Prefix for peer records: `peer:<nodeId>`.
pub const PEER_PREFIX: &str = "peer:";

/// Prefix for GC checkpoints.
pub const GC_CHECKPOINT_PREFIX: &str = "gc-checkpoint-";

/// Prefix for pre-migration backups.
pub const BACKUP_PREFIX: &str = "peervault-backup-";

/// Key for a peer record.
#[must_use]
pub fn peer_key(node_id: &str) -> String {
    format!("{PEER_PREFIX}{node_id}")
}

/// Snapshot half of a GC checkpoint: `gc-checkpoint-<ts>-snapshot`.
#[must_use]
pub fn gc_checkpoint_snapshot_key(timestamp_ms: i64) -> String {
    format!("{GC_CHECKPOINT_PREFIX}{timestamp_ms}-snapshot")
}

/// Metadata half of a GC checkpoint.
#[must_use]
pub fn gc_checkpoint_meta_key(timestamp_ms: i64) -> String {
    format!("{GC_CHECKPOINT_PREFIX}{timestamp_ms}-meta")
}

/// Snapshot half of a migration backup:
/// `peervault-backup-v<version>-<ts>-snapshot`.
#[must_use]
pub fn backup_snapshot_key(version: u32, timestamp_ms: i64) -> String {
    format!("{BACKUP_PREFIX}v{version}-{timestamp_ms}-snapshot")
}

/// Metadata half of a migration backup.
#[must_use]
pub fn backup_meta_key(version: u32, timestamp_ms: i64) -> String {
    format!("{BACKUP_PREFIX}v{version}-{timestamp_ms}-meta")
}

/// Extract the timestamp from a checkpoint or backup key of the form
/// `<prefix><ts>-snapshot` / `<prefix>v<ver>-<ts>-snapshot`.
#[must_use]
pub fn timestamp_of(key: &str) -> Option<i64> {
    let trimmed = key
        .strip_suffix("-snapshot")
        .or_else(|| key.strip_suffix("-meta"))?;
    trimmed.rsplit('-').next()?.parse().ok()
}
