//! Schema migration runner.
//!
//! The persistent schema carries a version number at
//! `peervault-schema-version`. Upgrades walk a strictly increasing chain
//! of migrations; before the first step the primary document key is backed
//! up so a failed or regretted upgrade can be rolled back with
//! [`MigrationRunner::restore_from_backup`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use peervault_storage::Storage;

use crate::clock::now_ms;
use crate::keys::{backup_meta_key, backup_snapshot_key, SCHEMA_VERSION_KEY, SNAPSHOT_KEY};
use crate::{Result, VaultError};

/// Current schema version written by fresh vaults.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// The stored schema-version record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    /// Schema version of the persisted data
    pub version: u32,
    /// When the record was last written, epoch ms
    pub updated_at: i64,
    /// Descriptions of migrations that have run, oldest first
    pub migrations_run: Vec<String>,
}

/// Metadata stored next to a pre-migration backup snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackupMeta {
    version: u32,
    timestamp: i64,
}

/// Everything a migration step may touch.
pub struct MigrationContext {
    /// The shared storage adapter
    pub storage: Arc<dyn Storage>,
}

/// One step of the schema chain.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Version this step upgrades from.
    fn from_version(&self) -> u32;

    /// Version this step upgrades to. Must be `from_version() + 1` for the
    /// chain walk to find it.
    fn to_version(&self) -> u32;

    /// Human-readable description, recorded in the schema record.
    fn description(&self) -> &'static str;

    /// Perform the upgrade.
    async fn migrate(&self, ctx: &MigrationContext) -> Result<()>;
}

/// Outcome of a migration run.
#[derive(Debug)]
pub enum MigrationOutcome {
    /// Stored version already at or past the target
    UpToDate,
    /// Chain completed
    Migrated {
        /// Version before the run
        from: u32,
        /// Version after the run
        to: u32,
        /// Steps that ran
        migrations_run: Vec<String>,
        /// Backup written before the first step
        backup_key: String,
    },
    /// Chain failed part-way; the backup is retained
    Failed {
        /// Failure description
        error: String,
        /// Steps that completed before the failure
        completed: Vec<String>,
        /// Backup written before the first step, when one was made
        backup_key: Option<String>,
    },
}

/// Walks the migration chain against a storage adapter.
pub struct MigrationRunner {
    storage: Arc<dyn Storage>,
    migrations: Vec<Arc<dyn Migration>>,
}

impl MigrationRunner {
    /// Create a runner with the built-in migration chain.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_migrations(storage, builtin_migrations())
    }

    /// Create a runner with a custom chain (tests).
    #[must_use]
    pub fn with_migrations(
        storage: Arc<dyn Storage>,
        migrations: Vec<Arc<dyn Migration>>,
    ) -> Self {
        Self {
            storage,
            migrations,
        }
    }

    /// Read the stored schema version; missing or unparseable reads as 0.
    pub async fn stored_version(&self) -> u32 {
        match self.storage.read(SCHEMA_VERSION_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice::<SchemaVersion>(&bytes)
                .map(|record| record.version)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Run the chain up to `target`, reporting step progress through
    /// `progress(step_index, step_count)`.
    ///
    /// # Errors
    ///
    /// Storage failures while reading state or writing the backup surface
    /// as errors; failures inside a migration step are captured in
    /// [`MigrationOutcome::Failed`].
    pub async fn run(
        &self,
        target: u32,
        mut progress: impl FnMut(usize, usize) + Send,
    ) -> Result<MigrationOutcome> {
        let current = self.stored_version().await;
        if current >= target {
            debug!(current, target, "schema already up to date");
            return Ok(MigrationOutcome::UpToDate);
        }

        let Some(chain) = self.find_chain(current, target) else {
            return Ok(MigrationOutcome::Failed {
                error: format!("no migration chain from v{current} to v{target}"),
                completed: Vec::new(),
                backup_key: None,
            });
        };

        let backup_key = self.write_backup(current).await?;
        info!(from = current, to = target, backup = %backup_key, "running migrations");

        let ctx = MigrationContext {
            storage: Arc::clone(&self.storage),
        };
        let total = chain.len();
        let mut completed = Vec::new();

        for (index, step) in chain.iter().enumerate() {
            debug!(
                from = step.from_version(),
                to = step.to_version(),
                "migration step: {}",
                step.description()
            );
            if let Err(e) = step.migrate(&ctx).await {
                warn!(error = %e, "migration step failed; backup retained");
                return Ok(MigrationOutcome::Failed {
                    error: e.to_string(),
                    completed,
                    backup_key: Some(backup_key),
                });
            }
            completed.push(step.description().to_string());
            progress(index + 1, total);
        }

        self.write_version(target, &completed).await?;
        Ok(MigrationOutcome::Migrated {
            from: current,
            to: target,
            migrations_run: completed,
            backup_key,
        })
    }

    /// Stamp a fresh vault with the current schema version. Used instead
    /// of `run` when there is no persisted data to migrate.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn mark_current(&self) -> Result<()> {
        self.write_version(CURRENT_SCHEMA_VERSION, &[]).await
    }

    /// Restore the primary document key from a backup and reset the stored
    /// version to the backup's.
    ///
    /// # Errors
    ///
    /// Fails when the backup pair is missing or unreadable.
    pub async fn restore_from_backup(&self, backup_key: &str) -> Result<()> {
        let meta_key = backup_key
            .strip_suffix("-snapshot")
            .map(|stem| format!("{stem}-meta"))
            .ok_or_else(|| VaultError::MigrationFailed(format!("not a backup key: {backup_key}")))?;

        let snapshot = self
            .storage
            .read(backup_key)
            .await?
            .ok_or_else(|| VaultError::MigrationFailed(format!("missing backup: {backup_key}")))?;
        let meta_bytes = self
            .storage
            .read(&meta_key)
            .await?
            .ok_or_else(|| VaultError::MigrationFailed(format!("missing backup meta: {meta_key}")))?;
        let meta: BackupMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| VaultError::CorruptRecord {
                key: meta_key.clone(),
                detail: e.to_string(),
            })?;

        self.storage.write(SNAPSHOT_KEY, &snapshot).await?;
        self.write_version(meta.version, &[format!("restored from {backup_key}")])
            .await?;
        info!(version = meta.version, backup = %backup_key, "restored from backup");
        Ok(())
    }

    fn find_chain(&self, from: u32, to: u32) -> Option<Vec<Arc<dyn Migration>>> {
        let mut chain = Vec::new();
        let mut version = from;
        while version < to {
            let step = self
                .migrations
                .iter()
                .find(|m| m.from_version() == version && m.to_version() == version + 1)?;
            chain.push(Arc::clone(step));
            version += 1;
        }
        Some(chain)
    }

    async fn write_backup(&self, version: u32) -> Result<String> {
        let stamp = now_ms();
        let snapshot_key = backup_snapshot_key(version, stamp);
        let meta_key = backup_meta_key(version, stamp);

        let snapshot = self
            .storage
            .read(SNAPSHOT_KEY)
            .await?
            .unwrap_or_default();
        self.storage.write(&snapshot_key, &snapshot).await?;

        let meta = BackupMeta {
            version,
            timestamp: stamp,
        };
        self.storage
            .write(&meta_key, &serde_json::to_vec(&meta).expect("meta serializes"))
            .await?;
        Ok(snapshot_key)
    }

    async fn write_version(&self, version: u32, migrations_run: &[String]) -> Result<()> {
        let record = SchemaVersion {
            version,
            updated_at: now_ms(),
            migrations_run: migrations_run.to_vec(),
        };
        self.storage
            .write(
                SCHEMA_VERSION_KEY,
                &serde_json::to_vec(&record).expect("schema record serializes"),
            )
            .await?;
        Ok(())
    }
}

/// The built-in chain.
fn builtin_migrations() -> Vec<Arc<dyn Migration>> {
    vec![Arc::new(MoveLegacySnapshotKey)]
}

/// v1 → v2: early builds persisted the document under `vault-doc`; move it
/// to `peervault-snapshot`.
struct MoveLegacySnapshotKey;

#[async_trait]
impl Migration for MoveLegacySnapshotKey {
    fn from_version(&self) -> u32 {
        1
    }

    fn to_version(&self) -> u32 {
        2
    }

    fn description(&self) -> &'static str {
        "move legacy vault-doc snapshot to peervault-snapshot"
    }

    async fn migrate(&self, ctx: &MigrationContext) -> Result<()> {
        const LEGACY_KEY: &str = "vault-doc";
        if let Some(snapshot) = ctx.storage.read(LEGACY_KEY).await? {
            if ctx.storage.read(SNAPSHOT_KEY).await?.is_none() {
                ctx.storage.write(SNAPSHOT_KEY, &snapshot).await?;
            }
            ctx.storage.delete(LEGACY_KEY).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peervault_storage::MemoryStorage;

    struct BumpStep {
        from: u32,
        marker: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Migration for BumpStep {
        fn from_version(&self) -> u32 {
            self.from
        }
        fn to_version(&self) -> u32 {
            self.from + 1
        }
        fn description(&self) -> &'static str {
            self.marker
        }
        async fn migrate(&self, ctx: &MigrationContext) -> Result<()> {
            if self.fail {
                return Err(VaultError::MigrationFailed("step exploded".into()));
            }
            ctx.storage.write(self.marker, b"ran").await?;
            Ok(())
        }
    }

    async fn seed(storage: &MemoryStorage, version: u32) {
        let record = SchemaVersion {
            version,
            updated_at: 0,
            migrations_run: vec![],
        };
        storage
            .write(SCHEMA_VERSION_KEY, &serde_json::to_vec(&record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_version_reads_as_zero() {
        let runner = MigrationRunner::with_migrations(Arc::new(MemoryStorage::new()), vec![]);
        assert_eq!(runner.stored_version().await, 0);
    }

    #[tokio::test]
    async fn test_unparseable_version_reads_as_zero() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .write(SCHEMA_VERSION_KEY, b"not json")
            .await
            .unwrap();
        let runner = MigrationRunner::with_migrations(storage, vec![]);
        assert_eq!(runner.stored_version().await, 0);
    }

    #[tokio::test]
    async fn test_up_to_date_runs_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, 2).await;
        let runner = MigrationRunner::with_migrations(
            storage.clone(),
            vec![Arc::new(BumpStep {
                from: 1,
                marker: "should-not-run",
                fail: false,
            })],
        );

        let outcome = runner.run(2, |_, _| {}).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::UpToDate));
        assert!(!storage.exists("should-not-run").await.unwrap());
    }

    #[tokio::test]
    async fn test_chain_runs_and_records() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, 1).await;
        storage
            .write(SNAPSHOT_KEY, b"document-bytes")
            .await
            .unwrap();

        let runner = MigrationRunner::with_migrations(
            storage.clone(),
            vec![
                Arc::new(BumpStep {
                    from: 1,
                    marker: "step-1",
                    fail: false,
                }),
                Arc::new(BumpStep {
                    from: 2,
                    marker: "step-2",
                    fail: false,
                }),
            ],
        );

        let mut steps = Vec::new();
        let outcome = runner.run(3, |done, total| steps.push((done, total))).await.unwrap();

        let MigrationOutcome::Migrated {
            from,
            to,
            migrations_run,
            backup_key,
        } = outcome
        else {
            panic!("expected Migrated");
        };
        assert_eq!((from, to), (1, 3));
        assert_eq!(migrations_run, vec!["step-1", "step-2"]);
        assert_eq!(steps, vec![(1, 2), (2, 2)]);
        assert!(backup_key.starts_with("peervault-backup-v1-"));

        // Backup holds the pre-migration snapshot bit for bit
        assert_eq!(
            storage.read(&backup_key).await.unwrap().unwrap(),
            b"document-bytes"
        );
        assert_eq!(runner.stored_version().await, 3);

        // Second run is a no-op
        assert!(matches!(
            runner.run(3, |_, _| {}).await.unwrap(),
            MigrationOutcome::UpToDate
        ));
    }

    #[tokio::test]
    async fn test_missing_chain_fails() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, 1).await;
        let runner = MigrationRunner::with_migrations(
            storage,
            vec![Arc::new(BumpStep {
                from: 5,
                marker: "unreachable",
                fail: false,
            })],
        );

        let outcome = runner.run(3, |_, _| {}).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Failed { backup_key: None, .. }));
    }

    #[tokio::test]
    async fn test_failure_keeps_backup_and_version() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, 1).await;
        storage.write(SNAPSHOT_KEY, b"original").await.unwrap();

        let runner = MigrationRunner::with_migrations(
            storage.clone(),
            vec![
                Arc::new(BumpStep {
                    from: 1,
                    marker: "ok-step",
                    fail: false,
                }),
                Arc::new(BumpStep {
                    from: 2,
                    marker: "boom",
                    fail: true,
                }),
            ],
        );

        let outcome = runner.run(3, |_, _| {}).await.unwrap();
        let MigrationOutcome::Failed {
            completed,
            backup_key: Some(backup_key),
            ..
        } = outcome
        else {
            panic!("expected Failed with backup");
        };
        assert_eq!(completed, vec!["ok-step"]);

        // Version unchanged; restore brings the snapshot back
        assert_eq!(runner.stored_version().await, 1);
        storage.write(SNAPSHOT_KEY, b"mangled").await.unwrap();
        runner.restore_from_backup(&backup_key).await.unwrap();
        assert_eq!(
            storage.read(SNAPSHOT_KEY).await.unwrap().unwrap(),
            b"original"
        );
        assert_eq!(runner.stored_version().await, 1);
    }

    #[tokio::test]
    async fn test_builtin_legacy_key_move() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, 1).await;
        storage.write("vault-doc", b"legacy-snapshot").await.unwrap();

        let runner = MigrationRunner::new(storage.clone());
        let outcome = runner.run(CURRENT_SCHEMA_VERSION, |_, _| {}).await.unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { .. }));

        assert_eq!(
            storage.read(SNAPSHOT_KEY).await.unwrap().unwrap(),
            b"legacy-snapshot"
        );
        assert!(!storage.exists("vault-doc").await.unwrap());
    }
}
