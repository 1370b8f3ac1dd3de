//! Manifest, commit, and delta records, and the key layout.

use serde::{Deserialize, Serialize};

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// The top-level record at `<prefix>/<vault>/manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudManifest {
    /// Layout version of everything under this prefix
    pub format_version: u32,
    /// Vault this prefix belongs to
    pub vault_id: String,
    /// When the prefix was first written, epoch ms
    pub created_at: i64,
    /// When the manifest was last rewritten, epoch ms
    pub updated_at: i64,
    /// Commit hash at `refs/HEAD`, when any commit exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
    /// Id of the newest delta object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_delta_id: Option<String>,
    /// Fingerprint of the vault key the deltas are sealed with
    pub key_fingerprint: String,
    /// Monotonic push counter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Metadata of one encrypted delta object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaMeta {
    /// Delta object id: `<ts>-<hash>`
    pub id: String,
    /// When the delta was published, epoch ms
    pub timestamp: i64,
    /// Hex SHA-256 of the encrypted delta object
    pub hash: String,
    /// Encrypted object size in bytes
    pub size: u64,
    /// Sealed copy of the publisher's document version vector
    pub encrypted_doc_version: String,
    /// Previous delta in the chain, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_delta_id: Option<String>,
}

/// One commit at `<prefix>/<vault>/commits/<hash>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    /// Commit hash (content hash of the delta chain head)
    pub hash: String,
    /// When the commit was made, epoch ms
    pub timestamp: i64,
    /// The delta this commit publishes
    pub delta: DeltaMeta,
    /// Parent commit, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_commit: Option<String>,
}

/// Key layout under `<prefix>/<vault>/`.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: String,
}

impl VaultLayout {
    /// Layout rooted at `<prefix>/<vault_id>`.
    #[must_use]
    pub fn new(prefix: &str, vault_id: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            root: format!("{prefix}/{vault_id}"),
        }
    }

    /// `<root>/manifest.json`
    #[must_use]
    pub fn manifest(&self) -> String {
        format!("{}/manifest.json", self.root)
    }

    /// `<root>/refs/HEAD`
    #[must_use]
    pub fn head_ref(&self) -> String {
        format!("{}/refs/HEAD", self.root)
    }

    /// `<root>/commits/<hash>.json`
    #[must_use]
    pub fn commit(&self, hash: &str) -> String {
        format!("{}/commits/{hash}.json", self.root)
    }

    /// `<root>/deltas/<id>.enc`
    #[must_use]
    pub fn delta(&self, id: &str) -> String {
        format!("{}/deltas/{id}.enc", self.root)
    }

    /// `<root>/deltas/` (for listing)
    #[must_use]
    pub fn deltas_prefix(&self) -> String {
        format!("{}/deltas/", self.root)
    }
}
