//! # PeerVault Cloud
//!
//! Optional propagation of vault state through an untrusted object-storage
//! bucket. Devices that are never online at the same time converge by
//! publishing encrypted operation-log deltas and a commit chain under a
//! flat key prefix:
//!
//! ```text
//! <prefix>/<vault>/manifest.json
//! <prefix>/<vault>/refs/HEAD
//! <prefix>/<vault>/commits/<hash>.json
//! <prefix>/<vault>/deltas/<ts>-<hash>.enc
//! ```
//!
//! The bucket never sees plaintext: deltas are sealed with the vault key,
//! and the manifest carries only the key fingerprint so devices can detect
//! a key mismatch before downloading anything. Request signing for
//! S3-compatible endpoints follows the AWS SigV4 canonicalization and
//! HMAC chain; the HTTP client itself lives outside this crate, behind
//! [`ObjectBucket`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bucket;
pub mod error;
pub mod manifest;
pub mod signing;
pub mod sync;

pub use bucket::{list_all, ListPage, MemoryBucket, ObjectBucket};
pub use error::CloudError;
pub use manifest::{CloudManifest, CommitRecord, DeltaMeta, VaultLayout, MANIFEST_FORMAT_VERSION};
pub use signing::{CanonicalRequest, SigV4Signer, SigningScope};
pub use sync::{CloudSync, PullResult, PushResult};

/// Result alias for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;
