//! The vault error taxonomy.
//!
//! Every failure carries a category, a severity, and a recoverability
//! flag. The session boundary uses recoverability to decide between
//! reconnect-with-backoff and permanent teardown; the host-notification
//! filter shows only `Error` and `Critical` severities.

use thiserror::Error;

/// Coarse error category, mirroring the `network.* / storage.* / sync.* /
/// transport.* / peer.* / config.* / crypto.*` taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Transport/link issues
    Network,
    /// Storage adapter failures
    Storage,
    /// Sync protocol and CRDT import failures
    Sync,
    /// Transport bootstrap failures
    Transport,
    /// Peer registry failures
    Peer,
    /// Configuration and migration failures
    Config,
    /// Cryptographic failures
    Crypto,
}

/// How loudly a failure should surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Debug-only diagnostics
    Info,
    /// Logged, not shown
    Warning,
    /// Shown to the user
    Error,
    /// Shown to the user; the vault may be unusable
    Critical,
}

/// Unified error type for vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Storage adapter failure
    #[error(transparent)]
    Storage(#[from] peervault_storage::StorageError),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] peervault_crypto::CryptoError),

    /// Blob store failure
    #[error(transparent)]
    Blob(#[from] peervault_blobs::BlobError),

    /// Wire protocol failure
    #[error(transparent)]
    Protocol(#[from] peervault_proto::ProtocolError),

    /// Transport failure
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    /// The CRDT rejected imported bytes
    #[error("bad update: {0}")]
    BadUpdate(String),

    /// CRDT engine failure outside of import
    #[error("document error: {0}")]
    Document(String),

    /// Peers belong to different vaults and adoption was declined
    #[error("vault mismatch: ours {ours}, theirs {theirs}")]
    VaultMismatch {
        /// Local vault id
        ours: String,
        /// Remote vault id
        theirs: String,
    },

    /// Snapshot chunks missing after the idle timeout
    #[error("snapshot transfer incomplete: {received}/{total} chunks")]
    SnapshotGap {
        /// Chunks received
        received: u32,
        /// Chunks expected
        total: u32,
    },

    /// A phase deadline expired
    #[error("timed out during {0}")]
    Timeout(&'static str),

    /// Session exceeded the tolerated error count within the window
    #[error("session exceeded {0} errors within the window")]
    ErrorLimit(usize),

    /// Peer closed the session with a protocol-level error
    #[error("peer error {code:?}: {message}")]
    PeerError {
        /// Code from the ERROR frame
        code: peervault_proto::ErrorCode,
        /// Detail from the ERROR frame
        message: String,
    },

    /// No such peer in the registry
    #[error("unknown peer: {0}")]
    PeerNotFound(String),

    /// A stored record could not be parsed
    #[error("corrupt record at {key}: {detail}")]
    CorruptRecord {
        /// Storage key
        key: String,
        /// Parse failure detail
        detail: String,
    },

    /// Migration chain failure
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// Operation requires a part of the vault that is not initialized
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),
}

impl VaultError {
    /// The taxonomy category of this error.
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::Storage(_) | Self::CorruptRecord { .. } => Category::Storage,
            Self::Crypto(_) => Category::Crypto,
            Self::Blob(_) => Category::Storage,
            Self::Protocol(_)
            | Self::BadUpdate(_)
            | Self::VaultMismatch { .. }
            | Self::SnapshotGap { .. }
            | Self::ErrorLimit(_)
            | Self::PeerError { .. } => Category::Sync,
            Self::Document(_) => Category::Sync,
            Self::Transport(_) => Category::Transport,
            Self::Timeout(_) => Category::Network,
            Self::PeerNotFound(_) => Category::Peer,
            Self::MigrationFailed(_) | Self::NotInitialized(_) => Category::Config,
        }
    }

    /// How loudly this failure should surface.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::PeerNotFound(_) => Severity::Warning,
            Self::Timeout(_) | Self::SnapshotGap { .. } => Severity::Warning,
            Self::VaultMismatch { .. }
            | Self::MigrationFailed(_)
            | Self::NotInitialized(_) => Severity::Critical,
            _ => Severity::Error,
        }
    }

    /// Whether the session boundary should retry after this failure.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::SnapshotGap { .. } => true,
            Self::Transport(e) => e.recoverable(),
            Self::Storage(_) | Self::Blob(_) => true,
            Self::BadUpdate(_) => true,
            Self::VaultMismatch { .. }
            | Self::ErrorLimit(_)
            | Self::MigrationFailed(_)
            | Self::NotInitialized(_) => false,
            Self::Protocol(_) => false,
            Self::PeerError { code, .. } => !matches!(
                code,
                peervault_proto::ErrorCode::VaultMismatch
                    | peervault_proto::ErrorCode::ErrorLimit
            ),
            _ => false,
        }
    }
}

impl From<loro::LoroError> for VaultError {
    fn from(e: loro::LoroError) -> Self {
        Self::Document(e.to_string())
    }
}

impl From<loro::LoroEncodeError> for VaultError {
    fn from(e: loro::LoroEncodeError) -> Self {
        Self::Document(e.to_string())
    }
}
