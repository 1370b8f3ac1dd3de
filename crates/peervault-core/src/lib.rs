//! # PeerVault Core
//!
//! The convergence machinery of the vault:
//! - **Document manager**: the CRDT file tree with per-file collaborative
//!   text and binary references, snapshot/incremental export, history
//!   checkout, and change subscriptions
//! - **Sync sessions**: the per-peer state machine driving handshake,
//!   catch-up, blob reconciliation, and live update exchange over a pair
//!   of reliable streams
//! - **Peer manager**: the persistent peer registry, session supervision
//!   with backoff, pairing, and gossip
//! - **Garbage collector**: shallow-snapshot compaction under the
//!   peer-consensus safety rule, plus orphan blob reclamation
//! - **Migration runner**: the linear schema version chain with
//!   pre-migration backups
//! - **Vault**: the orchestrator the host talks to
//!
//! ## Concurrency model
//!
//! One vault is a set of cooperating tokio tasks: one per session, one
//! accept loop, plus timers. Nothing blocks; the CRDT handle lives behind
//! a short-held lock owned by the document manager, and `compact()` swaps
//! it under an exclusive critical section while exported snapshots stay
//! valid as detached buffers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod diff;
pub mod document;
pub mod error;
pub mod events;
pub mod gc;
pub mod keys;
pub mod migrations;
pub mod sync;
pub mod transport;
pub mod vault;

pub use config::{GcConfig, SessionTuning, VaultConfig};
pub use diff::{apply_text_edits, compute_text_edits, merge_adjacent_edits, TextEdit};
pub use document::{
    CompactionResult, DocumentSnapshot, NodeKind, NodeView, VaultDocument, VersionEntry,
};
pub use error::{Category, Severity, VaultError};
pub use events::{EventOrigin, FileChange, FileEvent, SyncStatus, VaultEvent};
pub use gc::{ConsensusReport, GarbageCollector, GcReport};
pub use migrations::{
    Migration, MigrationContext, MigrationOutcome, MigrationRunner, SchemaVersion,
    CURRENT_SCHEMA_VERSION,
};
pub use sync::peers::{PeerManager, PeerRecord, PeerState};
pub use sync::session::{SessionConfig, SessionPhase};
pub use transport::{
    IncomingSession, MemoryHub, MemoryTransport, ReliableStream, StreamPair, TransportError,
    VaultTransport,
};
pub use vault::{FileContent, Vault, VaultStatus};

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, VaultError>;
