//! Events emitted by the document manager and the peer manager.

use tokio::sync::oneshot;

/// Where a change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// A host call on this device
    Local,
    /// Imported from a peer or the cloud
    Remote,
}

/// What happened to a file node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Node appeared
    Created,
    /// Metadata or content changed
    Modified,
    /// Node was soft-deleted
    Deleted,
    /// Node moved; `from` is the previous path
    Renamed {
        /// Previous path
        from: String,
    },
}

/// A change to one file node, delivered in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path after the change (or the deleted path)
    pub path: String,
    /// What happened
    pub change: FileChange,
    /// Local mutation or remote import
    pub origin: EventOrigin,
}

/// Overall vault status shown to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No peers configured or reachable
    Offline,
    /// At least one session is catching up
    Syncing,
    /// All live sessions are idle and caught up
    Synced,
    /// At least one session is in an error state
    Degraded,
}

/// High-level events delivered to the host.
#[derive(Debug)]
pub enum VaultEvent {
    /// Overall status changed
    StatusChange(SyncStatus),
    /// A file changed (local edit confirmation or remote import)
    File(FileEvent),
    /// A peer session reached Live
    PeerConnected {
        /// Peer node id
        node_id: String,
    },
    /// A peer finished catch-up
    PeerSynced {
        /// Peer node id
        node_id: String,
    },
    /// A peer session ended
    PeerDisconnected {
        /// Peer node id
        node_id: String,
        /// Reason, when one was given
        reason: Option<String>,
    },
    /// A peer session failed
    PeerError {
        /// Peer node id
        node_id: String,
        /// Failure description
        error: String,
    },
    /// A blob arrived from a peer
    BlobReceived {
        /// Hex SHA-256 of the content
        hash: String,
    },
    /// Updates were applied while live
    LiveUpdates,
    /// A peer with a different vault id wants this device to adopt theirs.
    /// Respond `true` to adopt and pull a full snapshot.
    VaultAdoptionRequest {
        /// Peer node id
        node_id: String,
        /// The peer's vault id
        peer_vault_id: String,
        /// This device's vault id
        our_vault_id: String,
        /// Send the decision here
        respond: oneshot::Sender<bool>,
    },
    /// A paired peer offered the vault encryption key. Respond `true`
    /// to accept and start encrypting local storage with it.
    VaultKeyOffered {
        /// Peer node id
        node_id: String,
        /// Send the decision here
        respond: oneshot::Sender<bool>,
    },
    /// The vault encryption key was accepted and installed
    VaultKeyReceived {
        /// Fingerprint of the installed key
        fingerprint: String,
    },
}
