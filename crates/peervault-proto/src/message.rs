//! Typed sync protocol messages.

/// Protocol version advertised in the `VERSION_INFO` v2 extension.
pub const PROTOCOL_VERSION: u8 = 2;

/// Message type bytes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake: identity, version vector, connectivity details
    VersionInfo = 0x01,
    /// Incremental CRDT updates
    Updates = 0x02,
    /// Ask the peer for a full snapshot
    SnapshotRequest = 0x03,
    /// Full snapshot in a single frame
    Snapshot = 0x04,
    /// One chunk of a multi-frame snapshot
    SnapshotChunk = 0x05,
    /// Catch-up finished; carries the sender's version vector
    SyncComplete = 0x06,
    /// Error signal
    Error = 0x07,
    /// Keepalive probe
    Ping = 0x08,
    /// Keepalive response
    Pong = 0x09,
    /// Hashes referenced by the sender's tree
    BlobHashes = 0x10,
    /// Hashes the sender wants content for
    BlobRequest = 0x11,
    /// One blob's content
    BlobData = 0x12,
    /// Blob transfer finished
    BlobSyncComplete = 0x13,
    /// The sender removed this peer
    PeerRemoved = 0x20,
    /// Gossip: peers the sender knows
    PeerAnnouncement = 0x21,
    /// Ask for the sender's known peers
    PeerRequest = 0x22,
    /// A peer left the mesh
    PeerLeft = 0x23,
    /// Direct-connection upgrade: SDP offer
    SdpOffer = 0x40,
    /// Direct-connection upgrade: SDP answer
    SdpAnswer = 0x41,
    /// Direct-connection upgrade: ICE candidate
    IceCandidate = 0x42,
    /// Direct-connection upgrade: new path ready
    UpgradeReady = 0x43,
    /// Direct-connection upgrade failed; keep the relay path
    UpgradeFailed = 0x44,
}

/// Error codes carried by `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// Peer belongs to a different vault and neither side may adopt
    VaultMismatch = 0x01,
    /// Snapshot chunks were missing after the idle timeout
    SnapshotGap = 0x02,
    /// A requested blob hash is unknown to the sender
    BlobMissing = 0x03,
    /// Peer timed out
    Timeout = 0x04,
    /// Peer sent a frame this side could not handle
    Protocol = 0x05,
    /// Too many errors within the window; session stopped
    ErrorLimit = 0x06,
    /// Unclassified internal failure
    Internal = 0x07,
}

impl TryFrom<u8> for ErrorCode {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::VaultMismatch),
            0x02 => Ok(Self::SnapshotGap),
            0x03 => Ok(Self::BlobMissing),
            0x04 => Ok(Self::Timeout),
            0x05 => Ok(Self::Protocol),
            0x06 => Ok(Self::ErrorLimit),
            0x07 => Ok(Self::Internal),
            _ => Err(crate::ProtocolError::BadFrame("unknown error code")),
        }
    }
}

/// Why a `PEER_ANNOUNCEMENT` was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AnnounceReason {
    /// Periodic gossip
    Gossip = 0x00,
    /// Response to a `PEER_REQUEST`
    Requested = 0x01,
    /// A new peer joined and is being introduced
    NewPeer = 0x02,
}

impl TryFrom<u8> for AnnounceReason {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Gossip),
            0x01 => Ok(Self::Requested),
            0x02 => Ok(Self::NewPeer),
            _ => Err(crate::ProtocolError::BadFrame("unknown announce reason")),
        }
    }
}

/// Why a peer left, as carried by `PEER_LEFT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LeaveReason {
    /// The peer left voluntarily
    Left = 0x00,
    /// The peer was removed by another member
    Removed = 0x01,
    /// The peer has not been seen for too long
    Expired = 0x02,
}

impl TryFrom<u8> for LeaveReason {
    type Error = crate::ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Left),
            0x01 => Ok(Self::Removed),
            0x02 => Ok(Self::Expired),
            _ => Err(crate::ProtocolError::BadFrame("unknown leave reason")),
        }
    }
}

/// A peer entry in gossip messages and the `VERSION_INFO` v2 extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Stable node identifier
    pub node_id: String,
    /// Connection ticket, when the sender may share it
    pub ticket: Option<String>,
    /// Last hostname seen for this peer
    pub hostname: Option<String>,
    /// User-assigned nickname
    pub nickname: Option<String>,
    /// When the sender last saw this peer, epoch ms
    pub last_seen: u64,
}

/// Handshake payload sent by both sides when a session opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Sender's vault identifier
    pub vault_id: String,
    /// Sender's oplog version vector (opaque)
    pub version: Vec<u8>,
    /// Sender's own connection ticket
    pub ticket: String,
    /// Sender's hostname
    pub hostname: String,
    /// Sender's nickname, if configured
    pub nickname: Option<String>,
    /// v2 extension block, absent when talking to a v1 peer
    pub extension: Option<VersionExtension>,
}

/// `VERSION_INFO` v2 extension: interpreted only when
/// `protocol_version >= 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionExtension {
    /// Sender's protocol version
    pub protocol_version: u8,
    /// Sender's application version string
    pub plugin_version: String,
    /// Sync groups the sender belongs to
    pub group_ids: Vec<String>,
    /// Peers the sender knows (gossip seed)
    pub known_peers: Vec<PeerInfo>,
}

/// A decoded frame: wire timestamp plus the typed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender clock at serialization time, epoch ms
    pub timestamp_ms: u64,
    /// The message itself
    pub message: Message,
}

/// All sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// 0x01 — handshake
    VersionInfo(VersionInfo),
    /// 0x02 — incremental CRDT updates
    Updates {
        /// Number of operations in the batch
        op_count: u32,
        /// Opaque update bytes from the CRDT export
        updates: Vec<u8>,
    },
    /// 0x03 — request a full snapshot
    SnapshotRequest,
    /// 0x04 — full snapshot in one frame
    Snapshot {
        /// Size of the complete snapshot
        total_size: u32,
        /// Snapshot bytes
        snapshot: Vec<u8>,
    },
    /// 0x05 — one chunk of a chunked snapshot
    SnapshotChunk {
        /// Zero-based chunk index
        chunk_index: u32,
        /// Total number of chunks
        total_chunks: u32,
        /// Chunk bytes
        data: Vec<u8>,
    },
    /// 0x06 — catch-up complete
    SyncComplete {
        /// Sender's version vector after catch-up
        version: Vec<u8>,
    },
    /// 0x07 — error signal
    Error {
        /// Machine-readable code
        code: ErrorCode,
        /// Human-readable detail
        message: String,
    },
    /// 0x08 — keepalive probe
    Ping {
        /// Monotonic sequence number
        seq: u32,
    },
    /// 0x09 — keepalive response, echoing the probe's sequence
    Pong {
        /// Echoed sequence number
        seq: u32,
    },
    /// 0x10 — hashes referenced by the sender's live tree
    BlobHashes {
        /// Hex SHA-256 hashes
        hashes: Vec<String>,
    },
    /// 0x11 — hashes the sender lacks and wants content for
    BlobRequest {
        /// Hex SHA-256 hashes
        hashes: Vec<String>,
    },
    /// 0x12 — one blob's content
    BlobData {
        /// Hex SHA-256 of `data`
        hash: String,
        /// MIME type, when known
        mime_type: Option<String>,
        /// Content bytes
        data: Vec<u8>,
    },
    /// 0x13 — blob transfer complete
    BlobSyncComplete {
        /// Number of blobs sent in this phase
        blob_count: u32,
    },
    /// 0x20 — the sender removed this peer
    PeerRemoved {
        /// Optional reason for display
        reason: Option<String>,
    },
    /// 0x21 — gossip of known peers
    PeerAnnouncement {
        /// Why this announcement was sent
        reason: AnnounceReason,
        /// Known peers
        peers: Vec<PeerInfo>,
    },
    /// 0x22 — ask for known peers
    PeerRequest {
        /// Restrict the answer to these groups (empty = all)
        group_ids: Vec<String>,
    },
    /// 0x23 — a peer left the mesh
    PeerLeft {
        /// Who left
        node_id: String,
        /// Why
        reason: LeaveReason,
        /// Groups the peer belonged to
        group_ids: Vec<String>,
    },
    /// 0x40 — direct-connection upgrade: SDP offer (opaque to this layer)
    SdpOffer {
        /// SDP payload
        payload: String,
    },
    /// 0x41 — direct-connection upgrade: SDP answer
    SdpAnswer {
        /// SDP payload
        payload: String,
    },
    /// 0x42 — direct-connection upgrade: ICE candidate
    IceCandidate {
        /// Candidate payload
        payload: String,
    },
    /// 0x43 — direct path validated; switch over
    UpgradeReady,
    /// 0x44 — direct path failed; stay on the current transport
    UpgradeFailed {
        /// Failure detail
        reason: String,
    },
}

impl Message {
    /// The wire type byte for this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::VersionInfo(_) => MessageType::VersionInfo,
            Self::Updates { .. } => MessageType::Updates,
            Self::SnapshotRequest => MessageType::SnapshotRequest,
            Self::Snapshot { .. } => MessageType::Snapshot,
            Self::SnapshotChunk { .. } => MessageType::SnapshotChunk,
            Self::SyncComplete { .. } => MessageType::SyncComplete,
            Self::Error { .. } => MessageType::Error,
            Self::Ping { .. } => MessageType::Ping,
            Self::Pong { .. } => MessageType::Pong,
            Self::BlobHashes { .. } => MessageType::BlobHashes,
            Self::BlobRequest { .. } => MessageType::BlobRequest,
            Self::BlobData { .. } => MessageType::BlobData,
            Self::BlobSyncComplete { .. } => MessageType::BlobSyncComplete,
            Self::PeerRemoved { .. } => MessageType::PeerRemoved,
            Self::PeerAnnouncement { .. } => MessageType::PeerAnnouncement,
            Self::PeerRequest { .. } => MessageType::PeerRequest,
            Self::PeerLeft { .. } => MessageType::PeerLeft,
            Self::SdpOffer { .. } => MessageType::SdpOffer,
            Self::SdpAnswer { .. } => MessageType::SdpAnswer,
            Self::IceCandidate { .. } => MessageType::IceCandidate,
            Self::UpgradeReady => MessageType::UpgradeReady,
            Self::UpgradeFailed { .. } => MessageType::UpgradeFailed,
        }
    }
}
