//! The per-peer sync session state machine.
//!
//! One session is one tokio task owning a control stream and a blob
//! stream. It walks `Opening → Handshaking → Catchup → BlobCatchup → Live`
//! and stays in Live until the peer goes away, a fatal error occurs, or
//! the peer manager closes it.
//!
//! The catch-up phases are symmetric: both sides serve the other (updates
//! or a chunked snapshot, then blob content) while pulling what they lack
//! themselves. Each side independently requests its own missing blob set,
//! so two peers holding distinct halves of the data cannot deadlock
//! waiting for an offer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use peervault_blobs::{BlobStore, BlobError};
use peervault_proto::{
    deserialize, serialize, Envelope, ErrorCode, Message, PeerInfo, VersionExtension, VersionInfo,
    PROTOCOL_VERSION,
};

use crate::clock::{now_ms, redact};
use crate::config::SessionTuning;
use crate::document::VaultDocument;
use crate::transport::StreamPair;
use crate::{Result, VaultError};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Streams opening
    Opening,
    /// VERSION_INFO exchange
    Handshaking,
    /// Document catch-up (updates or snapshot)
    Catchup,
    /// Blob gap reconciliation
    BlobCatchup,
    /// Steady-state update exchange
    Live,
    /// Tearing down
    Closing,
}

/// Session timing and thresholds, duration-typed.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Snapshot chunk size in bytes
    pub chunk_size: usize,
    /// Handshake deadline
    pub handshake_timeout: Duration,
    /// Idle deadline between catch-up frames
    pub snapshot_idle_timeout: Duration,
    /// Keepalive cadence
    pub ping_interval: Duration,
    /// PONG deadline after a PING
    pub pong_timeout: Duration,
    /// Per-batch blob deadline
    pub blob_batch_timeout: Duration,
    /// Recoverable errors tolerated within the window
    pub max_sync_errors: usize,
    /// Error window
    pub error_window: Duration,
    /// Oplog size below which catch-up prefers a snapshot
    pub small_history_threshold: usize,
}

impl From<&SessionTuning> for SessionConfig {
    fn from(t: &SessionTuning) -> Self {
        Self {
            chunk_size: t.chunk_size,
            handshake_timeout: Duration::from_secs(t.handshake_timeout_secs),
            snapshot_idle_timeout: Duration::from_secs(t.snapshot_idle_timeout_secs),
            ping_interval: Duration::from_secs(t.ping_interval_secs),
            pong_timeout: Duration::from_secs(t.pong_timeout_secs),
            blob_batch_timeout: Duration::from_secs(t.blob_batch_timeout_secs),
            max_sync_errors: t.max_sync_errors,
            error_window: Duration::from_secs(t.error_window_secs),
            small_history_threshold: t.small_history_threshold_bytes,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        (&SessionTuning::default()).into()
    }
}

/// Identity advertised in handshakes.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// This node's id
    pub node_id: String,
    /// This node's dialable ticket
    pub ticket: String,
    /// Hostname shown to peers
    pub hostname: String,
    /// Optional nickname shown to peers
    pub nickname: Option<String>,
}

/// Commands from the peer manager to a running session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Tear the session down, optionally telling the peer why
    Close {
        /// Send `PEER_REMOVED` before closing
        notify_peer: bool,
        /// Reason carried in the notification
        reason: Option<String>,
    },
}

/// Events a session reports to the peer manager.
#[derive(Debug)]
pub struct SessionEvent {
    /// Peer this session talks to
    pub node_id: String,
    /// What happened
    pub kind: SessionEventKind,
}

/// Session event payloads.
#[derive(Debug)]
pub enum SessionEventKind {
    /// Handshake finished; carries the peer's advertised info
    HandshakeComplete(Box<VersionInfo>),
    /// Catch-up finished; carries the peer's final version vector
    Synced {
        /// Peer's version vector after catch-up
        version: Vec<u8>,
    },
    /// Session entered Live
    Live,
    /// Updates were imported while live
    LiveUpdates,
    /// A blob arrived and was stored
    BlobReceived {
        /// Hash of the stored content
        hash: String,
    },
    /// Gossip received from the peer
    Gossip(Vec<PeerInfo>),
    /// The peer's vault id differs; the host must decide
    AdoptionRequest {
        /// The peer's vault id
        peer_vault_id: String,
        /// Our vault id
        our_vault_id: String,
        /// Decision channel
        respond: oneshot::Sender<bool>,
    },
    /// The peer told us it removed this device
    RemovedByPeer {
        /// Reason, when one was given
        reason: Option<String>,
    },
}

/// Everything a session task needs.
pub(crate) struct SessionContext {
    pub remote_node_id: String,
    pub identity: LocalIdentity,
    pub document: Arc<VaultDocument>,
    pub blobs: Arc<BlobStore>,
    pub config: SessionConfig,
    pub events: mpsc::Sender<SessionEvent>,
    pub gossip: Vec<PeerInfo>,
    pub phase_tx: watch::Sender<SessionPhase>,
    pub commands: mpsc::Receiver<SessionCommand>,
}

/// Drive one session to completion. `Ok(())` is an orderly close; errors
/// are classified by the caller via [`VaultError::recoverable`].
pub(crate) async fn run_session(ctx: SessionContext, streams: StreamPair) -> Result<()> {
    let mut session = Session::new(ctx, streams);
    let result = session.run().await;
    session.set_phase(SessionPhase::Closing);
    if let Err(e) = &result {
        debug!(
            peer = %redact(&session.remote_node_id),
            error = %e,
            "session ended with error"
        );
    }
    result
}

/// What this side still expects during document catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expecting {
    Nothing,
    Updates,
    Snapshot,
}

/// Input multiplexed by the live loop.
enum LiveInput {
    Control(Option<Vec<u8>>),
    Blob(Option<Vec<u8>>),
    LocalUpdate(std::result::Result<Vec<u8>, broadcast::error::RecvError>),
    Command(Option<SessionCommand>),
    PingTick,
    PongDeadline,
}

struct Session {
    remote_node_id: String,
    identity: LocalIdentity,
    document: Arc<VaultDocument>,
    blobs: Arc<BlobStore>,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    gossip: Vec<PeerInfo>,
    phase_tx: watch::Sender<SessionPhase>,
    commands: mpsc::Receiver<SessionCommand>,

    control: Box<dyn crate::transport::ReliableStream>,
    blob_stream: Box<dyn crate::transport::ReliableStream>,
    local_updates: broadcast::Receiver<Vec<u8>>,

    /// Version vector the peer is known to hold; `UPDATES` we send advance
    /// it, and coalescing after backlog exports from it.
    peer_version: Option<Vec<u8>>,
    adopted: bool,
    /// Vault ids differ and this side declined to adopt; waiting for the
    /// peer to adopt ours (signaled by its SNAPSHOT_REQUEST).
    mismatch_held: bool,
    ping_seq: u32,
    outstanding_ping: Option<(u32, Instant)>,
    last_rtt: Option<Duration>,
    recent_errors: VecDeque<Instant>,
}

impl Session {
    fn new(ctx: SessionContext, streams: StreamPair) -> Self {
        let local_updates = ctx.document.subscribe_local_updates();
        Self {
            remote_node_id: ctx.remote_node_id,
            identity: ctx.identity,
            document: ctx.document,
            blobs: ctx.blobs,
            config: ctx.config,
            events: ctx.events,
            gossip: ctx.gossip,
            phase_tx: ctx.phase_tx,
            commands: ctx.commands,
            control: streams.control,
            blob_stream: streams.blob,
            local_updates,
            peer_version: None,
            adopted: false,
            mismatch_held: false,
            ping_seq: 0,
            outstanding_ping: None,
            last_rtt: None,
            recent_errors: VecDeque::new(),
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        let _ = self.phase_tx.send(phase);
    }

    async fn emit(&self, kind: SessionEventKind) {
        let _ = self
            .events
            .send(SessionEvent {
                node_id: self.remote_node_id.clone(),
                kind,
            })
            .await;
    }

    async fn send_control(&mut self, message: &Message) -> Result<()> {
        let frame = serialize(message, now_ms() as u64);
        self.control.send(&frame).await?;
        Ok(())
    }

    async fn send_blob_frame(&mut self, message: &Message) -> Result<()> {
        let frame = serialize(message, now_ms() as u64);
        self.blob_stream.send(&frame).await?;
        Ok(())
    }

    async fn recv_control(&mut self, deadline: Duration, phase: &'static str) -> Result<Envelope> {
        let frame = tokio::time::timeout(deadline, self.control.recv())
            .await
            .map_err(|_| VaultError::Timeout(phase))??
            .ok_or(VaultError::Transport(
                crate::transport::TransportError::Closed,
            ))?;
        Ok(deserialize(&frame)?)
    }

    fn note_error(&mut self) -> Result<()> {
        let now = Instant::now();
        self.recent_errors.push_back(now);
        while let Some(&front) = self.recent_errors.front() {
            if now.duration_since(front) > self.config.error_window {
                self.recent_errors.pop_front();
            } else {
                break;
            }
        }
        if self.recent_errors.len() > self.config.max_sync_errors {
            return Err(VaultError::ErrorLimit(self.config.max_sync_errors));
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.set_phase(SessionPhase::Opening);
        let remote = self.handshake().await?;
        let catchup = self.catchup(&remote).await?;
        self.emit(SessionEventKind::Synced { version: catchup }).await;
        self.live().await
    }

    // ---- handshake -----------------------------------------------------

    async fn handshake(&mut self) -> Result<VersionInfo> {
        self.set_phase(SessionPhase::Handshaking);

        let info = VersionInfo {
            vault_id: self.document.vault_id(),
            version: self.document.oplog_version(),
            ticket: self.identity.ticket.clone(),
            hostname: self.identity.hostname.clone(),
            nickname: self.identity.nickname.clone(),
            extension: Some(VersionExtension {
                protocol_version: PROTOCOL_VERSION,
                plugin_version: env!("CARGO_PKG_VERSION").to_string(),
                group_ids: Vec::new(),
                known_peers: self.gossip.clone(),
            }),
        };
        self.send_control(&Message::VersionInfo(info)).await?;

        let envelope = self
            .recv_control(self.config.handshake_timeout, "handshake")
            .await?;
        let remote = match envelope.message {
            Message::VersionInfo(remote) => remote,
            Message::Error { code, message } => {
                return Err(VaultError::PeerError { code, message })
            }
            other => {
                return Err(VaultError::BadUpdate(format!(
                    "expected VERSION_INFO, got {:?}",
                    other.message_type()
                )))
            }
        };

        if let Some(ext) = &remote.extension {
            if !ext.known_peers.is_empty() {
                self.emit(SessionEventKind::Gossip(ext.known_peers.clone()))
                    .await;
            }
        }

        let ours = self.document.vault_id();
        if remote.vault_id != ours {
            let (respond, decision) = oneshot::channel();
            self.emit(SessionEventKind::AdoptionRequest {
                peer_vault_id: remote.vault_id.clone(),
                our_vault_id: ours.clone(),
                respond,
            })
            .await;

            let adopt = tokio::time::timeout(self.config.handshake_timeout, decision)
                .await
                .map_err(|_| VaultError::Timeout("vault adoption decision"))?
                .unwrap_or(false);
            if adopt {
                self.document.set_vault_id(&remote.vault_id)?;
                self.adopted = true;
                debug!(
                    peer = %redact(&self.remote_node_id),
                    vault = %redact(&remote.vault_id),
                    "adopted remote vault id"
                );
            } else if self.document.is_empty() {
                // An empty vault that refuses to adopt has nothing to
                // offer a mismatched peer.
                self.send_control(&Message::Error {
                    code: ErrorCode::VaultMismatch,
                    message: format!("vault {} does not match", redact(&remote.vault_id)),
                })
                .await?;
                return Err(VaultError::VaultMismatch {
                    ours,
                    theirs: remote.vault_id.clone(),
                });
            } else {
                // Hold: the peer may be adopting our vault right now. Its
                // SNAPSHOT_REQUEST resolves the mismatch; foreign UPDATES
                // instead end the session.
                self.mismatch_held = true;
                debug!(
                    peer = %redact(&self.remote_node_id),
                    "vault mismatch held pending peer adoption"
                );
            }
        }

        self.emit(SessionEventKind::HandshakeComplete(Box::new(remote.clone())))
            .await;
        Ok(remote)
    }

    // ---- catch-up ------------------------------------------------------

    /// Snapshot-vs-incremental choice: a snapshot is requested only when
    /// the remote is ahead and this side either just adopted the vault or
    /// has little history of its own to merge.
    fn wants_snapshot(&self, remote_version: &[u8]) -> bool {
        if !self.document.remote_is_ahead(remote_version) {
            return false;
        }
        if self.adopted {
            return true;
        }
        self.document
            .export_snapshot()
            .map(|s| s.len() < self.config.small_history_threshold)
            .unwrap_or(false)
    }

    /// Receive the next frame from either stream, with a deadline.
    async fn recv_either(&mut self, deadline: Duration) -> Result<Option<Envelope>> {
        let received = tokio::time::timeout(deadline, async {
            tokio::select! {
                frame = self.control.recv() => frame,
                frame = self.blob_stream.recv() => frame,
            }
        })
        .await;
        match received {
            Err(_) => Ok(None),
            Ok(frame) => {
                let frame = frame?.ok_or(VaultError::Transport(
                    crate::transport::TransportError::Closed,
                ))?;
                Ok(Some(deserialize(&frame)?))
            }
        }
    }

    /// Run document and blob catch-up. Returns the peer's final version
    /// vector from its `SYNC_COMPLETE`.
    async fn catchup(&mut self, remote: &VersionInfo) -> Result<Vec<u8>> {
        self.set_phase(SessionPhase::Catchup);

        // Serve the peer whatever it lacks, first. Nothing flows while the
        // vault ids differ: a held side waits for the peer's snapshot
        // request, and a side that just adopted keeps its pre-adoption ops
        // to itself until the next regular exchange.
        if !self.mismatch_held && !self.adopted {
            let updates = self.document.export_updates(Some(&remote.version))?;
            if !updates.is_empty() {
                self.send_control(&Message::Updates {
                    op_count: 1,
                    updates,
                })
                .await?;
            }
        }
        self.peer_version = Some(self.document.oplog_version());

        let mut expecting = if self.mismatch_held {
            Expecting::Nothing
        } else if self.wants_snapshot(&remote.version) {
            self.send_control(&Message::SnapshotRequest).await?;
            Expecting::Snapshot
        } else if self.document.remote_is_ahead(&remote.version) {
            Expecting::Updates
        } else {
            Expecting::Nothing
        };

        let mut chunks: Option<ChunkAssembler> = None;
        let mut sent_hashes = false;
        let mut pull_done = false; // peer answered our BLOB_REQUEST
        let mut serve_done = false; // we answered the peer's BLOB_REQUEST
        let mut sent_complete = false;
        let mut their_version: Option<Vec<u8>> = None;

        if expecting == Expecting::Nothing {
            self.enter_blob_catchup().await?;
            sent_hashes = true;
        }

        loop {
            if sent_hashes && pull_done && serve_done && !sent_complete {
                self.send_control(&Message::SyncComplete {
                    version: self.document.oplog_version(),
                })
                .await?;
                sent_complete = true;
            }
            if sent_complete {
                if let Some(version) = their_version.take() {
                    return Ok(version);
                }
            }

            let deadline = if sent_hashes {
                self.config.blob_batch_timeout
            } else {
                self.config.snapshot_idle_timeout
            };
            let Some(envelope) = self.recv_either(deadline).await? else {
                // Deadline passed with nothing received
                if let Some(assembler) = &chunks {
                    let (received, total) = (assembler.received_count, assembler.total);
                    self.send_control(&Message::Error {
                        code: ErrorCode::SnapshotGap,
                        message: format!("{received}/{total} chunks received"),
                    })
                    .await?;
                    return Err(VaultError::SnapshotGap { received, total });
                }
                return Err(VaultError::Timeout("catch-up"));
            };

            match envelope.message {
                Message::Updates { updates, .. } => {
                    if self.mismatch_held {
                        // The peer is pushing a foreign vault's history
                        self.send_control(&Message::Error {
                            code: ErrorCode::VaultMismatch,
                            message: "updates from a different vault".to_string(),
                        })
                        .await?;
                        return Err(VaultError::VaultMismatch {
                            ours: self.document.vault_id(),
                            theirs: remote.vault_id.clone(),
                        });
                    }
                    self.document.import_updates(&updates).map_err(|e| {
                        warn!(peer = %redact(&self.remote_node_id), error = %e, "catch-up import failed");
                        e
                    })?;
                    if expecting == Expecting::Updates {
                        expecting = Expecting::Nothing;
                    }
                    if expecting == Expecting::Nothing && !sent_hashes {
                        self.enter_blob_catchup().await?;
                        sent_hashes = true;
                    }
                }
                Message::SnapshotRequest => {
                    // A mismatched peer asking for our snapshot has chosen
                    // to adopt this vault.
                    self.mismatch_held = false;
                    self.serve_snapshot().await?;
                }
                Message::Snapshot { snapshot, .. } => {
                    self.document.import_updates(&snapshot)?;
                    if expecting == Expecting::Snapshot {
                        expecting = Expecting::Nothing;
                    }
                    if expecting == Expecting::Nothing && !sent_hashes {
                        self.enter_blob_catchup().await?;
                        sent_hashes = true;
                    }
                }
                Message::SnapshotChunk {
                    chunk_index,
                    total_chunks,
                    data,
                } => {
                    let assembler =
                        chunks.get_or_insert_with(|| ChunkAssembler::new(total_chunks));
                    if let Some(snapshot) = assembler.add(chunk_index, total_chunks, &data)? {
                        chunks = None;
                        self.document.import_updates(&snapshot)?;
                        if expecting == Expecting::Snapshot {
                            expecting = Expecting::Nothing;
                        }
                        if !sent_hashes {
                            self.enter_blob_catchup().await?;
                            sent_hashes = true;
                        }
                    }
                }
                Message::BlobHashes { hashes } => {
                    let missing = self.blobs.get_missing(&hashes).await?;
                    self.send_blob_frame(&Message::BlobRequest { hashes: missing })
                        .await?;
                }
                Message::BlobRequest { hashes } => {
                    self.serve_blobs(&hashes).await?;
                    serve_done = true;
                }
                Message::BlobData {
                    hash,
                    mime_type,
                    data,
                } => {
                    self.store_blob(&hash, mime_type.as_deref(), &data).await?;
                }
                Message::BlobSyncComplete { blob_count } => {
                    trace!(blob_count, "peer finished serving blobs");
                    pull_done = true;
                }
                Message::SyncComplete { version } => {
                    their_version = Some(version);
                }
                Message::Ping { seq } => {
                    self.send_control(&Message::Pong { seq }).await?;
                }
                Message::Pong { .. } => {}
                Message::Error { code, message } => {
                    if code == ErrorCode::BlobMissing {
                        // Peer cannot serve one of our requested hashes;
                        // it is dropped from the batch on their side.
                        warn!(peer = %redact(&self.remote_node_id), hash = %redact(&message), "peer lacks requested blob");
                        self.note_error()?;
                    } else {
                        return Err(VaultError::PeerError { code, message });
                    }
                }
                Message::PeerRemoved { reason } => {
                    self.emit(SessionEventKind::RemovedByPeer { reason }).await;
                    return Err(VaultError::Transport(
                        crate::transport::TransportError::Closed,
                    ));
                }
                other => {
                    trace!(kind = ?other.message_type(), "ignoring frame during catch-up");
                }
            }
        }
    }

    /// Send our referenced hashes, moving into the blob phase.
    async fn enter_blob_catchup(&mut self) -> Result<()> {
        self.set_phase(SessionPhase::BlobCatchup);
        let mut hashes: Vec<String> =
            self.document.referenced_blob_hashes().into_iter().collect();
        hashes.sort();
        self.send_control(&Message::BlobHashes { hashes }).await?;
        Ok(())
    }

    async fn serve_snapshot(&mut self) -> Result<()> {
        let snapshot = self.document.export_snapshot()?;
        let total_size = snapshot.len() as u32;

        if snapshot.len() <= self.config.chunk_size {
            self.send_control(&Message::Snapshot {
                total_size,
                snapshot,
            })
            .await?;
            return Ok(());
        }

        let chunks: Vec<&[u8]> = snapshot.chunks(self.config.chunk_size).collect();
        let total_chunks = chunks.len() as u32;
        for (index, chunk) in chunks.iter().enumerate() {
            let message = Message::SnapshotChunk {
                chunk_index: index as u32,
                total_chunks,
                data: chunk.to_vec(),
            };
            self.send_control(&message).await?;
        }
        debug!(total_chunks, total_size, "snapshot served in chunks");
        Ok(())
    }

    async fn serve_blobs(&mut self, hashes: &[String]) -> Result<()> {
        let mut sent = 0u32;
        for hash in hashes {
            match self.blobs.get(hash).await {
                Ok(data) => {
                    let mime_type = self
                        .blobs
                        .get_meta(hash)
                        .await
                        .ok()
                        .and_then(|meta| meta.mime_type);
                    self.send_blob_frame(&Message::BlobData {
                        hash: hash.clone(),
                        mime_type,
                        data,
                    })
                    .await?;
                    sent += 1;
                }
                Err(BlobError::NotFound(_)) => {
                    // Requested hash unknown here: report and drop from
                    // the batch
                    self.send_control(&Message::Error {
                        code: ErrorCode::BlobMissing,
                        message: hash.clone(),
                    })
                    .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.send_blob_frame(&Message::BlobSyncComplete { blob_count: sent })
            .await?;
        Ok(())
    }

    async fn store_blob(
        &mut self,
        hash: &str,
        mime_type: Option<&str>,
        data: &[u8],
    ) -> Result<()> {
        let actual = BlobStore::hash_content(data);
        if actual != hash {
            warn!(
                expected = %redact(hash),
                actual = %redact(&actual),
                "blob content does not match its hash; dropped"
            );
            return self.note_error();
        }
        self.blobs.add(data, mime_type).await?;
        self.emit(SessionEventKind::BlobReceived {
            hash: hash.to_string(),
        })
        .await;
        Ok(())
    }

    /// Request any blobs the current tree references but the store lacks.
    async fn pull_missing_blobs(&mut self) -> Result<()> {
        let referenced: Vec<String> =
            self.document.referenced_blob_hashes().into_iter().collect();
        let missing = self.blobs.get_missing(&referenced).await?;
        if !missing.is_empty() {
            debug!(count = missing.len(), "requesting missing blobs");
            self.send_blob_frame(&Message::BlobRequest { hashes: missing })
                .await?;
        }
        Ok(())
    }

    // ---- live ----------------------------------------------------------

    async fn live(&mut self) -> Result<()> {
        self.set_phase(SessionPhase::Live);
        self.emit(SessionEventKind::Live).await;

        let mut ping_timer = tokio::time::interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.reset();

        loop {
            let pong_deadline = self
                .outstanding_ping
                .map(|(_, sent_at)| sent_at + self.config.pong_timeout);

            let input = {
                let pong_wait = async {
                    match pong_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    frame = self.control.recv() => LiveInput::Control(frame?),
                    frame = self.blob_stream.recv() => LiveInput::Blob(frame?),
                    update = self.local_updates.recv() => LiveInput::LocalUpdate(update),
                    command = self.commands.recv() => LiveInput::Command(command),
                    _ = ping_timer.tick() => LiveInput::PingTick,
                    _ = pong_wait => LiveInput::PongDeadline,
                }
            };

            match input {
                LiveInput::Control(None) | LiveInput::Blob(None) => {
                    return Err(VaultError::Transport(
                        crate::transport::TransportError::Closed,
                    ));
                }
                LiveInput::Control(Some(frame)) | LiveInput::Blob(Some(frame)) => {
                    match deserialize(&frame) {
                        Ok(envelope) => {
                            if let Some(exit) = self.handle_live_message(envelope.message).await? {
                                return exit;
                            }
                        }
                        Err(e) => {
                            warn!(peer = %redact(&self.remote_node_id), error = %e, "bad frame");
                            self.note_error()?;
                        }
                    }
                }
                LiveInput::LocalUpdate(Ok(updates)) => {
                    self.send_control(&Message::Updates {
                        op_count: 1,
                        updates,
                    })
                    .await?;
                    self.peer_version = Some(self.document.oplog_version());
                }
                LiveInput::LocalUpdate(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    // The bounded pipe overflowed; coalesce the backlog
                    // into one fresh incremental export.
                    debug!(missed, "local update backlog; coalescing");
                    let since = self.peer_version.clone();
                    let updates = self.document.export_updates(since.as_deref())?;
                    if !updates.is_empty() {
                        self.send_control(&Message::Updates {
                            op_count: missed as u32,
                            updates,
                        })
                        .await?;
                    }
                    self.peer_version = Some(self.document.oplog_version());
                }
                LiveInput::LocalUpdate(Err(broadcast::error::RecvError::Closed)) => {
                    // Document going away; the vault is shutting down
                    return Ok(());
                }
                LiveInput::Command(Some(SessionCommand::Close {
                    notify_peer,
                    reason,
                })) => {
                    if notify_peer {
                        let _ = self
                            .send_control(&Message::PeerRemoved { reason })
                            .await;
                    }
                    return Ok(());
                }
                LiveInput::Command(None) => return Ok(()),
                LiveInput::PingTick => {
                    self.ping_seq = self.ping_seq.wrapping_add(1);
                    let seq = self.ping_seq;
                    self.send_control(&Message::Ping { seq }).await?;
                    self.outstanding_ping = Some((seq, Instant::now()));
                }
                LiveInput::PongDeadline => {
                    warn!(peer = %redact(&self.remote_node_id), "keepalive timed out");
                    return Err(VaultError::Timeout("pong"));
                }
            }
        }
    }

    /// Handle one live-phase message. `Some(result)` ends the session.
    async fn handle_live_message(
        &mut self,
        message: Message,
    ) -> Result<Option<Result<()>>> {
        match message {
            Message::Updates { updates, .. } => {
                match self.document.import_updates(&updates) {
                    Ok(_) => {
                        self.emit(SessionEventKind::LiveUpdates).await;
                        self.pull_missing_blobs().await?;
                    }
                    Err(e) => {
                        warn!(peer = %redact(&self.remote_node_id), error = %e, "live import failed");
                        self.note_error()?;
                    }
                }
            }
            Message::Ping { seq } => {
                self.send_control(&Message::Pong { seq }).await?;
            }
            Message::Pong { seq } => {
                if let Some((expected, sent_at)) = self.outstanding_ping {
                    if seq == expected {
                        self.last_rtt = Some(sent_at.elapsed());
                        self.outstanding_ping = None;
                        trace!(rtt_ms = self.last_rtt.map(|d| d.as_millis() as u64), "pong");
                    }
                }
            }
            Message::BlobHashes { hashes } => {
                let missing = self.blobs.get_missing(&hashes).await?;
                if !missing.is_empty() {
                    self.send_blob_frame(&Message::BlobRequest { hashes: missing })
                        .await?;
                }
            }
            Message::BlobRequest { hashes } => {
                self.serve_blobs(&hashes).await?;
            }
            Message::BlobData {
                hash,
                mime_type,
                data,
            } => {
                self.store_blob(&hash, mime_type.as_deref(), &data).await?;
            }
            Message::BlobSyncComplete { .. } => {}
            Message::SnapshotRequest => {
                self.serve_snapshot().await?;
            }
            Message::SyncComplete { .. } => {}
            Message::Error { code, message } => {
                let err = VaultError::PeerError { code, message };
                if err.recoverable() {
                    warn!(peer = %redact(&self.remote_node_id), error = %err, "peer reported error");
                    self.note_error()?;
                } else {
                    return Ok(Some(Err(err)));
                }
            }
            Message::PeerRemoved { reason } => {
                self.emit(SessionEventKind::RemovedByPeer { reason }).await;
                return Ok(Some(Ok(())));
            }
            Message::PeerAnnouncement { peers, .. } => {
                self.emit(SessionEventKind::Gossip(peers)).await;
            }
            other => {
                trace!(kind = ?other.message_type(), "ignoring frame in live phase");
            }
        }
        Ok(None)
    }
}

/// Reassembles a chunked snapshot. Duplicate indices are ignored; an index
/// outside the announced total or a changed total is a protocol error.
struct ChunkAssembler {
    total: u32,
    received_count: u32,
    parts: Vec<Option<Vec<u8>>>,
}

impl ChunkAssembler {
    fn new(total: u32) -> Self {
        Self {
            total,
            received_count: 0,
            parts: vec![None; total as usize],
        }
    }

    fn add(&mut self, index: u32, total: u32, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if total != self.total {
            return Err(VaultError::BadUpdate(format!(
                "chunk total changed mid-transfer: {} then {total}",
                self.total
            )));
        }
        if index >= self.total {
            return Err(VaultError::BadUpdate(format!(
                "chunk index {index} out of range 0..{}",
                self.total
            )));
        }
        let slot = &mut self.parts[index as usize];
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(data.to_vec());
        self.received_count += 1;

        if self.received_count == self.total {
            let mut assembled = Vec::new();
            for part in self.parts.drain(..) {
                assembled.extend_from_slice(&part.expect("all chunks present"));
            }
            Ok(Some(assembled))
        } else {
            Ok(None)
        }
    }
}
