//! The peer manager: registry, session supervision, pairing, gossip.
//!
//! Peer records persist at `peer:<nodeId>` and survive restarts. Each
//! outbound peer gets a supervisor task that dials, runs the session, and
//! reconnects with exponential backoff on recoverable failures. Inbound
//! sessions from the transport's accept loop run without a supervisor; the
//! dialing side owns reconnection.
//!
//! A peer record refers to its session only through the handle map; when a
//! session ends its handle is removed, and lookups that miss treat the
//! peer as disconnected.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use peervault_blobs::BlobStore;
use peervault_proto::PeerInfo;
use peervault_storage::Storage;

use crate::clock::{now_ms, redact};
use crate::config::SessionTuning;
use crate::document::VaultDocument;
use crate::events::{SyncStatus, VaultEvent};
use crate::keys::{peer_key, PEER_PREFIX};
use crate::sync::session::{
    run_session, LocalIdentity, SessionCommand, SessionConfig, SessionContext, SessionEvent,
    SessionEventKind, SessionPhase,
};
use crate::transport::{StreamPair, VaultTransport};
use crate::{Result, VaultError};

/// Connection state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// No session
    Disconnected,
    /// Dialing or handshaking
    Connecting,
    /// Session in catch-up
    Syncing,
    /// Session live and caught up
    Synced,
    /// Last session attempt failed permanently
    Error,
}

/// A known peer, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Stable node identifier
    pub node_id: String,
    /// Ticket to dial this peer, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    /// Last hostname the peer advertised
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Nickname the peer advertised
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// When this peer was first learned of, epoch ms
    pub first_seen: i64,
    /// When this peer was last heard from, epoch ms
    pub last_seen: i64,
    /// When catch-up with this peer last completed, epoch ms
    pub last_sync_time: i64,
    /// Connection state (not persisted as authoritative; reset on load)
    pub state: PeerState,
    /// Sync groups the peer belongs to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<String>,
}

impl PeerRecord {
    fn new(node_id: &str) -> Self {
        let stamp = now_ms();
        Self {
            node_id: node_id.to_string(),
            ticket: None,
            hostname: None,
            nickname: None,
            first_seen: stamp,
            last_seen: stamp,
            last_sync_time: 0,
            state: PeerState::Disconnected,
            group_ids: Vec::new(),
        }
    }

    /// Best human-readable name for messages and consensus reports.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.nickname
            .clone()
            .or_else(|| self.hostname.clone())
            .unwrap_or_else(|| redact(&self.node_id))
    }
}

struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    #[allow(dead_code)]
    phase: watch::Receiver<SessionPhase>,
}

/// Owns the peer registry and supervises sessions.
pub struct PeerManager {
    storage: Arc<dyn Storage>,
    document: Arc<VaultDocument>,
    blobs: Arc<BlobStore>,
    transport: Arc<dyn VaultTransport>,
    tuning: SessionTuning,
    identity: LocalIdentity,

    registry: DashMap<String, PeerRecord>,
    sessions: DashMap<String, SessionHandle>,
    supervisors: DashMap<String, JoinHandle<()>>,

    host_events: mpsc::Sender<VaultEvent>,
    session_events_tx: mpsc::Sender<SessionEvent>,
    session_events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    /// Vault-key payloads accepted during pairing, for the vault to install
    accepted_keys_tx: mpsc::Sender<Vec<u8>>,
    last_status: Mutex<SyncStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerManager {
    /// Create a manager. `host_events` receives the high-level event
    /// stream; accepted pairing keys come out of the returned receiver.
    pub fn new(
        storage: Arc<dyn Storage>,
        document: Arc<VaultDocument>,
        blobs: Arc<BlobStore>,
        transport: Arc<dyn VaultTransport>,
        tuning: SessionTuning,
        hostname: String,
        nickname: Option<String>,
        host_events: mpsc::Sender<VaultEvent>,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (session_events_tx, session_events_rx) = mpsc::channel(64);
        let (accepted_keys_tx, accepted_keys_rx) = mpsc::channel(4);
        let identity = LocalIdentity {
            node_id: transport.node_id(),
            ticket: transport.ticket(),
            hostname,
            nickname,
        };
        let manager = Arc::new(Self {
            storage,
            document,
            blobs,
            transport,
            tuning,
            identity,
            registry: DashMap::new(),
            sessions: DashMap::new(),
            supervisors: DashMap::new(),
            host_events,
            session_events_tx,
            session_events_rx: Mutex::new(Some(session_events_rx)),
            accepted_keys_tx,
            last_status: Mutex::new(SyncStatus::Offline),
            tasks: Mutex::new(Vec::new()),
        });
        (manager, accepted_keys_rx)
    }

    /// Load persisted peer records and start the accept, event, and
    /// pairing loops.
    ///
    /// # Errors
    ///
    /// Propagates storage failures while loading records.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.load_peers().await?;

        let accept = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.accept_loop().await })
        };
        let events = {
            let manager = Arc::clone(self);
            let rx = manager
                .session_events_rx
                .lock()
                .expect("events lock poisoned")
                .take()
                .expect("start called once");
            tokio::spawn(async move { manager.event_loop(rx).await })
        };
        let pairing = {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.pairing_loop().await })
        };
        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .extend([accept, events, pairing]);
        Ok(())
    }

    async fn load_peers(&self) -> Result<()> {
        let keys = self.storage.list_prefix(PEER_PREFIX).await?;
        for key in keys {
            let Some(bytes) = self.storage.read(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<PeerRecord>(&bytes) {
                Ok(mut record) => {
                    record.state = PeerState::Disconnected;
                    self.registry.insert(record.node_id.clone(), record);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping corrupt peer record");
                }
            }
        }
        debug!(count = self.registry.len(), "peer registry loaded");
        Ok(())
    }

    async fn persist_peer(&self, node_id: &str) {
        let Some(record) = self.registry.get(node_id).map(|r| r.clone()) else {
            return;
        };
        let bytes = serde_json::to_vec(&record).expect("peer record serializes");
        if let Err(e) = self.storage.write(&peer_key(node_id), &bytes).await {
            warn!(peer = %redact(node_id), error = %e, "failed to persist peer record");
        }
    }

    /// This device's node id.
    #[must_use]
    pub fn node_id(&self) -> String {
        self.identity.node_id.clone()
    }

    /// This device's dialable ticket.
    #[must_use]
    pub fn ticket(&self) -> String {
        self.identity.ticket.clone()
    }

    /// Copies of all known peer records.
    #[must_use]
    pub fn list_peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.registry.iter().map(|r| r.clone()).collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Copy of one peer record.
    #[must_use]
    pub fn get_peer(&self, node_id: &str) -> Option<PeerRecord> {
        self.registry.get(node_id).map(|r| r.clone())
    }

    /// Whether a session with this peer is currently running.
    #[must_use]
    pub fn is_connected(&self, node_id: &str) -> bool {
        self.sessions.contains_key(node_id)
    }

    /// Dial a peer by ticket and keep the session alive with backoff.
    ///
    /// # Errors
    ///
    /// Fails fast on an invalid ticket; connection failures after that are
    /// handled by the supervisor.
    pub async fn add_peer(self: &Arc<Self>, ticket: &str) -> Result<String> {
        // Fail fast so the caller learns about unusable tickets
        let (node_id, streams) = self.transport.connect(ticket).await?;

        self.registry
            .entry(node_id.clone())
            .or_insert_with(|| PeerRecord::new(&node_id))
            .ticket = Some(ticket.to_string());
        self.persist_peer(&node_id).await;

        self.spawn_supervised(&node_id, ticket.to_string(), Some(streams));
        Ok(node_id)
    }

    /// Close the session, notify the peer, and forget the record.
    ///
    /// # Errors
    ///
    /// Fails with `PeerNotFound` for unknown ids.
    pub async fn remove_peer(&self, node_id: &str) -> Result<()> {
        if self.registry.remove(node_id).is_none() {
            return Err(VaultError::PeerNotFound(redact(node_id)));
        }
        if let Some((_, handle)) = self.sessions.remove(node_id) {
            let _ = handle
                .commands
                .send(SessionCommand::Close {
                    notify_peer: true,
                    reason: Some("peer removed".to_string()),
                })
                .await;
        }
        if let Some((_, supervisor)) = self.supervisors.remove(node_id) {
            supervisor.abort();
        }
        self.storage.delete(&peer_key(node_id)).await?;
        info!(peer = %redact(node_id), "peer removed");
        Ok(())
    }

    /// Reconnect every known, disconnected peer that has a ticket.
    pub fn reconnect_all(self: &Arc<Self>) {
        for record in self.registry.iter() {
            if self.sessions.contains_key(&record.node_id) {
                continue;
            }
            let supervising = self
                .supervisors
                .get(&record.node_id)
                .is_some_and(|task| !task.is_finished());
            if supervising {
                continue;
            }
            if let Some(ticket) = record.ticket.clone() {
                self.spawn_supervised(&record.node_id, ticket, None);
            }
        }
    }

    /// Offer the vault encryption key to a paired peer over the
    /// transport's authenticated channel.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub async fn offer_vault_key(&self, node_id: &str, sealed_key: &[u8]) -> Result<()> {
        self.transport.send_secret(node_id, sealed_key).await?;
        Ok(())
    }

    /// Stop all sessions and background loops. The registry stays
    /// persisted.
    pub async fn shutdown(&self) {
        for entry in self.sessions.iter() {
            let _ = entry
                .value()
                .commands
                .send(SessionCommand::Close {
                    notify_peer: false,
                    reason: None,
                })
                .await;
        }
        for entry in self.supervisors.iter() {
            entry.value().abort();
        }
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }
    }

    // ---- internals -----------------------------------------------------

    fn gossip_list(&self) -> Vec<PeerInfo> {
        self.registry
            .iter()
            .map(|record| PeerInfo {
                node_id: record.node_id.clone(),
                ticket: record.ticket.clone(),
                hostname: record.hostname.clone(),
                nickname: record.nickname.clone(),
                last_seen: record.last_seen.max(0) as u64,
            })
            .collect()
    }

    fn session_config(&self) -> SessionConfig {
        (&self.tuning).into()
    }

    fn spawn_session(self: &Arc<Self>, node_id: &str, streams: StreamPair) -> JoinHandle<Result<()>> {
        let (command_tx, command_rx) = mpsc::channel(4);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Opening);
        self.sessions.insert(
            node_id.to_string(),
            SessionHandle {
                commands: command_tx,
                phase: phase_rx,
            },
        );
        self.set_peer_state(node_id, PeerState::Connecting);

        let ctx = SessionContext {
            remote_node_id: node_id.to_string(),
            identity: self.identity.clone(),
            document: Arc::clone(&self.document),
            blobs: Arc::clone(&self.blobs),
            config: self.session_config(),
            events: self.session_events_tx.clone(),
            gossip: self.gossip_list(),
            phase_tx,
            commands: command_rx,
        };
        tokio::spawn(run_session(ctx, streams))
    }

    /// Run a session and reconnect with exponential backoff on
    /// recoverable failures: 1 s, 2 s, 4 s, … capped at 60 s, at most
    /// `max_reconnect_attempts` retries for this process lifetime.
    fn spawn_supervised(
        self: &Arc<Self>,
        node_id: &str,
        ticket: String,
        first_streams: Option<StreamPair>,
    ) {
        let manager = Arc::clone(self);
        let node_id_owned = node_id.to_string();
        let node_id = node_id_owned.clone();
        let supervisor = tokio::spawn(async move {
            let mut streams = first_streams;
            let mut attempts: u32 = 0;

            loop {
                let pair = match streams.take() {
                    Some(pair) => Some(pair),
                    None => {
                        manager.set_peer_state(&node_id, PeerState::Connecting);
                        match manager.transport.connect(&ticket).await {
                            Ok((_, pair)) => Some(pair),
                            Err(e) => {
                                warn!(peer = %redact(&node_id), error = %e, "dial failed");
                                None
                            }
                        }
                    }
                };

                let outcome = match pair {
                    Some(pair) => manager
                        .spawn_session(&node_id, pair)
                        .await
                        .unwrap_or_else(|join_error| {
                            Err(VaultError::Document(format!(
                                "session task panicked: {join_error}"
                            )))
                        }),
                    None => Err(VaultError::Transport(
                        crate::transport::TransportError::Timeout,
                    )),
                };
                manager.sessions.remove(&node_id);

                match outcome {
                    Ok(()) => {
                        manager.set_peer_state(&node_id, PeerState::Disconnected);
                        manager
                            .emit(VaultEvent::PeerDisconnected {
                                node_id: node_id.clone(),
                                reason: None,
                            })
                            .await;
                        break;
                    }
                    Err(error) => {
                        let retry = error.recoverable()
                            && attempts < manager.tuning.max_reconnect_attempts;
                        manager.notify_peer_error(&node_id, &error).await;
                        if !retry {
                            manager.set_peer_state(&node_id, PeerState::Error);
                            break;
                        }
                        manager.set_peer_state(&node_id, PeerState::Disconnected);
                        let backoff =
                            Duration::from_secs(1u64 << attempts.min(6)).min(Duration::from_secs(60));
                        debug!(
                            peer = %redact(&node_id),
                            attempt = attempts + 1,
                            backoff_secs = backoff.as_secs(),
                            "reconnecting after error"
                        );
                        attempts += 1;
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            manager.supervisors.remove(&node_id);
        });
        self.supervisors.insert(node_id_owned, supervisor);
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            match self.transport.accept().await {
                Ok(incoming) => {
                    let node_id = incoming.remote_node_id.clone();
                    debug!(peer = %redact(&node_id), "inbound session");
                    self.registry
                        .entry(node_id.clone())
                        .or_insert_with(|| PeerRecord::new(&node_id));
                    self.persist_peer(&node_id).await;

                    let manager = Arc::clone(&self);
                    let session = self.spawn_session(&node_id, incoming.streams);
                    tokio::spawn(async move {
                        let outcome = session.await;
                        manager.sessions.remove(&node_id);
                        match outcome {
                            Ok(Ok(())) => {
                                manager.set_peer_state(&node_id, PeerState::Disconnected);
                                manager
                                    .emit(VaultEvent::PeerDisconnected {
                                        node_id: node_id.clone(),
                                        reason: None,
                                    })
                                    .await;
                            }
                            Ok(Err(error)) => {
                                manager.set_peer_state(&node_id, PeerState::Error);
                                manager.notify_peer_error(&node_id, &error).await;
                            }
                            Err(join_error) => {
                                warn!(error = %join_error, "inbound session task panicked");
                            }
                        }
                    });
                }
                Err(e) => {
                    debug!(error = %e, "accept loop ended");
                    return;
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            let node_id = event.node_id;
            match event.kind {
                SessionEventKind::HandshakeComplete(info) => {
                    if let Some(mut record) = self.registry.get_mut(&node_id) {
                        record.last_seen = now_ms();
                        record.hostname = Some(info.hostname.clone());
                        record.nickname = info.nickname.clone();
                        if record.ticket.is_none() && !info.ticket.is_empty() {
                            record.ticket = Some(info.ticket.clone());
                        }
                        if let Some(ext) = &info.extension {
                            record.group_ids = ext.group_ids.clone();
                        }
                        record.state = PeerState::Syncing;
                    }
                    self.persist_peer(&node_id).await;
                    self.emit(VaultEvent::PeerConnected {
                        node_id: node_id.clone(),
                    })
                    .await;
                    self.refresh_status().await;
                }
                SessionEventKind::Synced { .. } => {
                    if let Some(mut record) = self.registry.get_mut(&node_id) {
                        let stamp = now_ms();
                        record.last_seen = stamp;
                        record.last_sync_time = stamp;
                        record.state = PeerState::Synced;
                    }
                    self.persist_peer(&node_id).await;
                    self.emit(VaultEvent::PeerSynced {
                        node_id: node_id.clone(),
                    })
                    .await;
                    self.refresh_status().await;
                }
                SessionEventKind::Live => {
                    self.refresh_status().await;
                }
                SessionEventKind::LiveUpdates => {
                    if let Some(mut record) = self.registry.get_mut(&node_id) {
                        let stamp = now_ms();
                        record.last_seen = stamp;
                        record.last_sync_time = stamp;
                    }
                    self.emit(VaultEvent::LiveUpdates).await;
                }
                SessionEventKind::BlobReceived { hash } => {
                    self.emit(VaultEvent::BlobReceived { hash }).await;
                }
                SessionEventKind::Gossip(peers) => {
                    self.merge_gossip(&peers).await;
                }
                SessionEventKind::AdoptionRequest {
                    peer_vault_id,
                    our_vault_id,
                    respond,
                } => {
                    self.emit(VaultEvent::VaultAdoptionRequest {
                        node_id: node_id.clone(),
                        peer_vault_id,
                        our_vault_id,
                        respond,
                    })
                    .await;
                }
                SessionEventKind::RemovedByPeer { reason } => {
                    self.emit(VaultEvent::PeerDisconnected {
                        node_id: node_id.clone(),
                        reason,
                    })
                    .await;
                }
            }
        }
    }

    /// Pairing: vault-key offers arrive over the transport's authenticated
    /// side channel; acceptance is gated on a host confirmation event.
    async fn pairing_loop(self: Arc<Self>) {
        loop {
            let (from, payload) = match self.transport.recv_secret().await {
                Ok(offer) => offer,
                Err(_) => return,
            };
            let (respond, decision) = oneshot::channel();
            self.emit(VaultEvent::VaultKeyOffered {
                node_id: from.clone(),
                respond,
            })
            .await;
            match decision.await {
                Ok(true) => {
                    info!(peer = %redact(&from), "vault key accepted");
                    let _ = self.accepted_keys_tx.send(payload).await;
                }
                _ => {
                    debug!(peer = %redact(&from), "vault key declined");
                }
            }
        }
    }

    /// Merge gossiped peers. On collision the entry with the most recent
    /// `last_seen` wins.
    async fn merge_gossip(&self, peers: &[PeerInfo]) {
        for info in peers {
            if info.node_id == self.identity.node_id {
                continue;
            }
            let gossip_last_seen = info.last_seen as i64;
            let mut changed = false;
            {
                let mut record = self
                    .registry
                    .entry(info.node_id.clone())
                    .or_insert_with(|| {
                        changed = true;
                        let mut fresh = PeerRecord::new(&info.node_id);
                        fresh.last_seen = gossip_last_seen;
                        fresh.ticket = info.ticket.clone();
                        fresh.hostname = info.hostname.clone();
                        fresh.nickname = info.nickname.clone();
                        fresh
                    });
                if gossip_last_seen > record.last_seen {
                    record.last_seen = gossip_last_seen;
                    if info.ticket.is_some() {
                        record.ticket = info.ticket.clone();
                    }
                    if info.hostname.is_some() {
                        record.hostname = info.hostname.clone();
                    }
                    if info.nickname.is_some() {
                        record.nickname = info.nickname.clone();
                    }
                    changed = true;
                }
            }
            if changed {
                debug!(peer = %redact(&info.node_id), "gossip merged");
                self.persist_peer(&info.node_id).await;
            }
        }
    }

    fn set_peer_state(&self, node_id: &str, state: PeerState) {
        if let Some(mut record) = self.registry.get_mut(node_id) {
            record.state = state;
        }
    }

    /// Notification policy: warnings and below are logged only; `Error`
    /// and `Critical` reach the host.
    async fn notify_peer_error(&self, node_id: &str, error: &VaultError) {
        if error.severity() >= crate::error::Severity::Error {
            self.emit(VaultEvent::PeerError {
                node_id: node_id.to_string(),
                error: error.to_string(),
            })
            .await;
        } else {
            warn!(peer = %redact(node_id), error = %error, "session error");
        }
    }

    async fn refresh_status(&self) {
        let status = {
            let peers = self.list_peers();
            if peers.iter().any(|p| p.state == PeerState::Error) {
                SyncStatus::Degraded
            } else if peers
                .iter()
                .any(|p| matches!(p.state, PeerState::Connecting | PeerState::Syncing))
            {
                SyncStatus::Syncing
            } else if peers.iter().any(|p| p.state == PeerState::Synced) {
                SyncStatus::Synced
            } else {
                SyncStatus::Offline
            }
        };
        let stale = {
            let mut last = self.last_status.lock().expect("status lock poisoned");
            let stale = *last != status;
            *last = status;
            stale
        };
        if stale {
            self.emit(VaultEvent::StatusChange(status)).await;
        }
    }

    async fn emit(&self, event: VaultEvent) {
        let _ = self.host_events.send(event).await;
    }
}
