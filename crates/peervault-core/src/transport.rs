//! Transport abstraction.
//!
//! The physical network (hole-punched encrypted streams) lives outside the
//! core. The core sees a provider of reliable, ordered, message-framed
//! streams plus an opaque ticket scheme for addressing, and a small
//! authenticated side channel used once during pairing to hand over the
//! vault key. [`MemoryTransport`] wires vaults together in-process for
//! tests and examples.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has not been started
    #[error("transport not initialized")]
    NotInitialized,

    /// The ticket does not address a reachable node
    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    /// The stream or endpoint is closed
    #[error("transport closed")]
    Closed,

    /// The peer did not answer in time
    #[error("transport timeout")]
    Timeout,
}

impl TransportError {
    /// Whether a reconnect may succeed later.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Closed | Self::Timeout)
    }
}

/// A reliable, ordered, message-framed byte stream.
///
/// `send` delivers whole frames; `recv` yields them in order and returns
/// `None` when the peer closed.
#[async_trait]
pub trait ReliableStream: Send + Sync {
    /// Send one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame, or `None` on orderly close.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// The two streams of a session: control, plus a second stream for blob
/// payloads so large transfers cannot head-of-line-block control traffic.
pub struct StreamPair {
    /// Handshake, updates, keepalive, errors
    pub control: Box<dyn ReliableStream>,
    /// Blob hashes, requests, and data
    pub blob: Box<dyn ReliableStream>,
}

/// An inbound session delivered by [`VaultTransport::accept`].
pub struct IncomingSession {
    /// The dialing node's id
    pub remote_node_id: String,
    /// The session's streams
    pub streams: StreamPair,
}

/// Provider of sessions between named nodes.
#[async_trait]
pub trait VaultTransport: Send + Sync {
    /// This node's stable identifier.
    fn node_id(&self) -> String;

    /// A ticket other nodes can dial this node with.
    fn ticket(&self) -> String;

    /// Dial the node addressed by `ticket`. Returns the authenticated
    /// remote node id and the session streams.
    async fn connect(&self, ticket: &str) -> Result<(String, StreamPair), TransportError>;

    /// Wait for the next inbound session.
    async fn accept(&self) -> Result<IncomingSession, TransportError>;

    /// Send pairing material over the transport's authenticated channel.
    async fn send_secret(&self, node_id: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait for pairing material from a peer: `(sender_node_id, payload)`.
    async fn recv_secret(&self) -> Result<(String, Vec<u8>), TransportError>;
}

// ---- in-memory implementation ------------------------------------------

const MEMORY_TICKET_PREFIX: &str = "mem:";
const STREAM_CAPACITY: usize = 256;

struct Endpoint {
    sessions: mpsc::Sender<IncomingSession>,
    secrets: mpsc::Sender<(String, Vec<u8>)>,
}

/// Shared in-process switchboard connecting [`MemoryTransport`] endpoints.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: DashMap<String, Endpoint>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node on this hub and get its transport.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, node_id: &str) -> MemoryTransport {
        let (session_tx, session_rx) = mpsc::channel(16);
        let (secret_tx, secret_rx) = mpsc::channel(16);
        self.endpoints.insert(
            node_id.to_string(),
            Endpoint {
                sessions: session_tx,
                secrets: secret_tx,
            },
        );
        MemoryTransport {
            hub: Arc::clone(self),
            node_id: node_id.to_string(),
            sessions: Mutex::new(session_rx),
            secrets: Mutex::new(secret_rx),
        }
    }
}

/// In-process transport for tests: streams are tokio channels.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    node_id: String,
    sessions: Mutex<mpsc::Receiver<IncomingSession>>,
    secrets: Mutex<mpsc::Receiver<(String, Vec<u8>)>>,
}

struct MemoryStream {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl ReliableStream for MemoryStream {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(frame.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

fn stream_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::channel(STREAM_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(STREAM_CAPACITY);
    (
        MemoryStream { tx: a_tx, rx: a_rx },
        MemoryStream { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl VaultTransport for MemoryTransport {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    fn ticket(&self) -> String {
        format!("{MEMORY_TICKET_PREFIX}{}", self.node_id)
    }

    async fn connect(&self, ticket: &str) -> Result<(String, StreamPair), TransportError> {
        let target = ticket
            .strip_prefix(MEMORY_TICKET_PREFIX)
            .ok_or_else(|| TransportError::InvalidTicket(ticket.to_string()))?;

        let (local_control, remote_control) = stream_pair();
        let (local_blob, remote_blob) = stream_pair();

        let endpoint = self
            .hub
            .endpoints
            .get(target)
            .ok_or_else(|| TransportError::InvalidTicket(ticket.to_string()))?;
        endpoint
            .sessions
            .send(IncomingSession {
                remote_node_id: self.node_id.clone(),
                streams: StreamPair {
                    control: Box::new(remote_control),
                    blob: Box::new(remote_blob),
                },
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        Ok((
            target.to_string(),
            StreamPair {
                control: Box::new(local_control),
                blob: Box::new(local_blob),
            },
        ))
    }

    async fn accept(&self) -> Result<IncomingSession, TransportError> {
        self.sessions
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn send_secret(&self, node_id: &str, payload: &[u8]) -> Result<(), TransportError> {
        let endpoint = self
            .hub
            .endpoints
            .get(node_id)
            .ok_or_else(|| TransportError::InvalidTicket(node_id.to_string()))?;
        endpoint
            .secrets
            .send((self.node_id.clone(), payload.to_vec()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_secret(&self) -> Result<(String, Vec<u8>), TransportError> {
        self.secrets
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange_frames() {
        let hub = MemoryHub::new();
        let alpha = hub.endpoint("alpha");
        let beta = hub.endpoint("beta");

        let dial = tokio::spawn(async move {
            let (peer, mut streams) = alpha.connect("mem:beta").await.unwrap();
            assert_eq!(peer, "beta");
            streams.control.send(b"hello").await.unwrap();
            streams.control.recv().await.unwrap().unwrap()
        });

        let mut incoming = beta.accept().await.unwrap();
        assert_eq!(incoming.remote_node_id, "alpha");
        let frame = incoming.streams.control.recv().await.unwrap().unwrap();
        assert_eq!(frame, b"hello");
        incoming.streams.control.send(b"hi back").await.unwrap();

        assert_eq!(dial.await.unwrap(), b"hi back");
    }

    #[tokio::test]
    async fn test_blob_stream_is_independent() {
        let hub = MemoryHub::new();
        let alpha = hub.endpoint("alpha");
        let beta = hub.endpoint("beta");

        let (_, mut local) = alpha.connect(&beta.ticket()).await.unwrap();
        let mut incoming = beta.accept().await.unwrap();

        local.blob.send(b"blob bytes").await.unwrap();
        local.control.send(b"control bytes").await.unwrap();

        // Each stream sees only its own traffic
        assert_eq!(
            incoming.streams.blob.recv().await.unwrap().unwrap(),
            b"blob bytes"
        );
        assert_eq!(
            incoming.streams.control.recv().await.unwrap().unwrap(),
            b"control bytes"
        );
    }

    #[tokio::test]
    async fn test_invalid_ticket() {
        let hub = MemoryHub::new();
        let alpha = hub.endpoint("alpha");
        assert!(matches!(
            alpha.connect("mem:nobody").await,
            Err(TransportError::InvalidTicket(_))
        ));
        assert!(matches!(
            alpha.connect("garbage").await,
            Err(TransportError::InvalidTicket(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_none() {
        let hub = MemoryHub::new();
        let alpha = hub.endpoint("alpha");
        let beta = hub.endpoint("beta");

        let (_, local) = alpha.connect(&beta.ticket()).await.unwrap();
        let mut incoming = beta.accept().await.unwrap();
        drop(local);

        assert_eq!(incoming.streams.control.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_secret_side_channel() {
        let hub = MemoryHub::new();
        let alpha = hub.endpoint("alpha");
        let beta = hub.endpoint("beta");

        alpha.send_secret("beta", b"sealed key").await.unwrap();
        let (from, payload) = beta.recv_secret().await.unwrap();
        assert_eq!(from, "alpha");
        assert_eq!(payload, b"sealed key");
    }
}
