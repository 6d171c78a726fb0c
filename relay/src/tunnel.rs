//! Tunnel connection management for the Burrow relay
//!
//! The relay holds at most one agent connection. [`TunnelManager`] owns the
//! slot and applies the handshake policy; [`TunnelConnection`] wraps the live
//! socket behind a single writer task and tears itself down exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::extract::ws::Message;
use burrow_shared::protocol::{ConversationId, OutgoingMessage};
use burrow_shared::{Error, ErrorKind, Result};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::HandshakePolicy;
use crate::correlator::{Correlator, Waiter};

/// Frames queued for the writer before senders start waiting
const OUTBOUND_QUEUE: usize = 256;

/// Unique tunnel connection identifier
pub type ConnectionId = u64;

/// A frame waiting for the writer task
pub struct Outbound {
    pub frame: Message,
    /// Resolved once the frame hits the socket (data frames only)
    pub ack: Option<oneshot::Sender<Result<()>>>,
}

/// The one live agent connection
pub struct TunnelConnection {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    correlator: Arc<Correlator>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    connected_at: DateTime<Utc>,
}

impl TunnelConnection {
    /// Create a connection; the returned receiver feeds [`write_loop`].
    pub fn new(id: ConnectionId) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (shutdown, _) = watch::channel(false);
        let conn = Arc::new(Self {
            id,
            outbound,
            correlator: Correlator::new(),
            closed: AtomicBool::new(false),
            shutdown,
            connected_at: Utc::now(),
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Park a waiter for `id` on this connection.
    pub fn register(&self, id: ConversationId) -> Result<Waiter> {
        self.correlator.register(id)
    }

    pub fn pending(&self) -> usize {
        self.correlator.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receiver that flips to `true` on teardown.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Write one request to the agent, returning once it is on the wire.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<()> {
        let text = message.encode()?;
        let (ack, acked) = oneshot::channel();
        self.enqueue(Outbound {
            frame: Message::Text(text),
            ack: Some(ack),
        })
        .await?;

        acked
            .await
            .unwrap_or_else(|_| Err(Error::Transport("tunnel writer stopped".into())))
    }

    /// Queue a control frame (pong, close) without waiting for the write.
    pub async fn send_control(&self, frame: Message) -> Result<()> {
        self.enqueue(Outbound { frame, ack: None }).await
    }

    async fn enqueue(&self, out: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("tunnel connection closed".into()));
        }
        self.outbound
            .send(out)
            .await
            .map_err(|_| Error::Transport("tunnel writer stopped".into()))
    }

    /// Close the connection and fail everything still pending on it.
    ///
    /// Returns false if the connection was already torn down.
    pub fn teardown(&self, kind: ErrorKind, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let cancelled = self.correlator.cancel_all(kind, reason);
        self.shutdown.send_replace(true);
        info!(conn_id = self.id, cancelled, reason, "Tunnel connection torn down");
        true
    }
}

/// Drain queued frames into the socket until teardown or a write failure.
///
/// The sink is only ever touched from here, which serializes every write on
/// the connection.
pub async fn write_loop<K>(mut sink: K, mut rx: mpsc::Receiver<Outbound>, conn: Arc<TunnelConnection>)
where
    K: Sink<Message> + Unpin,
    K::Error: std::fmt::Display,
{
    let mut closed = conn.closed_signal();
    let mut failed = false;

    loop {
        let out = tokio::select! {
            biased;
            _ = closed.wait_for(|done| *done) => break,
            out = rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };

        match sink.send(out.frame).await {
            Ok(()) => {
                if let Some(ack) = out.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let reason = format!("write failed: {e}");
                warn!(conn_id = conn.id(), "{}", reason);
                if let Some(ack) = out.ack {
                    let _ = ack.send(Err(Error::Transport(reason.clone())));
                }
                conn.teardown(ErrorKind::Transport, &reason);
                failed = true;
                break;
            }
        }
    }

    // Nothing queued may be left without an answer
    rx.close();
    while let Ok(out) = rx.try_recv() {
        if let Some(ack) = out.ack {
            let _ = ack.send(Err(Error::Transport("tunnel connection closed".into())));
        }
    }

    // A sink that already failed must not be polled again
    if !failed {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
    debug!(conn_id = conn.id(), "Tunnel writer stopped");
}

/// Observable lifecycle of the tunnel slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connected,
    /// Torn down, session still releasing the slot
    Draining,
}

/// Owner of the single tunnel slot
pub struct TunnelManager {
    slot: Mutex<Option<Arc<TunnelConnection>>>,
    policy: HandshakePolicy,
    next_id: AtomicU64,
}

impl TunnelManager {
    pub fn new(policy: HandshakePolicy) -> Self {
        Self {
            slot: Mutex::new(None),
            policy,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<TunnelConnection>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> HandshakePolicy {
        self.policy
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The open connection, if any.
    pub fn current(&self) -> Option<Arc<TunnelConnection>> {
        self.lock().as_ref().filter(|conn| !conn.is_closed()).cloned()
    }

    pub fn state(&self) -> TunnelState {
        match self.lock().as_ref() {
            None => TunnelState::Disconnected,
            Some(conn) if conn.is_closed() => TunnelState::Draining,
            Some(_) => TunnelState::Connected,
        }
    }

    /// Whether a handshake would be refused right now.
    pub fn would_reject(&self) -> bool {
        self.policy == HandshakePolicy::Reject && self.current().is_some()
    }

    /// Make `conn` the active connection according to the handshake policy.
    pub fn install(&self, conn: Arc<TunnelConnection>) -> Result<()> {
        let mut slot = self.lock();
        if let Some(old) = slot.as_ref().filter(|old| !old.is_closed()) {
            match self.policy {
                HandshakePolicy::Reject => return Err(Error::AlreadyConnected),
                HandshakePolicy::Replace => {
                    warn!(
                        old_conn = old.id(),
                        new_conn = conn.id(),
                        "Agent re-connecting while another connection is live, evicting old"
                    );
                    old.teardown(ErrorKind::Transport, "replaced by a new agent connection");
                }
            }
        }
        *slot = Some(conn);
        Ok(())
    }

    /// Clear the slot if it still holds `conn`.
    pub fn release(&self, conn: &TunnelConnection) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|current| current.id() == conn.id()) {
            *slot = None;
        }
    }

    /// Tear down whatever is connected (relay shutdown).
    pub fn shutdown(&self, reason: &str) {
        if let Some(conn) = self.lock().take() {
            conn.teardown(ErrorKind::Transport, reason);
        }
    }
}
