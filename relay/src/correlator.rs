//! Request/response correlation for a single tunnel connection.
//!
//! Each forwarded request parks a oneshot sender here under its conversation
//! id. The reader loop resolves it when the agent answers; teardown of the
//! owning connection fails every waiter still parked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use burrow_shared::protocol::{ConversationId, IncomingMessage};
use burrow_shared::{Error, ErrorKind, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Delivery = Result<IncomingMessage>;

struct Slot {
    seq: u64,
    tx: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<ConversationId, Slot>,
    /// Set once by `cancel_all`; later registrations fail fast.
    closed: Option<(ErrorKind, String)>,
}

/// Pending-request table for one tunnel connection
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
    next_seq: AtomicU64,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // No operation leaves the table half-updated, so a poisoned lock is still usable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a waiter for `id`. Must happen before the request is sent.
    pub fn register(self: &Arc<Self>, id: ConversationId) -> Result<Waiter> {
        let mut table = self.lock();
        if let Some((kind, reason)) = &table.closed {
            return Err(Error::from_kind(*kind, reason.clone()));
        }
        if table.pending.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        table.pending.insert(id.clone(), Slot { seq, tx });

        Ok(Waiter {
            id,
            seq,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand `msg` to its waiter. Returns false when nobody is waiting.
    pub fn dispatch(&self, msg: IncomingMessage) -> bool {
        let slot = self.lock().pending.remove(&msg.conversation_id);
        match slot {
            Some(slot) => {
                let id = msg.conversation_id.clone();
                if slot.tx.send(Ok(msg)).is_err() {
                    debug!(conversation_id = %id, "Waiter went away before delivery");
                }
                true
            }
            None => {
                warn!(
                    conversation_id = %msg.conversation_id,
                    "Response for unknown or already resolved request (dropped)"
                );
                false
            }
        }
    }

    /// Fail every pending waiter and refuse further registrations.
    ///
    /// Only the first call has any effect; it returns how many waiters it
    /// failed.
    pub fn cancel_all(&self, kind: ErrorKind, reason: &str) -> usize {
        let drained: Vec<Slot> = {
            let mut table = self.lock();
            if table.closed.is_some() {
                return 0;
            }
            table.closed = Some((kind, reason.to_string()));
            table.pending.drain().map(|(_, slot)| slot).collect()
        };

        let count = drained.len();
        for slot in drained {
            let _ = slot.tx.send(Err(Error::from_kind(kind, reason)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    fn forget(&self, id: &str, seq: u64) {
        let mut table = self.lock();
        if table.pending.get(id).is_some_and(|slot| slot.seq == seq) {
            table.pending.remove(id);
        }
    }
}

/// Single-use handle on a pending request.
///
/// Dropping it unresolved (timeout, caller hung up) removes the table entry,
/// so a late response falls through `dispatch`'s miss path.
pub struct Waiter {
    id: ConversationId,
    seq: u64,
    rx: oneshot::Receiver<Delivery>,
    correlator: Arc<Correlator>,
}

impl Waiter {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the agent's reply or a connection-wide failure.
    pub async fn wait(mut self) -> Result<IncomingMessage> {
        match (&mut self.rx).await {
            Ok(delivery) => delivery,
            Err(_) => Err(Error::Transport("correlator dropped".into())),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.correlator.forget(&self.id, self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_shared::protocol::Headers;
    use std::time::Duration;

    fn reply(id: &str, body: &str) -> IncomingMessage {
        IncomingMessage::response(id, 200, Headers::new(), body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_its_waiter() {
        let correlator = Correlator::new();
        let ids: Vec<String> = (0..64).map(|i| format!("conv-{i}")).collect();

        let mut handles = Vec::new();
        for id in &ids {
            let waiter = correlator.register(id.clone()).unwrap();
            let expected = id.clone();
            handles.push(tokio::spawn(async move {
                let msg = waiter.wait().await.unwrap();
                assert_eq!(msg.conversation_id, expected);
                assert_eq!(msg.body, expected.as_bytes());
            }));
        }
        assert_eq!(correlator.len(), 64);

        // Answer in reverse order
        for id in ids.iter().rev() {
            assert!(correlator.dispatch(reply(id, id)));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(correlator.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_every_waiter_once() {
        let correlator = Correlator::new();
        let waiters: Vec<Waiter> = (0..3)
            .map(|i| correlator.register(format!("c{i}")).unwrap())
            .collect();

        assert_eq!(correlator.cancel_all(ErrorKind::Transport, "agent disconnected"), 3);
        assert_eq!(correlator.len(), 0);
        // Idempotent
        assert_eq!(correlator.cancel_all(ErrorKind::Transport, "again"), 0);

        for waiter in waiters {
            let err = waiter.wait().await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transport);
            assert!(err.to_string().contains("agent disconnected"));
        }
    }

    #[tokio::test]
    async fn test_register_after_cancel_fails_fast() {
        let correlator = Correlator::new();
        correlator.cancel_all(ErrorKind::Transport, "closed");
        let err = correlator.register("late".into()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn test_dispatch_unknown_is_noop() {
        let correlator = Correlator::new();
        let _waiter = correlator.register("known".into()).unwrap();

        assert!(!correlator.dispatch(reply("unknown", "x")));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_resolution_is_noop() {
        let correlator = Correlator::new();
        let waiter = correlator.register("once".into()).unwrap();
        assert!(correlator.dispatch(reply("once", "first")));
        assert!(!correlator.dispatch(reply("once", "second")));

        let msg = waiter.wait().await.unwrap();
        assert_eq!(msg.body, b"first");
        assert_eq!(correlator.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let correlator = Correlator::new();
        let first = correlator.register("same".into()).unwrap();

        let err = correlator.register("same".into()).err().unwrap();
        assert!(matches!(err, Error::DuplicateId(ref id) if id == "same"));
        assert_eq!(correlator.len(), 1);

        // The rejected attempt must not disturb the original waiter
        assert!(correlator.dispatch(reply("same", "ok")));
        assert_eq!(first.wait().await.unwrap().body, b"ok");
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_no_entry() {
        let correlator = Correlator::new();
        let waiter = correlator.register("timeout".into()).unwrap();

        let res = tokio::time::timeout(Duration::from_millis(10), waiter.wait()).await;
        assert!(res.is_err());
        assert_eq!(correlator.len(), 0);
        assert!(!correlator.dispatch(reply("timeout", "late")));
    }

    #[test]
    fn test_stale_waiter_does_not_remove_newer_entry() {
        let correlator = Correlator::new();
        let first = correlator.register("reused".into()).unwrap();
        assert!(correlator.dispatch(reply("reused", "a")));

        let _second = correlator.register("reused".into()).unwrap();
        drop(first);
        assert_eq!(correlator.len(), 1);
    }
}
