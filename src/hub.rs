//! Realtime event hub
//!
//! Maintains one outbound ordered queue per realtime subscriber, keyed by
//! session. Settlement writers publish small events ("payment paid",
//! "payment failed") that the per-session SSE connection drains. A session
//! normally has one subscriber, but multiple concurrent tabs and zero
//! subscribers must both be tolerated: events for absent sessions are
//! dropped silently, since clients re-derive state from the payment store on
//! reconnect.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound on each subscriber queue. Publishing never blocks; an event that
/// finds the queue full is dropped and re-derived from state by the client.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// An event pushed to a browser session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A payment for this session settled
    PaymentPaid {
        /// Payment hash of the settled payment
        payment_hash: String,
        /// Content the payment unlocks; 0 for tips
        content_id: u64,
    },
    /// A payment for this session failed
    PaymentFailed {
        /// Payment hash of the failed payment
        payment_hash: String,
    },
    /// Liveness frame
    Heartbeat,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SessionEvent>,
}

/// Per-session outbound event queues
pub struct RealtimeHub {
    sessions: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_client_id: AtomicU64,
}

impl RealtimeHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber for `session_id`.
    ///
    /// Returns the client id (needed to unsubscribe) and the receiving end
    /// of the subscriber's queue.
    pub fn subscribe(&self, session_id: &str) -> (u64, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        debug!("Hub: client {} subscribed to session {}", id, session_id);
        (id, rx)
    }

    /// Remove a subscriber. Called on client disconnect so the queue is
    /// released promptly.
    pub fn unsubscribe(&self, session_id: &str, client_id: u64) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = sessions.get_mut(session_id) {
            subs.retain(|s| s.id != client_id);
            if subs.is_empty() {
                sessions.remove(session_id);
            }
        }
        debug!("Hub: client {} unsubscribed from session {}", client_id, session_id);
    }

    /// Enqueue `event` onto every active subscriber for `session_id`.
    ///
    /// Never blocks: a full queue drops the event, a closed queue evicts the
    /// subscriber, and a session with no subscribers drops silently.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subs) = sessions.get_mut(session_id) else {
            debug!("Hub: no subscribers for session {}, dropping event", session_id);
            return;
        };

        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Hub: queue full for client {} on session {}, dropping event",
                    sub.id, session_id
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Hub: client {} gone, evicting", sub.id);
                false
            }
        });

        if subs.is_empty() {
            sessions.remove(session_id);
        }
    }

    /// Number of active subscribers across all sessions
    pub fn subscriber_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().map(|v| v.len()).sum()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
