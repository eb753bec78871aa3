//! Settlement event decoding and the daemon event listener
//!
//! The daemon's event delivery is at-least-once, and its payload schema
//! evolves. Events are decoded into a typed enum in a single step so a
//! malformed or unknown payload fails (or is ignored) up front instead of
//! deep inside field lookups.

use crate::db::Database;
use crate::dedup::EventDeduplicator;
use crate::hub::RealtimeHub;
use crate::settlement;
use crate::{PaywallError, PaywallResult};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reference to the payment a settlement event concerns
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRef {
    /// Payment hash, hex-encoded
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    payment: Option<PaymentRef>,
}

/// A decoded settlement notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    /// A previously issued invoice was paid
    PaymentSucceeded {
        /// Payment hash of the settled payment
        payment_hash: String,
    },
    /// A payment attempt failed
    PaymentFailed {
        /// Payment hash of the failed payment
        payment_hash: String,
    },
    /// An invoice expired unpaid
    PaymentExpired {
        /// Payment hash of the expired invoice
        payment_hash: String,
    },
    /// A refund for a settled payment completed
    PaymentRefunded {
        /// Payment hash of the refunded payment
        payment_hash: String,
    },
    /// An event type this service does not act on
    Ignored(String),
}

impl SettlementEvent {
    /// Decode a settlement event from its JSON wire form
    /// `{ "type": "...", "payment": { "id": "..." } }`.
    ///
    /// Unknown `type` values decode to [`SettlementEvent::Ignored`] so the
    /// caller can acknowledge them without acting. A recognized type with a
    /// missing payment reference is an error.
    pub fn decode(raw: &str) -> PaywallResult<Self> {
        let EventEnvelope { kind, payment } = serde_json::from_str(raw)
            .map_err(|e| PaywallError::InvalidRequest(format!("malformed event payload: {}", e)))?;

        let payment_hash = payment.map(|p| p.id).filter(|id| !id.is_empty());
        let hash = |kind: &str| {
            payment_hash.clone().ok_or_else(|| {
                PaywallError::InvalidRequest(format!(
                    "event {} is missing a payment reference",
                    kind
                ))
            })
        };

        match kind.as_str() {
            "payment_succeeded" | "payment_received" => Ok(SettlementEvent::PaymentSucceeded {
                payment_hash: hash(&kind)?,
            }),
            "payment_failed" => Ok(SettlementEvent::PaymentFailed {
                payment_hash: hash(&kind)?,
            }),
            "payment_expired" => Ok(SettlementEvent::PaymentExpired {
                payment_hash: hash(&kind)?,
            }),
            "payment_refunded" => Ok(SettlementEvent::PaymentRefunded {
                payment_hash: hash(&kind)?,
            }),
            other => Ok(SettlementEvent::Ignored(other.to_string())),
        }
    }
}

/// Consume the daemon's event stream until cancelled.
///
/// Reconnects with a fixed backoff when the stream drops. Each decoded event
/// is handled on its own spawned task with a log-and-continue boundary, so
/// one bad event can neither block the stream nor crash the listener.
pub(super) async fn run_listener(
    wallet: Arc<super::WalletHandle>,
    db: Arc<Database>,
    dedup: Arc<EventDeduplicator>,
    hub: Arc<RealtimeHub>,
    cancel: CancellationToken,
) {
    info!("Settlement event listener started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let client = match wallet.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!("Event listener cannot reach wallet daemon: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        let response = match client.open_event_stream().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to open event stream: {}", e);
                wallet.mark_disconnected();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        info!("Event stream connected");
        consume_stream(response, &db, &dedup, &hub, &cancel).await;

        if !cancel.is_cancelled() {
            warn!("Event stream closed, reconnecting...");
            wallet.mark_disconnected();
        }
    }

    info!("Settlement event listener stopped");
}

async fn consume_stream(
    response: reqwest::Response,
    db: &Arc<Database>,
    dedup: &Arc<EventDeduplicator>,
    hub: &Arc<RealtimeHub>,
    cancel: &CancellationToken,
) {
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = stream.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!("Event stream read error: {}", e);
                break;
            }
            None => break,
        };

        buffer.extend_from_slice(&chunk);

        // One JSON event per line; a trailing partial line stays buffered.
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim().trim_start_matches("data:").trim();
            if line.is_empty() {
                continue;
            }
            dispatch_event(line, db, dedup, hub);
        }
    }
}

/// Decode one event line and handle it on a detached task.
///
/// The daemon's dispatch must never block on our processing, and a failure
/// while handling one event must not abort the surrounding batch.
fn dispatch_event(
    line: &str,
    db: &Arc<Database>,
    dedup: &Arc<EventDeduplicator>,
    hub: &Arc<RealtimeHub>,
) {
    let event = match SettlementEvent::decode(line) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping undecodable event: {}", e);
            return;
        }
    };

    if let SettlementEvent::Ignored(kind) = &event {
        debug!("Ignoring event type {:?} from daemon stream", kind);
        return;
    }

    let db = db.clone();
    let dedup = dedup.clone();
    let hub = hub.clone();
    tokio::spawn(async move {
        if let Err(e) = settlement::apply_settlement(&db, &dedup, &hub, event).await {
            error!("Failed to apply settlement event: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_succeeded() {
        let event = SettlementEvent::decode(
            r#"{"type":"payment_succeeded","payment":{"id":"abc123"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SettlementEvent::PaymentSucceeded {
                payment_hash: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_decode_received_alias() {
        let event =
            SettlementEvent::decode(r#"{"type":"payment_received","payment":{"id":"abc"}}"#)
                .unwrap();
        assert!(matches!(event, SettlementEvent::PaymentSucceeded { .. }));
    }

    #[test]
    fn test_decode_failed_and_expired() {
        assert!(matches!(
            SettlementEvent::decode(r#"{"type":"payment_failed","payment":{"id":"a"}}"#).unwrap(),
            SettlementEvent::PaymentFailed { .. }
        ));
        assert!(matches!(
            SettlementEvent::decode(r#"{"type":"payment_expired","payment":{"id":"a"}}"#).unwrap(),
            SettlementEvent::PaymentExpired { .. }
        ));
    }

    #[test]
    fn test_unknown_type_is_ignored_not_error() {
        let event = SettlementEvent::decode(r#"{"type":"channel_opened"}"#).unwrap();
        assert_eq!(event, SettlementEvent::Ignored("channel_opened".to_string()));
    }

    #[test]
    fn test_missing_payment_ref_is_error() {
        assert!(SettlementEvent::decode(r#"{"type":"payment_succeeded"}"#).is_err());
        assert!(
            SettlementEvent::decode(r#"{"type":"payment_succeeded","payment":{"id":""}}"#).is_err()
        );
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(SettlementEvent::decode("not json").is_err());
        assert!(SettlementEvent::decode("{}").is_err());
    }
}
