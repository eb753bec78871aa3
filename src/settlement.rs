//! The settlement confirmation pipeline
//!
//! Both settlement paths (the daemon's in-process event stream and the HTTP
//! webhook) converge here: deduplicate the event, apply the payment-state
//! transition, then push the outcome to the originating session's realtime
//! queue. The state store is the source of truth; the realtime push is a
//! latency optimization only.

use crate::db::{Database, PaymentQueries, PaymentRecord};
use crate::dedup::EventDeduplicator;
use crate::hub::{RealtimeHub, SessionEvent};
use crate::node::SettlementEvent;
use crate::{PaywallError, PaywallResult};
use tracing::{debug, info, warn};

/// Apply a decoded settlement event.
///
/// Returns Ok for ignorable outcomes (duplicate delivery, unknown payment,
/// late event for an already-final payment) so callers can acknowledge the
/// delivery. Only infrastructure failures propagate; those also release the
/// dedup mark so the provider's redelivery can be processed.
pub async fn apply_settlement(
    db: &Database,
    dedup: &EventDeduplicator,
    hub: &RealtimeHub,
    event: SettlementEvent,
) -> PaywallResult<()> {
    let (label, payment_hash) = match &event {
        SettlementEvent::PaymentSucceeded { payment_hash } => ("succeeded", payment_hash.clone()),
        SettlementEvent::PaymentFailed { payment_hash } => ("failed", payment_hash.clone()),
        SettlementEvent::PaymentExpired { payment_hash } => ("expired", payment_hash.clone()),
        SettlementEvent::PaymentRefunded { payment_hash } => ("refunded", payment_hash.clone()),
        SettlementEvent::Ignored(kind) => {
            debug!("Settlement: ignoring event type {:?}", kind);
            return Ok(());
        }
    };

    // Keyed by event kind + hash: a success and a later refund for the same
    // payment are distinct events, redeliveries of either are not.
    let dedup_key = format!("{}:{}", label, payment_hash);
    if !dedup.try_begin(&dedup_key) {
        debug!("Settlement: duplicate {} event for {}, skipping", label, payment_hash);
        return Ok(());
    }

    let payments = PaymentQueries::new(db);
    let result = match &event {
        SettlementEvent::PaymentSucceeded { payment_hash } => {
            payments.confirm(payment_hash).await
        }
        SettlementEvent::PaymentFailed { payment_hash } => {
            payments.mark_failed(payment_hash).await
        }
        SettlementEvent::PaymentExpired { payment_hash } => {
            payments.mark_expired(payment_hash).await
        }
        SettlementEvent::PaymentRefunded { payment_hash } => {
            payments.mark_refunded(payment_hash).await
        }
        SettlementEvent::Ignored(_) => unreachable!(),
    };

    let record = match result {
        Ok(record) => record,
        Err(PaywallError::NotFound(_)) => {
            // Not a payment we issued (or not ours at all). Acknowledge so
            // the provider stops redelivering.
            debug!("Settlement: no record for payment {}, ignoring", payment_hash);
            dedup.complete(&dedup_key);
            return Ok(());
        }
        Err(PaywallError::Conflict(e)) => {
            // Late or out-of-order event against a final status
            warn!("Settlement: dropping {} event for {}: {}", label, payment_hash, e);
            dedup.complete(&dedup_key);
            return Ok(());
        }
        Err(e) => {
            // Infrastructure failure: release the mark so redelivery works
            dedup.forget(&dedup_key);
            return Err(e);
        }
    };

    publish_transition(hub, &event, &record);
    dedup.complete(&dedup_key);

    info!(
        "Settlement: payment {} marked {} (session={}, content_id={})",
        record.payment_hash, label, record.session_id, record.content_id
    );
    Ok(())
}

fn publish_transition(hub: &RealtimeHub, event: &SettlementEvent, record: &PaymentRecord) {
    match event {
        SettlementEvent::PaymentSucceeded { .. } => hub.publish(
            &record.session_id,
            SessionEvent::PaymentPaid {
                payment_hash: record.payment_hash.clone(),
                content_id: record.content_id,
            },
        ),
        SettlementEvent::PaymentFailed { .. } => hub.publish(
            &record.session_id,
            SessionEvent::PaymentFailed {
                payment_hash: record.payment_hash.clone(),
            },
        ),
        // Expiry and refunds have no waiting browser session to notify
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PaymentKind, PaymentStatus};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        db: Arc<Database>,
        dedup: EventDeduplicator,
        hub: RealtimeHub,
    }

    async fn fixture() -> Fixture {
        Fixture {
            db: Arc::new(Database::connect("sqlite::memory:").await.unwrap()),
            dedup: EventDeduplicator::new(Duration::from_secs(60)),
            hub: RealtimeHub::new(),
        }
    }

    fn paid(hash: &str) -> SettlementEvent {
        SettlementEvent::PaymentSucceeded {
            payment_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_settlement_confirms_and_notifies_session() {
        let f = fixture().await;
        PaymentQueries::new(&f.db)
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();

        let (_id, mut rx) = f.hub.subscribe("sess1");

        apply_settlement(&f.db, &f.dedup, &f.hub, paid("h1")).await.unwrap();

        let record = PaymentQueries::new(&f.db).get_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Paid);

        match rx.recv().await.unwrap() {
            SessionEvent::PaymentPaid {
                payment_hash,
                content_id,
            } => {
                assert_eq!(payment_hash, "h1");
                assert_eq!(content_id, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_delivery_confirms_once() {
        let f = fixture().await;
        PaymentQueries::new(&f.db)
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();

        let (_id, mut rx) = f.hub.subscribe("sess1");

        apply_settlement(&f.db, &f.dedup, &f.hub, paid("h1")).await.unwrap();
        // Redelivery of the same settlement
        apply_settlement(&f.db, &f.dedup, &f.hub, paid("h1")).await.unwrap();

        let record = PaymentQueries::new(&f.db).get_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Paid);

        // Exactly one realtime notification
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_payment_is_acknowledged() {
        let f = fixture().await;
        // Must not error: a 2xx acknowledgement stops provider retries
        apply_settlement(&f.db, &f.dedup, &f.hub, paid("unknown")).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_event_marks_failed_and_notifies() {
        let f = fixture().await;
        PaymentQueries::new(&f.db)
            .add_pending("h1", 0, "sess1", 500, PaymentKind::Tip)
            .await
            .unwrap();

        let (_id, mut rx) = f.hub.subscribe("sess1");

        apply_settlement(
            &f.db,
            &f.dedup,
            &f.hub,
            SettlementEvent::PaymentFailed {
                payment_hash: "h1".to_string(),
            },
        )
        .await
        .unwrap();

        let record = PaymentQueries::new(&f.db).get_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Failed);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::PaymentFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_late_failure_after_paid_is_dropped() {
        let f = fixture().await;
        PaymentQueries::new(&f.db)
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();

        apply_settlement(&f.db, &f.dedup, &f.hub, paid("h1")).await.unwrap();
        apply_settlement(
            &f.db,
            &f.dedup,
            &f.hub,
            SettlementEvent::PaymentFailed {
                payment_hash: "h1".to_string(),
            },
        )
        .await
        .unwrap();

        let record = PaymentQueries::new(&f.db).get_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_refund_event_completes_refund() {
        let f = fixture().await;
        let payments = PaymentQueries::new(&f.db);
        payments
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        payments.confirm("h1").await.unwrap();
        payments.mark_refund_pending("h1").await.unwrap();

        apply_settlement(
            &f.db,
            &f.dedup,
            &f.hub,
            SettlementEvent::PaymentRefunded {
                payment_hash: "h1".to_string(),
            },
        )
        .await
        .unwrap();

        let record = payments.get_by_hash("h1").await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Refunded);
    }
}
