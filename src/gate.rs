//! Content access gate
//!
//! The consumer-facing allow/deny decision. Called on every protected page
//! view, so it is read-only and cheap: one indexed lookup against the
//! payment store.

use crate::db::{Database, PaymentQueries, PaymentStatus};
use crate::PaywallResult;
use std::sync::Arc;

/// Read-only access decisions over the payment store
pub struct AccessGate {
    db: Arc<Database>,
}

impl AccessGate {
    /// Create a gate over the given store
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Whether `session_id` has unlocked `content_id`.
    ///
    /// True iff a payment record exists for the pair with status Paid.
    /// "No record" and Pending/Failed/Expired are identically locked.
    pub async fn is_unlocked(&self, session_id: &str, content_id: u64) -> PaywallResult<bool> {
        let record = PaymentQueries::new(&self.db)
            .get_state(session_id, content_id)
            .await?;
        Ok(matches!(record, Some(r) if r.status == PaymentStatus::Paid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::PaymentKind;

    async fn gate_with_db() -> (AccessGate, Arc<Database>) {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        (AccessGate::new(db.clone()), db)
    }

    #[tokio::test]
    async fn test_no_record_is_locked() {
        let (gate, _db) = gate_with_db().await;
        assert!(!gate.is_unlocked("sess1", 42).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_failed_expired_are_locked() {
        let (gate, db) = gate_with_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        assert!(!gate.is_unlocked("sess1", 42).await.unwrap());

        payments.mark_failed("h1").await.unwrap();
        assert!(!gate.is_unlocked("sess1", 42).await.unwrap());

        payments
            .add_pending("h2", 43, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        payments.mark_expired("h2").await.unwrap();
        assert!(!gate.is_unlocked("sess1", 43).await.unwrap());
    }

    #[tokio::test]
    async fn test_paid_is_unlocked_for_owning_session_only() {
        let (gate, db) = gate_with_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("h1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        payments.confirm("h1").await.unwrap();

        assert!(gate.is_unlocked("sess1", 42).await.unwrap());
        assert!(!gate.is_unlocked("sess2", 42).await.unwrap());
        assert!(!gate.is_unlocked("sess1", 43).await.unwrap());
    }
}
