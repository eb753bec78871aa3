//! Database queries

use super::{Database, IdempotencyRecord, PaymentKind, PaymentRecord, PaymentStatus};
use crate::{PaywallError, PaywallResult};
use rusqlite::{OptionalExtension, Row};
use tracing::info;

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let kind: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(PaymentRecord {
        payment_hash: row.get(0)?,
        content_id: row.get::<_, i64>(1)? as u64,
        session_id: row.get(2)?,
        amount_sat: row.get::<_, i64>(3)? as u64,
        kind: PaymentKind::parse(&kind).unwrap_or(PaymentKind::Paywall),
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Pending),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const PAYMENT_COLUMNS: &str =
    "payment_hash, content_id, session_id, amount_sat, kind, status, created_at, updated_at";

/// Payment record queries
pub struct PaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> PaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Create a Pending payment record.
    ///
    /// Fails with `Conflict` if a record with the same payment hash already
    /// exists.
    pub async fn add_pending(
        &self,
        payment_hash: &str,
        content_id: u64,
        session_id: &str,
        amount_sat: u64,
        kind: PaymentKind,
    ) -> PaywallResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let now = chrono::Utc::now();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO payments
                (payment_hash, content_id, session_id, amount_sat, kind, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                payment_hash,
                content_id as i64,
                session_id,
                amount_sat as i64,
                kind.as_str(),
                PaymentStatus::Pending.as_str(),
                now,
                now,
            ],
        )?;

        if inserted == 0 {
            return Err(PaywallError::Conflict(format!(
                "payment {} already exists",
                payment_hash
            )));
        }

        info!(
            "DB: Created pending payment: hash={}, content_id={}, amount={} sat, kind={}",
            payment_hash,
            content_id,
            amount_sat,
            kind.as_str()
        );
        Ok(())
    }

    /// Transition a payment Pending → Paid.
    ///
    /// A no-op when the payment is already Paid, so duplicate confirmations
    /// that slipped past the deduplicator are tolerated. Fails with
    /// `NotFound` when no such payment exists and `Conflict` for any other
    /// backward transition. Returns the record after the transition.
    pub async fn confirm(&self, payment_hash: &str) -> PaywallResult<PaymentRecord> {
        self.transition(payment_hash, PaymentStatus::Paid, true).await
    }

    /// Transition a payment Pending → Failed
    pub async fn mark_failed(&self, payment_hash: &str) -> PaywallResult<PaymentRecord> {
        self.transition(payment_hash, PaymentStatus::Failed, true).await
    }

    /// Transition a payment Pending → Expired
    pub async fn mark_expired(&self, payment_hash: &str) -> PaywallResult<PaymentRecord> {
        self.transition(payment_hash, PaymentStatus::Expired, true).await
    }

    /// Transition a payment Paid → RefundPending
    pub async fn mark_refund_pending(&self, payment_hash: &str) -> PaywallResult<PaymentRecord> {
        self.transition(payment_hash, PaymentStatus::RefundPending, false).await
    }

    /// Transition a payment RefundPending → Refunded
    pub async fn mark_refunded(&self, payment_hash: &str) -> PaywallResult<PaymentRecord> {
        self.transition(payment_hash, PaymentStatus::Refunded, false).await
    }

    /// Apply a status transition, enforcing the status machine.
    ///
    /// When `idempotent` is set, a record already in the target status is
    /// returned unchanged instead of being treated as a conflict.
    async fn transition(
        &self,
        payment_hash: &str,
        next: PaymentStatus,
        idempotent: bool,
    ) -> PaywallResult<PaymentRecord> {
        let conn = self.db.conn();
        let conn = conn.lock().await;

        let record = conn
            .query_row(
                &format!("SELECT {} FROM payments WHERE payment_hash = ?1", PAYMENT_COLUMNS),
                rusqlite::params![payment_hash],
                payment_from_row,
            )
            .optional()?
            .ok_or_else(|| PaywallError::NotFound(format!("payment {}", payment_hash)))?;

        if record.status == next {
            if idempotent {
                return Ok(record);
            }
            return Err(PaywallError::Conflict(format!(
                "payment {} is already {}",
                payment_hash,
                next.as_str()
            )));
        }

        if !record.status.can_transition_to(next) {
            return Err(PaywallError::Conflict(format!(
                "payment {} cannot move {} -> {}",
                payment_hash,
                record.status.as_str(),
                next.as_str()
            )));
        }

        let now = chrono::Utc::now();
        conn.execute(
            "UPDATE payments SET status = ?1, updated_at = ?2 WHERE payment_hash = ?3",
            rusqlite::params![next.as_str(), now, payment_hash],
        )?;

        info!(
            "DB: Payment {} transitioned {} -> {}",
            payment_hash,
            record.status.as_str(),
            next.as_str()
        );

        Ok(PaymentRecord {
            status: next,
            updated_at: now,
            ..record
        })
    }

    /// Get a payment by hash
    pub async fn get_by_hash(&self, payment_hash: &str) -> PaywallResult<Option<PaymentRecord>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM payments WHERE payment_hash = ?1", PAYMENT_COLUMNS),
                rusqlite::params![payment_hash],
                payment_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get the most recent payment for a session/content pair.
    ///
    /// This is the read used by the access gate; a Paid row wins over any
    /// other status for the same pair.
    pub async fn get_state(
        &self,
        session_id: &str,
        content_id: u64,
    ) -> PaywallResult<Option<PaymentRecord>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM payments
                     WHERE session_id = ?1 AND content_id = ?2
                     ORDER BY status = 'paid' DESC, created_at DESC
                     LIMIT 1",
                    PAYMENT_COLUMNS
                ),
                rusqlite::params![session_id, content_id as i64],
                payment_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// List all payment records, newest first
    pub async fn list_all(&self) -> PaywallResult<Vec<PaymentRecord>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payments ORDER BY created_at DESC",
            PAYMENT_COLUMNS
        ))?;

        let rows = stmt.query_map([], payment_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

/// Idempotency key queries
pub struct IdempotencyQueries<'a> {
    db: &'a Database,
}

impl<'a> IdempotencyQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Get an idempotency record by key
    pub async fn get(&self, key: &str) -> PaywallResult<Option<IdempotencyRecord>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let record = conn
            .query_row(
                "SELECT idempotency_key, payment_hash, invoice, amount_sat, description, created_at
                 FROM idempotency_keys WHERE idempotency_key = ?1",
                rusqlite::params![key],
                |row| {
                    Ok(IdempotencyRecord {
                        idempotency_key: row.get(0)?,
                        payment_hash: row.get(1)?,
                        invoice: row.get(2)?,
                        amount_sat: row.get::<_, i64>(3)? as u64,
                        description: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Insert an idempotency record.
    ///
    /// Fails with `Conflict` if the key already exists; callers racing on the
    /// same key should read the existing record back instead.
    pub async fn insert(&self, record: &IdempotencyRecord) -> PaywallResult<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO idempotency_keys
                (idempotency_key, payment_hash, invoice, amount_sat, description, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            rusqlite::params![
                record.idempotency_key,
                record.payment_hash,
                record.invoice,
                record.amount_sat as i64,
                record.description,
                record.created_at,
            ],
        )?;

        if inserted == 0 {
            return Err(PaywallError::Conflict(format!(
                "idempotency key {} already exists",
                record.idempotency_key
            )));
        }

        info!(
            "DB: Recorded idempotency key {} -> payment {}",
            record.idempotency_key, record.payment_hash
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_add_pending_and_conflict() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("hash1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();

        let err = payments
            .add_pending("hash1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap_err();
        assert!(matches!(err, PaywallError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_confirm_is_idempotent() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("hash1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();

        let first = payments.confirm("hash1").await.unwrap();
        assert_eq!(first.status, PaymentStatus::Paid);

        // Duplicate confirmation is a no-op, not an error
        let second = payments.confirm("hash1").await.unwrap();
        assert_eq!(second.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_confirm_unknown_hash_is_not_found() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        let err = payments.confirm("missing").await.unwrap_err();
        assert!(matches!(err, PaywallError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_backward_transitions_rejected() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("hash1", 0, "sess1", 500, PaymentKind::Tip)
            .await
            .unwrap();
        payments.mark_expired("hash1").await.unwrap();

        // Expired payments cannot become Paid
        let err = payments.confirm("hash1").await.unwrap_err();
        assert!(matches!(err, PaywallError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_refund_path() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("hash1", 7, "sess1", 2500, PaymentKind::Paywall)
            .await
            .unwrap();

        // Refund before payment is rejected
        assert!(payments.mark_refund_pending("hash1").await.is_err());

        payments.confirm("hash1").await.unwrap();
        let rec = payments.mark_refund_pending("hash1").await.unwrap();
        assert_eq!(rec.status, PaymentStatus::RefundPending);
        let rec = payments.mark_refunded("hash1").await.unwrap();
        assert_eq!(rec.status, PaymentStatus::Refunded);

        // Refunded is terminal
        assert!(payments.mark_refund_pending("hash1").await.is_err());
    }

    #[tokio::test]
    async fn test_get_state_prefers_paid() {
        let db = test_db().await;
        let payments = PaymentQueries::new(&db);

        payments
            .add_pending("hash1", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        payments.mark_failed("hash1").await.unwrap();
        payments
            .add_pending("hash2", 42, "sess1", 1000, PaymentKind::Paywall)
            .await
            .unwrap();
        payments.confirm("hash2").await.unwrap();

        let state = payments.get_state("sess1", 42).await.unwrap().unwrap();
        assert_eq!(state.payment_hash, "hash2");
        assert_eq!(state.status, PaymentStatus::Paid);

        assert!(payments.get_state("sess2", 42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idempotency_insert_and_get() {
        let db = test_db().await;
        let keys = IdempotencyQueries::new(&db);

        let record = IdempotencyRecord {
            idempotency_key: "key1".to_string(),
            payment_hash: "hash1".to_string(),
            invoice: "lnbc1...".to_string(),
            amount_sat: 1000,
            description: "Article 42".to_string(),
            created_at: chrono::Utc::now(),
        };

        keys.insert(&record).await.unwrap();
        let stored = keys.get("key1").await.unwrap().unwrap();
        assert_eq!(stored.payment_hash, "hash1");

        let err = keys.insert(&record).await.unwrap_err();
        assert!(matches!(err, PaywallError::Conflict(_)));
    }
}
