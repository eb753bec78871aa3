//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a payment buys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    /// Unlocks a specific piece of content
    Paywall,
    /// A tip, not bound to content
    Tip,
}

impl PaymentKind {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Paywall => "paywall",
            PaymentKind::Tip => "tip",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paywall" => Some(PaymentKind::Paywall),
            "tip" => Some(PaymentKind::Tip),
            _ => None,
        }
    }
}

/// Payment lifecycle status.
///
/// Transitions are monotonic: Pending → {Paid, Failed, Expired}; the only
/// reverse-looking path is Paid → RefundPending → Refunded. A payment can
/// never move back to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Invoice issued, settlement not yet observed
    Pending,
    /// Settlement confirmed
    Paid,
    /// The payment failed
    Failed,
    /// The invoice expired unpaid
    Expired,
    /// A refund has been requested for a paid payment
    RefundPending,
    /// The refund completed
    Refunded,
}

impl PaymentStatus {
    /// Stable string form stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::RefundPending => "refund_pending",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Parse the stored string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            "expired" => Some(PaymentStatus::Expired),
            "refund_pending" => Some(PaymentStatus::RefundPending),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Paid, RefundPending)
                | (RefundPending, Refunded)
        )
    }
}

/// A payment record, keyed by payment hash.
///
/// Created when an invoice is issued; mutated only by the settlement path or
/// an explicit refund path; never deleted (audit trail).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Lightning payment hash (unique, immutable)
    pub payment_hash: String,
    /// Content identifier; 0 means not content-scoped (e.g. a tip)
    pub content_id: u64,
    /// Opaque session token binding this payment to a browser or wallet
    pub session_id: String,
    /// Amount in satoshis
    pub amount_sat: u64,
    /// What the payment buys
    pub kind: PaymentKind,
    /// Current lifecycle status
    pub status: PaymentStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// An idempotency record, keyed by a caller-supplied key.
///
/// At most one record per key; a repeated creation request with the same key
/// and the same logical parameters returns the previously issued invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Caller-supplied idempotency key
    pub idempotency_key: String,
    /// Payment hash of the issued invoice
    pub payment_hash: String,
    /// The issued invoice string
    pub invoice: String,
    /// Amount snapshot the invoice was issued for
    pub amount_sat: u64,
    /// Description snapshot the invoice was issued for
    pub description: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Paid,
            PaymentStatus::Failed,
            PaymentStatus::Expired,
            PaymentStatus::RefundPending,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("bogus"), None);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Expired));
        assert!(Paid.can_transition_to(RefundPending));
        assert!(RefundPending.can_transition_to(Refunded));

        // No backward or skipping paths
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Refunded));
        assert!(!Pending.can_transition_to(Refunded));
        assert!(!Expired.can_transition_to(Paid));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Refunded.can_transition_to(Paid));
    }
}
