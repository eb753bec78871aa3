//! Settlement webhook intake
//!
//! `POST /v1/webhook/payment` receives settlement notifications from the
//! wallet daemon. The body is size-bounded, optionally HMAC-verified, and
//! decoded in one step; a 2xx response is only sent after the payment-state
//! transition is durably committed, so an acknowledged delivery is never
//! lost on crash. Unknown event types are acknowledged and logged rather
//! than rejected, to avoid provider retry storms.

use super::{error_response, ApiResponse, ApiState};
use crate::node::SettlementEvent;
use crate::settlement;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signature header set by the wallet daemon when a shared secret is
/// configured: lowercase hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Webhook acknowledgement
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the event was acted upon (false for ignored types)
    pub processed: bool,
}

/// Verify the HMAC-SHA256 signature of `body` against `signature_hex`
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    // Constant-time comparison
    mac.verify_slice(&signature).is_ok()
}

/// Handle a settlement webhook delivery
pub async fn handle_payment_webhook(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let app = &state.app;

    // A 429 is safe here: the provider treats it as a failed delivery and
    // redelivers after a backoff.
    let bucket = format!("{}:webhook", remote.ip());
    let permit = app.limiter.try_consume(
        &bucket,
        app.config.api.rate_limit_per_minute,
        Duration::from_secs(60),
    );
    if !permit.allowed {
        warn!("Webhook: rate limited deliveries from {}", remote.ip());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::error("Rate limit exceeded")),
        );
    }

    // Signature check comes first: an unauthenticated payload must not be
    // parsed further, let alone mutate state.
    if let Some(secret) = &app.config.api.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            warn!("Webhook: rejected delivery with missing or invalid signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ApiResponse::error("Invalid webhook signature")),
            );
        }
    }

    let raw = String::from_utf8_lossy(&body);
    let event = match SettlementEvent::decode(&raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("Webhook: undecodable payload: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("Malformed webhook payload")),
            );
        }
    };

    if let SettlementEvent::Ignored(kind) = &event {
        // Acknowledged but not acted on; rejecting would only make the
        // provider redeliver something we will never handle.
        info!("Webhook: ignoring event type {:?}", kind);
        return (
            StatusCode::OK,
            Json(ApiResponse::success(WebhookResponse { processed: false })),
        );
    }

    // The transition is committed before this returns; only then do we
    // acknowledge. An error response makes the provider redeliver.
    match settlement::apply_settlement(&app.db, &app.dedup, &app.hub, event).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(WebhookResponse { processed: true })),
        ),
        Err(e) => error_response(&e),
    }
}
