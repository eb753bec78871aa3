//! Invoice creation endpoint
//!
//! `POST /v1/invoices` accepts a content identifier and/or a tip amount,
//! issues an invoice through the idempotency map and the wallet client, and
//! records a Pending payment bound to the caller's session. The session
//! cookie is set or refreshed on every response so the later realtime stream
//! and access checks can find the payment.

use super::{
    error_response, error_to_status_code, new_session_id, session_cookie_value,
    session_from_headers, ApiResponse, ApiState,
};
use crate::db::{PaymentKind, PaymentQueries};
use crate::PaywallError;
use axum::{
    extract::{ConnectInfo, State},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

/// Invoice creation request
#[derive(Debug, Deserialize)]
pub struct CreateInvoiceRequest {
    /// Content to unlock; omitted or 0 for a tip
    #[serde(default)]
    pub content_id: u64,
    /// Amount in satoshis
    pub amount_sat: u64,
    /// Invoice description shown in the payer's wallet
    pub description: String,
}

/// Invoice creation response
#[derive(Debug, Serialize)]
pub struct CreateInvoiceResponse {
    /// The BOLT11 invoice to present to the payer
    pub invoice: String,
    /// Payment hash identifying the payment
    pub payment_hash: String,
}

/// Create an invoice and record a Pending payment
pub async fn create_invoice(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateInvoiceRequest>,
) -> impl IntoResponse {
    let app = &state.app;

    // Rate limit per remote address before doing any work
    let bucket = format!("{}:invoices", remote.ip());
    let permit = app.limiter.try_consume(
        &bucket,
        app.config.api.rate_limit_per_minute,
        Duration::from_secs(60),
    );
    if !permit.allowed {
        warn!("API: rate limited invoice creation from {}", remote.ip());
        let mut headers = HeaderMap::new();
        let retry_after = permit.retry_after.as_secs().max(1).to_string();
        if let Ok(value) = retry_after.parse() {
            headers.insert(axum::http::header::RETRY_AFTER, value);
        }
        return (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            Json(ApiResponse::<CreateInvoiceResponse>::error("Rate limit exceeded")),
        );
    }

    // Bind the payment to the caller's session, minting one if absent
    let (session_id, fresh_session) = match session_from_headers(&headers) {
        Some(session_id) => (session_id, false),
        None => (new_session_id(), true),
    };

    info!(
        "API: invoice request from {}: content_id={}, amount={} sat",
        remote.ip(),
        req.content_id,
        req.amount_sat
    );

    let kind = if req.content_id == 0 {
        PaymentKind::Tip
    } else {
        PaymentKind::Paywall
    };

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let result = issue_invoice(app, &session_id, &req, kind, idempotency_key.as_deref()).await;

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = session_cookie_value(&session_id).parse() {
        response_headers.insert(SET_COOKIE, value);
    }

    match result {
        Ok(issued) => {
            info!(
                "API: invoice issued: payment_hash={}, session={}{}",
                issued.payment_hash,
                session_id,
                if fresh_session { " (new session)" } else { "" }
            );
            (
                StatusCode::OK,
                response_headers,
                Json(ApiResponse::success(CreateInvoiceResponse {
                    invoice: issued.invoice,
                    payment_hash: issued.payment_hash,
                })),
            )
        }
        Err(e) => (
            error_to_status_code(&e),
            response_headers,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Drive invoice issuance and record the Pending payment.
///
/// With an idempotency key, a retried request returns the stored invoice and
/// the existing Pending record is left untouched; without one, every call
/// issues fresh.
async fn issue_invoice(
    app: &crate::PaywallApp,
    session_id: &str,
    req: &CreateInvoiceRequest,
    kind: PaymentKind,
    idempotency_key: Option<&str>,
) -> crate::PaywallResult<crate::idempotency::IssuedInvoice> {
    let issued = match idempotency_key {
        Some(key) => {
            let wallet = app.wallet.clone();
            let amount = req.amount_sat;
            let description = req.description.clone();
            app.idempotency
                .get_or_create(key, req.amount_sat, &req.description, move || async move {
                    wallet.create_invoice(amount, &description).await
                })
                .await?
        }
        None => app.wallet.create_invoice(req.amount_sat, &req.description).await?,
    };

    match PaymentQueries::new(&app.db)
        .add_pending(
            &issued.payment_hash,
            req.content_id,
            session_id,
            req.amount_sat,
            kind,
        )
        .await
    {
        Ok(()) => {}
        // A replayed idempotent request already recorded this payment
        Err(PaywallError::Conflict(_)) if idempotency_key.is_some() => {}
        Err(e) => return Err(e),
    }

    Ok(issued)
}

/// Access check response
#[derive(Debug, Serialize)]
pub struct AccessResponse {
    /// Whether the session has unlocked the content
    pub unlocked: bool,
}

/// Check whether the caller's session has unlocked a piece of content.
///
/// Read-only; called by the host integration on every protected page view.
pub async fn check_access(
    State(state): State<ApiState>,
    axum::extract::Path(content_id): axum::extract::Path<u64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(session_id) = session_from_headers(&headers) else {
        // No session means nothing could have been paid for
        return (
            StatusCode::OK,
            Json(ApiResponse::success(AccessResponse { unlocked: false })),
        );
    };

    match state.app.gate.is_unlocked(&session_id, content_id).await {
        Ok(unlocked) => (
            StatusCode::OK,
            Json(ApiResponse::success(AccessResponse { unlocked })),
        ),
        Err(e) => error_response(&e),
    }
}
