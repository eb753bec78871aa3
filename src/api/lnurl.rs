//! LNURL-pay endpoints
//!
//! Wallet-initiated payments cannot carry the browser's session cookie, so
//! the discovery response embeds the session in the callback URL as an
//! opaque `state` query parameter. The wallet then hits the callback with
//! that state, and the issued invoice lands on the right session.

use super::{error_response, new_session_id, session_from_headers, ApiState};
use crate::db::{PaymentKind, PaymentQueries};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// LNURL-pay discovery response (LUD-06)
#[derive(Debug, Serialize)]
pub struct LnurlPayResponse {
    /// Always "payRequest"
    pub tag: String,
    /// Callback URL the wallet invokes with an amount
    pub callback: String,
    /// Minimum sendable amount (millisatoshis)
    #[serde(rename = "minSendable")]
    pub min_sendable: u64,
    /// Maximum sendable amount (millisatoshis)
    #[serde(rename = "maxSendable")]
    pub max_sendable: u64,
    /// Metadata string the wallet displays and hashes into the invoice
    pub metadata: String,
}

/// LNURL error response in the shape wallets expect
#[derive(Debug, Serialize)]
pub struct LnurlError {
    /// Always "ERROR"
    pub status: String,
    /// Human-readable reason
    pub reason: String,
}

impl LnurlError {
    fn new(reason: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "ERROR".to_string(),
            reason: reason.into(),
        })
    }
}

/// Serve LNURL-pay discovery for the configured lightning address
pub async fn lnurl_pay_discovery(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let config = &state.app.config;

    if name != config.lnurl.address_name {
        return (
            StatusCode::NOT_FOUND,
            LnurlError::new(format!("Unknown address {}", name)),
        )
            .into_response();
    }

    let Some(public_url) = config.api.public_url.as_deref() else {
        warn!("LNURL: discovery requested but no public_url configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            LnurlError::new("LNURL-pay is not configured"),
        )
            .into_response();
    };

    // Reuse the browser session when discovery came through it; mint a
    // fresh one for pure wallet flows.
    let session_id = session_from_headers(&headers).unwrap_or_else(new_session_id);

    let metadata = serde_json::to_string(&[[
        "text/plain".to_string(),
        format!("Payment to {}", config.lnurl.address_name),
    ]])
    .unwrap_or_default();

    let response = LnurlPayResponse {
        tag: "payRequest".to_string(),
        callback: format!(
            "{}/v1/lnurl/callback?state={}",
            public_url.trim_end_matches('/'),
            session_id
        ),
        min_sendable: config.lnurl.min_sendable_msat,
        max_sendable: config.lnurl.max_sendable_msat,
        metadata,
    };

    info!("LNURL: discovery served for {} (session {})", name, session_id);
    (StatusCode::OK, Json(response)).into_response()
}

/// Query parameters of the LNURL-pay callback
#[derive(Debug, Deserialize)]
pub struct LnurlCallbackParams {
    /// Amount in millisatoshis, per LUD-06
    pub amount: u64,
    /// Opaque session binding from the discovery response
    pub state: String,
    /// Optional content association
    #[serde(default)]
    pub content_id: u64,
}

/// LNURL-pay callback response
#[derive(Debug, Serialize)]
pub struct LnurlCallbackResponse {
    /// The BOLT11 invoice
    pub pr: String,
    /// Always empty; kept for wallet compatibility
    pub routes: [(); 0],
}

/// Issue an invoice for a wallet-initiated LNURL payment
pub async fn lnurl_pay_callback(
    State(state): State<ApiState>,
    Query(params): Query<LnurlCallbackParams>,
) -> axum::response::Response {
    let app = &state.app;
    let config = &app.config;

    if params.state.is_empty() {
        return (StatusCode::BAD_REQUEST, LnurlError::new("Missing state")).into_response();
    }

    if params.amount < config.lnurl.min_sendable_msat
        || params.amount > config.lnurl.max_sendable_msat
    {
        return (
            StatusCode::BAD_REQUEST,
            LnurlError::new(format!(
                "Amount must be between {} and {} msat",
                config.lnurl.min_sendable_msat, config.lnurl.max_sendable_msat
            )),
        )
            .into_response();
    }

    let amount_sat = params.amount / 1000;
    let description = format!("Payment to {}", config.lnurl.address_name);

    let issued = match app.wallet.create_invoice(amount_sat, &description).await {
        Ok(issued) => issued,
        Err(e) => {
            let (status, _) = error_response::<()>(&e);
            return (status, LnurlError::new(e.to_string())).into_response();
        }
    };

    let kind = if params.content_id == 0 {
        PaymentKind::Tip
    } else {
        PaymentKind::Paywall
    };

    if let Err(e) = PaymentQueries::new(&app.db)
        .add_pending(
            &issued.payment_hash,
            params.content_id,
            &params.state,
            amount_sat,
            kind,
        )
        .await
    {
        let (status, _) = error_response::<()>(&e);
        return (status, LnurlError::new(e.to_string())).into_response();
    }

    info!(
        "LNURL: invoice issued via callback: payment_hash={}, session={}",
        issued.payment_hash, params.state
    );

    (
        StatusCode::OK,
        Json(LnurlCallbackResponse {
            pr: issued.invoice,
            routes: [],
        }),
    )
        .into_response()
}
