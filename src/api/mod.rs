//! HTTP API for the paywall service
//!
//! This module provides the outward-facing surface:
//! - Invoice creation (session-cookie bound, idempotent, rate limited)
//! - Webhook intake for settlement notifications
//! - A server-sent-event stream pushing "paid" transitions to the browser
//! - LNURL-pay discovery for wallet-initiated payments
//! - Access checks and administrative payment listing

use crate::{PaywallApp, PaywallError};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::info;

mod health;
mod invoices;
mod lnurl;
mod payments;
mod stream;
mod webhook;

pub use health::*;
pub use invoices::*;
pub use lnurl::*;
pub use payments::*;
pub use stream::*;
pub use webhook::*;

/// Name of the first-party session cookie
pub const SESSION_COOKIE: &str = "ln_session";

/// Maximum accepted webhook/request body size (64 KiB)
const MAX_BODY_BYTES: usize = 64 * 1024;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The paywall application
    pub app: PaywallApp,
}

/// Build the API router
fn build_router(app: PaywallApp) -> Router {
    let state = ApiState { app };

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Invoice creation
        .route("/v1/invoices", post(create_invoice))
        // Realtime payment stream
        .route("/v1/payments/stream", get(payment_stream))
        // Access gate
        .route("/v1/access/:content_id", get(check_access))
        // Administrative listing and refunds
        .route("/v1/payments", get(list_payments))
        .route("/v1/payments/:payment_hash/refund", post(request_refund))
        // Settlement webhook
        .route("/v1/webhook/payment", post(handle_payment_webhook))
        // LNURL-pay
        .route("/.well-known/lnurlp/:name", get(lnurl_pay_discovery))
        .route("/v1/lnurl/callback", get(lnurl_pay_callback))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Start the HTTP API server
pub async fn serve(app: PaywallApp) -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    // Keep the sender alive so the shutdown signal never fires
    std::mem::forget(tx);
    serve_with_shutdown(app, rx).await
}

/// Start the HTTP API server with graceful shutdown
pub async fn serve_with_shutdown(
    app: PaywallApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();

    let router = build_router(app);

    let router = if config.api.enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };

    let addr: SocketAddr = config
        .api
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
        info!("Received shutdown signal, stopping API server...");
    })
    .await?;

    info!("API server stopped gracefully");
    Ok(())
}

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (only present if success is true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (only present if success is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert PaywallError to HTTP status code
pub fn error_to_status_code(err: &PaywallError) -> StatusCode {
    match err {
        PaywallError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PaywallError::Conflict(_) => StatusCode::CONFLICT,
        PaywallError::NotFound(_) => StatusCode::NOT_FOUND,
        PaywallError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PaywallError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PaywallError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Shorthand for an error response tuple
pub(crate) fn error_response<T>(err: &PaywallError) -> (StatusCode, Json<ApiResponse<T>>) {
    (error_to_status_code(err), Json(ApiResponse::error(err.to_string())))
}

/// Extract the session id from the request's cookie header, if present
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == SESSION_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Generate a fresh opaque session identifier
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Build the Set-Cookie value binding the session to this browser.
///
/// HttpOnly, Secure and SameSite=Strict: the cookie is a paywall session
/// binding, never an authentication credential.
pub fn session_cookie_value(session_id: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict; Max-Age=31536000",
        SESSION_COOKIE, session_id
    )
}

/// Pagination parameters
#[derive(Debug, Deserialize)]
pub struct PaginationParams {
    /// Page number (1-based)
    #[serde(default = "default_page")]
    pub page: u32,
    /// Items per page
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// Paginated response
#[derive(Debug, Serialize)]
pub struct PaginatedResponse<T> {
    /// Items for this page
    pub items: Vec<T>,
    /// Total number of items
    pub total: u64,
    /// Current page
    pub page: u32,
    /// Items per page
    pub per_page: u32,
    /// Total pages
    pub total_pages: u32,
}

impl<T> PaginatedResponse<T> {
    /// Create a paginated response
    pub fn new(items: Vec<T>, total: u64, page: u32, per_page: u32) -> Self {
        let total_pages = ((total as f64) / (per_page as f64)).ceil() as u32;
        Self {
            items,
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    #[test]
    fn test_session_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "other=1; ln_session=abc123; theme=dark".parse().unwrap());
        assert_eq!(session_from_headers(&headers), Some("abc123".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "other=1".parse().unwrap());
        assert_eq!(session_from_headers(&headers), None);

        assert_eq!(session_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_new_session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let value = session_cookie_value("abc");
        assert!(value.starts_with("ln_session=abc;"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=Strict"));
    }
}
