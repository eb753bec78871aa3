//! Health check endpoint

use super::{ApiResponse, ApiState};
use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" when the wallet daemon is connected, "degraded" otherwise
    pub status: String,
    /// Whether the wallet daemon connection is up
    pub wallet_connected: bool,
    /// Crate version
    pub version: String,
}

/// Report service health.
///
/// Always 200: a degraded wallet connection still serves access checks and
/// the realtime stream, so load balancers should not pull the instance.
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let wallet_connected = state.app.wallet.is_connected();
    let status = if wallet_connected { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(ApiResponse::success(HealthResponse {
            status: status.to_string(),
            wallet_connected,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
    )
}
