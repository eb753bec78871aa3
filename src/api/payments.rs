//! Administrative payment endpoints

use super::{error_response, ApiResponse, ApiState, PaginatedResponse, PaginationParams};
use crate::db::{PaymentQueries, PaymentRecord, PaymentStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::info;

/// List all payment records, newest first
pub async fn list_payments(
    State(state): State<ApiState>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let records = match PaymentQueries::new(&state.app.db).list_all().await {
        Ok(records) => records,
        Err(e) => return error_response(&e),
    };

    let total = records.len() as u64;
    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let items: Vec<PaymentRecord> = records
        .into_iter()
        .skip(page_offset(page, per_page))
        .take(per_page as usize)
        .collect();

    (
        StatusCode::OK,
        Json(ApiResponse::success(PaginatedResponse::new(
            items, total, page, per_page,
        ))),
    )
}

/// Item offset for a 1-based page. Saturating: caller-supplied page
/// numbers near `u32::MAX` must not overflow the multiplication.
fn page_offset(page: u32, per_page: u32) -> usize {
    (page as usize)
        .saturating_sub(1)
        .saturating_mul(per_page as usize)
}

/// Refund request response
#[derive(Debug, Serialize)]
pub struct RefundResponse {
    /// Payment hash of the refunded payment
    pub payment_hash: String,
    /// Status after the refund request
    pub status: PaymentStatus,
}

/// Request a refund for a paid payment.
///
/// Moves the payment Paid → RefundPending; the wallet daemon's
/// `payment_refunded` event completes the path to Refunded. Refunding a
/// payment that is not Paid is a conflict, and an unknown hash is not found.
pub async fn request_refund(
    State(state): State<ApiState>,
    Path(payment_hash): Path<String>,
) -> impl IntoResponse {
    match PaymentQueries::new(&state.app.db)
        .mark_refund_pending(&payment_hash)
        .await
    {
        Ok(record) => {
            info!("API: refund requested for payment {}", record.payment_hash);
            (
                StatusCode::OK,
                Json(ApiResponse::success(RefundResponse {
                    payment_hash: record.payment_hash,
                    status: record.status,
                })),
            )
        }
        Err(e) => error_response(&e),
    }
}
