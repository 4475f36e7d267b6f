use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mandi_finance::{CapturePaymentRequest, Payment, PaymentRefund, RefundRequestInput};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders/{id}/payments", post(request_payment).get(list_payments))
        .route("/v1/payments/{id}", get(get_payment))
        .route("/v1/payments/{id}/refunds", post(request_refund))
        .route("/v1/payments/{id}/refunds/{refund_id}/approve", post(approve_refund))
        .route("/v1/payments/{id}/refunds/{refund_id}/reject", post(reject_refund))
        .route("/v1/payments/{id}/refunds/{refund_id}/cancel", post(cancel_refund))
        .route("/v1/payments/{id}/refunds/{refund_id}/process", post(process_refund))
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub refund: PaymentRefund,
    pub payment: Payment,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveRefundRequest {
    pub approved_by: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRefundRequest {
    pub reason: String,
}

fn refund_response(payment: Payment, refund_id: Uuid) -> Result<Json<RefundResponse>, AppError> {
    let refund = payment
        .refund(refund_id)
        .map_err(mandi_core::CoreError::from)?
        .clone();
    Ok(Json(RefundResponse { refund, payment }))
}

/// POST /v1/orders/{id}/payments
/// Starts collection through the gateway. Retrying with the same
/// `payment_reference` never charges twice.
async fn request_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<CapturePaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let payment = state.payments.request_payment(order_id, req).await?;
    Ok((StatusCode::ACCEPTED, Json(payment)))
}

async fn list_payments(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, AppError> {
    Ok(Json(state.payments.list_payments(order_id).await?))
}

/// GET /v1/payments/{id}
async fn get_payment(State(state): State<AppState>, Path(payment_id): Path<Uuid>) -> Result<Json<Payment>, AppError> {
    Ok(Json(state.payments.get_payment(payment_id).await?))
}

/// POST /v1/payments/{id}/refunds
async fn request_refund(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<RefundRequestInput>,
) -> Result<(StatusCode, Json<RefundResponse>), AppError> {
    let (payment, refund_id) = state.payments.request_refund(payment_id, req).await?;
    Ok((StatusCode::CREATED, refund_response(payment, refund_id)?))
}

async fn approve_refund(
    State(state): State<AppState>,
    Path((payment_id, refund_id)): Path<(Uuid, Uuid)>,
    body: Option<Json<ApproveRefundRequest>>,
) -> Result<Json<RefundResponse>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let payment = state
        .payments
        .approve_refund(payment_id, refund_id, req.approved_by)
        .await?;
    refund_response(payment, refund_id)
}

async fn reject_refund(
    State(state): State<AppState>,
    Path((payment_id, refund_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RejectRefundRequest>,
) -> Result<Json<RefundResponse>, AppError> {
    let payment = state
        .payments
        .reject_refund(payment_id, refund_id, &req.reason)
        .await?;
    refund_response(payment, refund_id)
}

async fn cancel_refund(
    State(state): State<AppState>,
    Path((payment_id, refund_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RefundResponse>, AppError> {
    let payment = state.payments.cancel_refund(payment_id, refund_id).await?;
    refund_response(payment, refund_id)
}

/// POST /v1/payments/{id}/refunds/{refund_id}/process
/// A gateway timeout answers 502 and leaves the refund PROCESSING; call
/// again to retry.
async fn process_refund(
    State(state): State<AppState>,
    Path((payment_id, refund_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<RefundResponse>, AppError> {
    let payment = state.payments.process_refund(payment_id, refund_id).await?;
    refund_response(payment, refund_id)
}
