use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use mandi_core::status::InvoiceStatus;
use mandi_finance::{Invoice, SubscriptionCharge, TaxContext};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/payments/{id}/invoice", post(invoice_payment))
        .route("/v1/payments/{id}/refunds/{refund_id}/credit-note", post(credit_note))
        .route("/v1/subscriptions/invoice", post(invoice_subscription))
        .route("/v1/invoices/{id}", get(get_invoice))
        .route("/v1/invoices/{id}/status", post(update_status))
}

/// Tax details supplied by the caller; the configured GST rate applies
/// when `gst_rate` is omitted.
#[derive(Debug, Deserialize)]
pub struct TaxRequest {
    pub vendor_state: String,
    pub buyer_state: String,
    pub gst_rate: Option<Decimal>,
    #[serde(default)]
    pub amount_includes_tax: bool,
    pub company_id: Option<Uuid>,
}

impl TaxRequest {
    fn context(&self, default_rate: Decimal) -> TaxContext {
        TaxContext {
            vendor_state: self.vendor_state.clone(),
            buyer_state: self.buyer_state.clone(),
            gst_rate: self.gst_rate.unwrap_or(default_rate),
            amount_includes_tax: self.amount_includes_tax,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionInvoiceRequest {
    #[serde(flatten)]
    pub charge: SubscriptionCharge,
    pub vendor_state: String,
    pub buyer_state: String,
    pub gst_rate: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct InvoiceStatusRequest {
    pub status: InvoiceStatus,
}

#[derive(Debug, Serialize)]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub overdue: bool,
}

impl From<Invoice> for InvoiceResponse {
    fn from(invoice: Invoice) -> Self {
        let overdue = invoice.is_overdue(Utc::now().date_naive());
        Self { invoice, overdue }
    }
}

/// POST /v1/payments/{id}/invoice
async fn invoice_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(req): Json<TaxRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    let tax = req.context(state.rules.gst_rate());
    let invoice = state.payments.invoice_payment(payment_id, tax, req.company_id).await?;
    Ok((StatusCode::CREATED, Json(invoice.into())))
}

/// POST /v1/payments/{id}/refunds/{refund_id}/credit-note
async fn credit_note(
    State(state): State<AppState>,
    Path((payment_id, refund_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<TaxRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    let tax = req.context(state.rules.gst_rate());
    let note = state
        .payments
        .invoice_refund(payment_id, refund_id, tax, req.company_id)
        .await?;
    Ok((StatusCode::CREATED, Json(note.into())))
}

/// POST /v1/subscriptions/invoice
async fn invoice_subscription(
    State(state): State<AppState>,
    Json(req): Json<SubscriptionInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    let tax = TaxContext {
        vendor_state: req.vendor_state,
        buyer_state: req.buyer_state,
        gst_rate: req.gst_rate.unwrap_or_else(|| state.rules.gst_rate()),
        amount_includes_tax: false,
    };
    let invoice = state.payments.invoice_subscription(req.charge, tax).await?;
    Ok((StatusCode::CREATED, Json(invoice.into())))
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    Ok(Json(state.payments.get_invoice(invoice_id).await?.into()))
}

async fn update_status(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(req): Json<InvoiceStatusRequest>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let invoice = state
        .payments
        .update_invoice_status(invoice_id, req.status)
        .await?;
    Ok(Json(invoice.into()))
}
