use axum::{extract::State, routing::post, Json, Router};
use mandi_finance::{GatewayEvent, Payment};

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
/// Gateway callback. Redelivered and out-of-order callbacks answer 200 with
/// the stored payment so the gateway stops retrying.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    Json(event): Json<GatewayEvent>,
) -> Result<Json<Payment>, AppError> {
    tracing::info!(
        "Received gateway callback: {} for {}",
        event.status,
        event.payment_reference
    );
    let payment = state.payments.handle_gateway_event(event).await?;
    Ok(Json(payment))
}
