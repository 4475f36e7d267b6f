use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use mandi_core::status::OrderStatus;
use mandi_order::{CreateOrder, FulfillmentUpdate, NewOrderItem, Order};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/orders", post(create_order).get(list_orders))
        .route("/v1/orders/{id}", get(get_order))
        .route("/v1/orders/{id}/submit", post(submit_order))
        .route("/v1/orders/{id}/confirm", post(confirm_order))
        .route("/v1/orders/{id}/process", post(start_processing))
        .route("/v1/orders/{id}/cancel", post(cancel_order))
        .route("/v1/orders/{id}/complete", post(complete_order))
        .route("/v1/orders/{id}/status", post(mark_status))
        .route("/v1/orders/{id}/charges", post(set_charges))
        .route("/v1/orders/{id}/items", post(add_item))
        .route("/v1/orders/{id}/items/{item_id}/fulfillment", post(update_fulfillment))
}

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub buyer_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelOrderRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize)]
pub struct ChargesRequest {
    #[serde(default)]
    pub shipping_amount: Decimal,
    #[serde(default)]
    pub discount_amount: Decimal,
}

/// POST /v1/orders
async fn create_order(
    State(state): State<AppState>,
    Json(mut req): Json<CreateOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    if req.currency.trim().is_empty() {
        req.currency = state.rules.default_currency.clone();
    }
    let order = state.orders.create_order(req).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /v1/orders?buyer_id=
async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.orders.list_orders(query.buyer_id).await?))
}

/// GET /v1/orders/{id}
async fn get_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.get_order(order_id).await?))
}

async fn submit_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.submit_order(order_id).await?))
}

async fn confirm_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.confirm_order(order_id).await?))
}

async fn start_processing(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.start_processing(order_id).await?))
}

/// POST /v1/orders/{id}/cancel
/// Body is optional: `{ "reason": "..." }`
async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    body: Option<Json<CancelOrderRequest>>,
) -> Result<Json<Order>, AppError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    Ok(Json(state.orders.cancel_order(order_id, req.reason).await?))
}

async fn complete_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.complete_order(order_id).await?))
}

/// POST /v1/orders/{id}/status
/// Only FAILED, RETURNED and REFUNDED are accepted.
async fn mark_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<MarkStatusRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.mark_status(order_id, req.status).await?))
}

async fn set_charges(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<ChargesRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .set_charges(order_id, req.shipping_amount, req.discount_amount)
        .await?;
    Ok(Json(order))
}

async fn add_item(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(item): Json<NewOrderItem>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.add_item(order_id, item).await?))
}

/// POST /v1/orders/{id}/items/{item_id}/fulfillment
/// `{ "target": "SHIPPED", "quantity": 2 }`; omit `quantity` to move every eligible unit.
async fn update_fulfillment(
    State(state): State<AppState>,
    Path((order_id, item_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<FulfillmentUpdate>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .update_item_fulfillment(order_id, item_id, update)
        .await?;
    Ok(Json(order))
}
