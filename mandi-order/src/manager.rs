use std::sync::Arc;

use chrono::Utc;
use mandi_core::events::EventPublisher;
use mandi_core::status::OrderStatus;
use mandi_core::{CoreError, CoreResult};
use mandi_shared::events::{OrderConfirmedEvent, OrderStatusChangedEvent};
use mandi_shared::DomainEvent;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::changes::ChangeHandler;
use crate::fulfillment::FulfillmentUpdate;
use crate::models::{CreateOrder, NewOrderItem, Order, OrderError};
use crate::repository::OrderRepository;

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// One read-modify-write of an order. Mutations happen on a private copy;
/// [`commit`](Self::commit) recomputes, verifies and writes it back under
/// a version check. Dropping the unit without committing discards every
/// change.
pub struct OrderUnitOfWork {
    repo: Arc<dyn OrderRepository>,
    expected_version: i64,
    order: Order,
}

impl OrderUnitOfWork {
    pub async fn begin(repo: Arc<dyn OrderRepository>, order_id: Uuid) -> CoreResult<Self> {
        let order = repo
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))?;
        Ok(Self {
            repo,
            expected_version: order.version,
            order,
        })
    }

    pub fn order(&self) -> &Order {
        &self.order
    }

    pub fn order_mut(&mut self) -> &mut Order {
        &mut self.order
    }

    pub async fn commit(mut self) -> CoreResult<Order> {
        if let Err(e) = self.order.recompute() {
            if let OrderError::Invariant(msg) = &e {
                error!("Refusing to persist order {}: {}", self.order.id, msg);
            }
            return Err(e.into());
        }
        self.order.version = self.expected_version + 1;
        self.order.updated_at = Utc::now();
        self.repo.save(&self.order, self.expected_version).await?;
        Ok(self.order)
    }
}

/// Manages order lifecycle and state transitions
pub struct OrderManager {
    repo: Arc<dyn OrderRepository>,
    events: Arc<dyn EventPublisher>,
    max_conflict_retries: u32,
}

impl OrderManager {
    pub fn new(repo: Arc<dyn OrderRepository>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            repo,
            events,
            max_conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub async fn create_order(&self, request: CreateOrder) -> CoreResult<Order> {
        let order = Order::create(request)?;
        self.repo.insert(&order).await?;
        info!(
            "Created order {} for buyer {} ({} {})",
            order.order_number, order.buyer_id, order.total_amount, order.currency
        );
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.repo
            .get(order_id)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))
    }

    pub async fn list_orders(&self, buyer_id: Uuid) -> CoreResult<Vec<Order>> {
        self.repo.list_by_buyer(buyer_id).await
    }

    /// Runs `mutate` inside a unit of work, retrying from a fresh read when
    /// another writer got there first. `mutate` may run more than once.
    pub async fn execute<T, F>(&self, order_id: Uuid, mut mutate: F) -> CoreResult<(Order, T)>
    where
        F: FnMut(&mut Order) -> Result<T, OrderError> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let mut unit = OrderUnitOfWork::begin(self.repo.clone(), order_id).await?;
            let original = unit.order().clone();

            let outcome = match mutate(unit.order_mut()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Order {} change rejected: {}", order_id, e);
                    return Err(e.into());
                }
            };

            // Nothing to write, e.g. a capture that was already applied.
            if unit.order() == &original {
                return Ok((original, outcome));
            }

            match unit.commit().await {
                Ok(order) => {
                    self.publish_status_change(original.status, &order);
                    return Ok((order, outcome));
                }
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        "Order {} modified concurrently, retrying ({}/{})",
                        order_id, attempt, self.max_conflict_retries
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish_status_change(&self, previous: OrderStatus, order: &Order) {
        if previous == order.status {
            return;
        }
        info!(
            "Order {} moved from {} to {}",
            order.order_number, previous, order.status
        );
        let now = Utc::now();
        self.events.publish(DomainEvent::OrderStatusChanged(OrderStatusChangedEvent {
            order_id: order.id,
            from: previous.to_string(),
            to: order.status.to_string(),
            occurred_at: now,
        }));
        if order.status == OrderStatus::Confirmed {
            self.events.publish(DomainEvent::OrderConfirmed(OrderConfirmedEvent {
                order_id: order.id,
                order_number: order.order_number.clone(),
                buyer_id: order.buyer_id,
                total: order.total_amount,
                currency: order.currency.clone(),
                occurred_at: now,
            }));
        }
    }

    async fn apply<F>(&self, order_id: Uuid, mutate: F) -> CoreResult<Order>
    where
        F: FnMut(&mut Order) -> Result<(), OrderError> + Send,
    {
        self.execute(order_id, mutate).await.map(|(order, _)| order)
    }

    /// Transition: Draft → Pending
    pub async fn submit_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.apply(order_id, ChangeHandler::submit).await
    }

    /// Transition: Pending → Confirmed
    pub async fn confirm_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.apply(order_id, ChangeHandler::confirm).await
    }

    /// Transition: Confirmed → Processing
    pub async fn start_processing(&self, order_id: Uuid) -> CoreResult<Order> {
        self.apply(order_id, ChangeHandler::start_processing).await
    }

    pub async fn update_item_fulfillment(
        &self,
        order_id: Uuid,
        item_id: Uuid,
        update: FulfillmentUpdate,
    ) -> CoreResult<Order> {
        self.apply(order_id, |order| ChangeHandler::update_fulfillment(order, item_id, update))
            .await
    }

    pub async fn cancel_item_units(&self, order_id: Uuid, item_id: Uuid, quantity: u32) -> CoreResult<Order> {
        self.apply(order_id, |order| ChangeHandler::cancel_item_units(order, item_id, quantity))
            .await
    }

    pub async fn cancel_order(&self, order_id: Uuid, reason: Option<String>) -> CoreResult<Order> {
        self.apply(order_id, |order| ChangeHandler::cancel(order, reason.clone()))
            .await
    }

    pub async fn add_item(&self, order_id: Uuid, item: NewOrderItem) -> CoreResult<Order> {
        self.apply(order_id, |order| {
            ChangeHandler::add_item(order, item.clone()).map(|_| ())
        })
        .await
    }

    pub async fn set_charges(&self, order_id: Uuid, shipping: Decimal, discount: Decimal) -> CoreResult<Order> {
        self.apply(order_id, |order| ChangeHandler::set_charges(order, shipping, discount))
            .await
    }

    pub async fn complete_order(&self, order_id: Uuid) -> CoreResult<Order> {
        self.apply(order_id, ChangeHandler::complete).await
    }

    /// Explicit moves to FAILED, RETURNED or REFUNDED. Forward fulfillment
    /// statuses are reached through item updates instead.
    pub async fn mark_status(&self, order_id: Uuid, status: OrderStatus) -> CoreResult<Order> {
        if !matches!(
            status,
            OrderStatus::Failed | OrderStatus::Returned | OrderStatus::Refunded
        ) {
            return Err(mandi_core::ValidationError::Invalid(format!(
                "{} cannot be set directly",
                status
            ))
            .into());
        }
        self.apply(order_id, |order| ChangeHandler::transition(order, status))
            .await
    }

    /// Credits a captured payment to the order. Safe to repeat with the
    /// same reference.
    pub async fn apply_capture(
        &self,
        order_id: Uuid,
        payment_id: Uuid,
        reference: &str,
        amount: Decimal,
    ) -> CoreResult<(Order, bool)> {
        self.execute(order_id, |order| {
            ChangeHandler::apply_capture(order, payment_id, reference, amount)
        })
        .await
    }

    pub async fn apply_refund(
        &self,
        order_id: Uuid,
        payment_id: Uuid,
        reference: &str,
        amount: Decimal,
    ) -> CoreResult<(Order, bool)> {
        self.execute(order_id, |order| {
            ChangeHandler::apply_refund(order, payment_id, reference, amount)
        })
        .await
    }

    pub async fn apply_chargeback(&self, order_id: Uuid, payment_id: Uuid, reference: &str) -> CoreResult<(Order, bool)> {
        self.execute(order_id, |order| {
            ChangeHandler::apply_chargeback(order, payment_id, reference)
        })
        .await
    }
}
