use std::collections::HashMap;

use async_trait::async_trait;
use mandi_core::{CoreError, CoreResult};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::Order;

/// Storage port for the order aggregate. Orders are always read and
/// written whole, items and payment ledger included.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn insert(&self, order: &Order) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>>;

    /// Writes `order` only if the stored copy is still at
    /// `expected_version`. Otherwise fails with [`CoreError::Conflict`].
    async fn save(&self, order: &Order, expected_version: i64) -> CoreResult<()>;

    async fn list_by_buyer(&self, buyer_id: Uuid) -> CoreResult<Vec<Order>>;
}

/// Process-local order store used by tests and database-less runs.
#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> CoreResult<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(CoreError::conflict("order", order.id));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Order>> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn save(&self, order: &Order, expected_version: i64) -> CoreResult<()> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(&order.id)
            .ok_or_else(|| CoreError::not_found("order", order.id))?;
        if stored.version != expected_version {
            return Err(CoreError::conflict("order", order.id));
        }
        *stored = order.clone();
        Ok(())
    }

    async fn list_by_buyer(&self, buyer_id: Uuid) -> CoreResult<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| o.buyer_id == buyer_id)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.created_at);
        Ok(matching)
    }
}
