use std::collections::HashMap;

use async_trait::async_trait;
use mandi_core::{CoreError, CoreResult};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Invoice, InvoiceSource, Payment};

/// Storage port for the payment aggregate (payment plus its refunds).
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Fails with a conflict when the payment reference is already taken.
    async fn insert(&self, payment: &Payment) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Payment>>;

    async fn get_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>>;

    /// Version-checked write, see `OrderRepository::save`.
    async fn save(&self, payment: &Payment, expected_version: i64) -> CoreResult<()>;

    async fn list_by_order(&self, order_id: Uuid) -> CoreResult<Vec<Payment>>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Stores a new invoice unless one already exists for its source, in
    /// which case the stored invoice is returned instead.
    async fn insert_if_absent(&self, invoice: &Invoice) -> CoreResult<Invoice>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<Invoice>>;

    async fn find_by_source(&self, source: InvoiceSource) -> CoreResult<Option<Invoice>>;

    async fn update_status(&self, invoice: &Invoice) -> CoreResult<()>;
}

#[derive(Default)]
pub struct InMemoryPaymentRepository {
    payments: RwLock<HashMap<Uuid, Payment>>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert(&self, payment: &Payment) -> CoreResult<()> {
        let mut payments = self.payments.write().await;
        if payments
            .values()
            .any(|p| p.id == payment.id || p.payment_reference == payment.payment_reference)
        {
            return Err(CoreError::conflict("payment", &payment.payment_reference));
        }
        payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Payment>> {
        Ok(self.payments.read().await.get(&id).cloned())
    }

    async fn get_by_reference(&self, reference: &str) -> CoreResult<Option<Payment>> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.payment_reference == reference)
            .cloned())
    }

    async fn save(&self, payment: &Payment, expected_version: i64) -> CoreResult<()> {
        let mut payments = self.payments.write().await;
        let stored = payments
            .get_mut(&payment.id)
            .ok_or_else(|| CoreError::not_found("payment", payment.id))?;
        if stored.version != expected_version {
            return Err(CoreError::conflict("payment", payment.id));
        }
        *stored = payment.clone();
        Ok(())
    }

    async fn list_by_order(&self, order_id: Uuid) -> CoreResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut matching: Vec<Payment> = payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.created_at);
        Ok(matching)
    }
}

#[derive(Default)]
pub struct InMemoryInvoiceRepository {
    invoices: RwLock<HashMap<Uuid, Invoice>>,
}

impl InMemoryInvoiceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn insert_if_absent(&self, invoice: &Invoice) -> CoreResult<Invoice> {
        let mut invoices = self.invoices.write().await;
        if let Some(existing) = invoices.values().find(|i| i.source == invoice.source) {
            return Ok(existing.clone());
        }
        invoices.insert(invoice.id, invoice.clone());
        Ok(invoice.clone())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<Invoice>> {
        Ok(self.invoices.read().await.get(&id).cloned())
    }

    async fn find_by_source(&self, source: InvoiceSource) -> CoreResult<Option<Invoice>> {
        Ok(self
            .invoices
            .read()
            .await
            .values()
            .find(|i| i.source == source)
            .cloned())
    }

    async fn update_status(&self, invoice: &Invoice) -> CoreResult<()> {
        let mut invoices = self.invoices.write().await;
        let stored = invoices
            .get_mut(&invoice.id)
            .ok_or_else(|| CoreError::not_found("invoice", invoice.id))?;
        stored.status = invoice.status;
        stored.paid_at = invoice.paid_at;
        stored.updated_at = invoice.updated_at;
        Ok(())
    }
}
