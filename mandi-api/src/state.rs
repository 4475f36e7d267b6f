use std::sync::Arc;

use mandi_core::events::EventPublisher;
use mandi_core::gateway::PaymentGateway;
use mandi_finance::{InMemoryInvoiceRepository, InMemoryPaymentRepository, InvoiceRepository, PaymentOrchestrator, PaymentRepository};
use mandi_order::{InMemoryOrderRepository, OrderManager, OrderRepository};
use mandi_store::app_config::EngineRules;

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderManager>,
    pub payments: Arc<PaymentOrchestrator>,
    pub rules: EngineRules,
}

impl AppState {
    pub fn new(
        order_repo: Arc<dyn OrderRepository>,
        payment_repo: Arc<dyn PaymentRepository>,
        invoice_repo: Arc<dyn InvoiceRepository>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventPublisher>,
        rules: EngineRules,
    ) -> Self {
        let orders = Arc::new(
            OrderManager::new(order_repo, events.clone()).with_conflict_retries(rules.max_conflict_retries),
        );
        let payments = Arc::new(PaymentOrchestrator::new(
            gateway,
            payment_repo,
            invoice_repo,
            orders.clone(),
            events,
            rules.finance_settings(),
        ));
        Self { orders, payments, rules }
    }

    /// Everything kept in process memory; for tests and local runs without Postgres.
    pub fn in_memory(gateway: Arc<dyn PaymentGateway>, events: Arc<dyn EventPublisher>, rules: EngineRules) -> Self {
        Self::new(
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(InMemoryPaymentRepository::new()),
            Arc::new(InMemoryInvoiceRepository::new()),
            gateway,
            events,
            rules,
        )
    }
}
