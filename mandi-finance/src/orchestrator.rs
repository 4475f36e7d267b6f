use std::sync::Arc;

use chrono::Utc;
use mandi_core::events::EventPublisher;
use mandi_core::gateway::{ChargeRequest, PaymentGateway, RefundDecision, RefundRequest};
use mandi_core::status::{InvoiceStatus, PaymentStatus, RefundStatus};
use mandi_core::{CoreError, CoreResult, ValidationError};
use mandi_order::OrderManager;
use mandi_shared::events::{InvoiceGeneratedEvent, PaymentStatusEvent, RefundCompletedEvent};
use mandi_shared::DomainEvent;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::invoice::InvoiceGenerator;
use crate::models::{
    CapturePaymentRequest, FeeSchedule, GatewayEvent, Invoice, InvoiceSource, Payment, RefundRequestInput,
    SubscriptionCharge, TaxContext,
};
use crate::payment::{EventOutcome, PaymentError};
use crate::repository::{InvoiceRepository, PaymentRepository};

#[derive(Debug, Clone, Copy)]
pub struct FinanceSettings {
    pub fee_schedule: FeeSchedule,
    pub payment_terms_days: i64,
    pub max_conflict_retries: u32,
}

impl Default for FinanceSettings {
    fn default() -> Self {
        Self {
            fee_schedule: FeeSchedule::default(),
            payment_terms_days: 30,
            max_conflict_retries: 3,
        }
    }
}

/// Drives payments, refunds and invoices, and keeps the order ledger in
/// step with them.
pub struct PaymentOrchestrator {
    gateway: Arc<dyn PaymentGateway>,
    payments: Arc<dyn PaymentRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    orders: Arc<OrderManager>,
    events: Arc<dyn EventPublisher>,
    generator: InvoiceGenerator,
    settings: FinanceSettings,
}

impl PaymentOrchestrator {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        payments: Arc<dyn PaymentRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        orders: Arc<OrderManager>,
        events: Arc<dyn EventPublisher>,
        settings: FinanceSettings,
    ) -> Self {
        Self {
            gateway,
            payments,
            invoices,
            orders,
            events,
            generator: InvoiceGenerator::new(settings.payment_terms_days),
            settings,
        }
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> CoreResult<Payment> {
        self.payments
            .get(payment_id)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", payment_id))
    }

    pub async fn list_payments(&self, order_id: Uuid) -> CoreResult<Vec<Payment>> {
        self.payments.list_by_order(order_id).await
    }

    /// Load, mutate a copy, recompute and write back under the version
    /// check, retrying on conflicts. Unchanged payments are not written.
    async fn execute<T, F>(&self, payment_id: Uuid, mut mutate: F) -> CoreResult<(Payment, T)>
    where
        F: FnMut(&mut Payment) -> Result<T, PaymentError> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let current = self.get_payment(payment_id).await?;
            let mut working = current.clone();

            let outcome = match mutate(&mut working) {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Payment {} change rejected: {}", current.payment_reference, e);
                    return Err(e.into());
                }
            };
            if working == current {
                return Ok((current, outcome));
            }

            if let Err(e) = working.recompute() {
                error!("Refusing to persist payment {}: {}", current.payment_reference, e);
                return Err(e.into());
            }
            working.version = current.version + 1;
            working.updated_at = Utc::now();

            match self.payments.save(&working, current.version).await {
                Ok(()) => return Ok((working, outcome)),
                Err(e) if e.is_conflict() && attempt < self.settings.max_conflict_retries => {
                    attempt += 1;
                    warn!(
                        "Payment {} modified concurrently, retrying ({}/{})",
                        current.payment_reference, attempt, self.settings.max_conflict_retries
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a payment for the order and hands it to the gateway.
    /// Repeating the call with the same `payment_reference` resumes the
    /// existing payment instead of charging twice.
    pub async fn request_payment(&self, order_id: Uuid, request: CapturePaymentRequest) -> CoreResult<Payment> {
        let existing = match request.payment_reference.as_deref() {
            Some(reference) => self.payments.get_by_reference(reference).await?,
            None => None,
        };

        let payment = match existing {
            Some(payment) if payment.order_id != order_id => {
                return Err(ValidationError::Invalid(format!(
                    "payment reference {} belongs to another order",
                    payment.payment_reference
                ))
                .into());
            }
            Some(payment) if payment.status != PaymentStatus::Pending => {
                debug!("Payment {} already {}", payment.payment_reference, payment.status);
                return Ok(payment);
            }
            Some(payment) => payment,
            None => {
                let order = self.orders.get_order(order_id).await?;
                if !order.status.accepts_payment() {
                    return Err(ValidationError::GuardFailed {
                        to: "payment".to_string(),
                        reason: format!("order {} is {}", order.order_number, order.status),
                    }
                    .into());
                }
                if request.amount > order.outstanding_amount {
                    return Err(ValidationError::AmountExceeded {
                        requested: request.amount,
                        available: order.outstanding_amount,
                    }
                    .into());
                }
                let payment = Payment::new(
                    order.id,
                    request.amount,
                    &order.currency,
                    request.method,
                    request.payment_reference.clone(),
                    request.method_details.clone(),
                    &self.settings.fee_schedule,
                )?;
                self.payments.insert(&payment).await?;
                info!(
                    "Created payment {} for order {} ({} {})",
                    payment.payment_reference, order.order_number, payment.amount, payment.currency
                );
                payment
            }
        };

        let charge = ChargeRequest {
            payment_reference: payment.payment_reference.clone(),
            order_id,
            amount: payment.amount,
            currency: payment.currency.clone(),
            method: payment.method,
        };
        let receipt = match self.gateway.initiate(&charge).await {
            Ok(receipt) => receipt,
            // The payment stays PENDING under its reference; the caller
            // needs that reference to resume instead of paying twice.
            Err(e) => {
                error!("Gateway initiate failed for {}: {}", payment.payment_reference, e);
                return Err(CoreError::External(format!(
                    "{}; retry with payment_reference {}",
                    e, payment.payment_reference
                )));
            }
        };

        let txn = receipt.gateway_transaction_id.clone();
        let (payment, _) = self
            .execute(payment.id, |p| {
                if p.status == PaymentStatus::Pending {
                    p.mark_initiated(txn.clone())?;
                }
                Ok(())
            })
            .await?;

        if receipt.status.progress_rank() > PaymentStatus::Initiated.progress_rank() {
            return self
                .handle_gateway_event(GatewayEvent {
                    payment_reference: payment.payment_reference.clone(),
                    status: receipt.status,
                    amount: payment.amount,
                    gateway_transaction_id: Some(receipt.gateway_transaction_id),
                    fees: None,
                    failure_reason: None,
                })
                .await;
        }
        Ok(payment)
    }

    /// Applies a gateway status report. Redelivered and out-of-date reports
    /// return the stored payment; financial effects happen at most once.
    pub async fn handle_gateway_event(&self, event: GatewayEvent) -> CoreResult<Payment> {
        let stored = self
            .payments
            .get_by_reference(&event.payment_reference)
            .await?
            .ok_or_else(|| CoreError::not_found("payment", &event.payment_reference))?;

        let (payment, outcome) = self
            .execute(stored.id, |p| p.apply_gateway_event(&event))
            .await?;

        match outcome {
            EventOutcome::Duplicate | EventOutcome::Stale => {
                warn!(
                    "Ignoring {:?} {} event for payment {} (currently {})",
                    outcome, event.status, payment.payment_reference, payment.status
                );
                // A crash between the payment write and the ledger write
                // is repaired by the redelivery.
                if payment.status.is_collected() && payment.status != PaymentStatus::Chargeback {
                    self.credit_order(&payment).await?;
                }
            }
            EventOutcome::Applied { from } => {
                info!(
                    "Payment {} moved from {} to {}",
                    payment.payment_reference, from, payment.status
                );
                self.apply_side_effects(&payment, from).await?;
            }
        }
        Ok(payment)
    }

    async fn apply_side_effects(&self, payment: &Payment, from: PaymentStatus) -> CoreResult<()> {
        match payment.status {
            PaymentStatus::Captured | PaymentStatus::Settled => {
                // A report can jump straight past CAPTURED; the credit is
                // idempotent per reference either way.
                self.credit_order(payment).await?;
                if from.progress_rank() < PaymentStatus::Captured.progress_rank() {
                    self.events.publish(DomainEvent::PaymentCaptured(payment_event(payment)));
                }
                if payment.status == PaymentStatus::Settled {
                    self.events.publish(DomainEvent::PaymentSettled(payment_event(payment)));
                }
            }
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Expired => {
                self.events.publish(DomainEvent::PaymentFailed(payment_event(payment)));
            }
            PaymentStatus::Chargeback => {
                let reference = format!("CBK-{}", payment.payment_reference);
                self.orders
                    .apply_chargeback(payment.order_id, payment.id, &reference)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn credit_order(&self, payment: &Payment) -> CoreResult<()> {
        match self
            .orders
            .apply_capture(payment.order_id, payment.id, &payment.payment_reference, payment.amount)
            .await
        {
            Ok((order, applied)) => {
                if applied {
                    info!(
                        "Order {} credited {} from {}, outstanding {}",
                        order.order_number, payment.amount, payment.payment_reference, order.outstanding_amount
                    );
                }
                Ok(())
            }
            // The money is with us either way; the payment keeps its status
            // and the excess has to go back through a refund.
            Err(CoreError::Validation(e)) => {
                error!(
                    "Captured payment {} could not be applied to order {}: {}",
                    payment.payment_reference, payment.order_id, e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn request_refund(&self, payment_id: Uuid, input: RefundRequestInput) -> CoreResult<(Payment, Uuid)> {
        let (payment, (refund_id, created)) = self
            .execute(payment_id, |p| Ok(p.request_refund(&input)?))
            .await?;
        if created {
            info!(
                "Refund of {} requested on payment {}",
                input.amount, payment.payment_reference
            );
        }
        Ok((payment, refund_id))
    }

    pub async fn approve_refund(&self, payment_id: Uuid, refund_id: Uuid, approver: Option<Uuid>) -> CoreResult<Payment> {
        let (payment, _) = self
            .execute(payment_id, |p| Ok(p.approve_refund(refund_id, approver)?))
            .await?;
        info!("Refund {} approved on payment {}", refund_id, payment.payment_reference);
        Ok(payment)
    }

    pub async fn reject_refund(&self, payment_id: Uuid, refund_id: Uuid, reason: &str) -> CoreResult<Payment> {
        let (payment, _) = self
            .execute(payment_id, |p| Ok(p.reject_refund(refund_id, reason)?))
            .await?;
        Ok(payment)
    }

    pub async fn cancel_refund(&self, payment_id: Uuid, refund_id: Uuid) -> CoreResult<Payment> {
        let (payment, _) = self
            .execute(payment_id, |p| Ok(p.cancel_refund(refund_id)?))
            .await?;
        Ok(payment)
    }

    /// Sends an approved refund to the gateway. A transport failure leaves
    /// the refund PROCESSING; calling again retries with the same reference.
    pub async fn process_refund(&self, payment_id: Uuid, refund_id: Uuid) -> CoreResult<Payment> {
        let current = self.get_payment(payment_id).await?;
        let refund = current.refund(refund_id)?.clone();
        if refund.status == RefundStatus::Completed {
            self.debit_order(&current, refund_id).await?;
            return Ok(current);
        }

        let (payment, _) = self
            .execute(payment_id, |p| Ok(p.begin_refund_processing(refund_id)?))
            .await?;

        let request = RefundRequest {
            payment_reference: payment.payment_reference.clone(),
            refund_reference: refund.refund_reference.clone(),
            gateway_transaction_id: payment.gateway_transaction_id.clone(),
            amount: refund.amount,
            currency: payment.currency.clone(),
        };
        let decision = match self.gateway.refund(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    "Gateway refund {} failed, left PROCESSING: {}",
                    refund.refund_reference, e
                );
                return Err(e.into());
            }
        };

        match decision {
            RefundDecision::Succeeded { gateway_refund_id } => {
                let (payment, completed) = self
                    .execute(payment_id, |p| Ok(p.complete_refund(refund_id, Some(gateway_refund_id.clone()))?))
                    .await?;
                self.debit_order(&payment, refund_id).await?;
                if completed {
                    info!(
                        "Refund {} completed, {} left refundable on {}",
                        refund.refund_reference, payment.refundable_amount, payment.payment_reference
                    );
                    self.events.publish(DomainEvent::RefundCompleted(RefundCompletedEvent {
                        refund_id,
                        payment_id,
                        order_id: payment.order_id,
                        refund_reference: refund.refund_reference.clone(),
                        amount: refund.amount,
                        remaining_refundable: payment.refundable_amount,
                        occurred_at: Utc::now(),
                    }));
                }
                Ok(payment)
            }
            RefundDecision::Declined { reason } => {
                warn!("Gateway declined refund {}: {}", refund.refund_reference, reason);
                let (payment, _) = self
                    .execute(payment_id, |p| Ok(p.fail_refund(refund_id, &reason)?))
                    .await?;
                Ok(payment)
            }
        }
    }

    async fn debit_order(&self, payment: &Payment, refund_id: Uuid) -> CoreResult<()> {
        let refund = payment.refund(refund_id)?;
        let (order, applied) = self
            .orders
            .apply_refund(payment.order_id, payment.id, &refund.refund_reference, refund.amount)
            .await?;
        if !applied && !order.has_application(&refund.refund_reference) {
            warn!(
                "Refund {} left order {} untouched: payment {} holds no credit there",
                refund.refund_reference, order.order_number, payment.payment_reference
            );
        }
        Ok(())
    }

    /// Tax invoice for a collected payment, created once per payment.
    pub async fn invoice_payment(&self, payment_id: Uuid, tax: TaxContext, company_id: Option<Uuid>) -> CoreResult<Invoice> {
        let source = InvoiceSource::Payment(payment_id);
        if let Some(existing) = self.invoices.find_by_source(source).await? {
            return Ok(existing);
        }
        let payment = self.get_payment(payment_id).await?;
        let invoice = self.generator.for_payment(&payment, &tax, company_id)?;
        self.store_invoice(invoice).await
    }

    /// Credit note for a completed refund.
    pub async fn invoice_refund(
        &self,
        payment_id: Uuid,
        refund_id: Uuid,
        tax: TaxContext,
        company_id: Option<Uuid>,
    ) -> CoreResult<Invoice> {
        let source = InvoiceSource::Refund(refund_id);
        if let Some(existing) = self.invoices.find_by_source(source).await? {
            return Ok(existing);
        }
        let payment = self.get_payment(payment_id).await?;
        let note = self.generator.for_refund(&payment, refund_id, &tax, company_id)?;
        self.store_invoice(note).await
    }

    pub async fn invoice_subscription(&self, charge: SubscriptionCharge, tax: TaxContext) -> CoreResult<Invoice> {
        let source = InvoiceSource::Subscription(charge.billing_event_id);
        if let Some(existing) = self.invoices.find_by_source(source).await? {
            return Ok(existing);
        }
        let invoice = self.generator.for_subscription(&charge, &tax)?;
        self.store_invoice(invoice).await
    }

    async fn store_invoice(&self, invoice: Invoice) -> CoreResult<Invoice> {
        let stored = self.invoices.insert_if_absent(&invoice).await?;
        if stored.id == invoice.id {
            info!(
                "Issued {} {} for {} {}",
                stored.invoice_type, stored.invoice_number, stored.total_amount, stored.currency
            );
            self.events.publish(DomainEvent::InvoiceGenerated(InvoiceGeneratedEvent {
                invoice_id: stored.id,
                invoice_number: stored.invoice_number.clone(),
                invoice_type: stored.invoice_type.to_string(),
                total: stored.total_amount,
                currency: stored.currency.clone(),
                occurred_at: stored.created_at,
            }));
        }
        Ok(stored)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> CoreResult<Invoice> {
        self.invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| CoreError::not_found("invoice", invoice_id))
    }

    pub async fn update_invoice_status(&self, invoice_id: Uuid, status: InvoiceStatus) -> CoreResult<Invoice> {
        let mut invoice = self.get_invoice(invoice_id).await?;
        invoice.transition(status)?;
        self.invoices.update_status(&invoice).await?;
        Ok(invoice)
    }
}

fn payment_event(payment: &Payment) -> PaymentStatusEvent {
    PaymentStatusEvent {
        payment_id: payment.id,
        order_id: payment.order_id,
        payment_reference: payment.payment_reference.clone(),
        status: payment.status.to_string(),
        amount: payment.amount,
        net_amount: payment.net_amount,
        currency: payment.currency.clone(),
        occurred_at: Utc::now(),
    }
}
