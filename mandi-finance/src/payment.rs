use chrono::Utc;
use mandi_core::money::max_amount;
use mandi_core::status::{PaymentMethod, PaymentStatus, PaymentType, RefundStatus};
use mandi_core::{ensure_transition, CoreError, Lifecycle, ValidationError};
use mandi_shared::Masked;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{FeeSchedule, GatewayEvent, Payment, PaymentFees};
use crate::refund::RefundError;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error("Payment invariant violated: {0}")]
    Invariant(String),
}

impl From<PaymentError> for CoreError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(v) => CoreError::Validation(v),
            PaymentError::Refund(r) => r.into(),
            PaymentError::Invariant(msg) => CoreError::FatalInvariant(msg),
        }
    }
}

/// What applying a gateway event did to the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied { from: PaymentStatus },
    /// Same status as already stored; nothing changed.
    Duplicate,
    /// The payment already moved past this status; nothing changed.
    Stale,
}

impl Payment {
    pub fn new(
        order_id: Uuid,
        amount: Decimal,
        currency: &str,
        method: PaymentMethod,
        reference: Option<String>,
        method_details: Option<String>,
        schedule: &FeeSchedule,
    ) -> Result<Self, PaymentError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!("payment amount {} must be positive", amount)).into());
        }
        if amount > max_amount() {
            return Err(ValidationError::InvalidAmount(format!("payment amount {} exceeds the limit", amount)).into());
        }
        let fees = schedule.fees_for(amount);
        ensure_fees_fit(&fees, amount)?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let payment_reference = match reference {
            Some(r) if !r.trim().is_empty() => r.trim().to_string(),
            _ => format!("PAY-{}", id.simple().to_string().to_uppercase()),
        };

        let mut payment = Self {
            id,
            order_id,
            payment_reference,
            payment_type: PaymentType::Payment,
            method,
            method_details: method_details.map(Masked::new),
            status: PaymentStatus::Pending,
            amount,
            currency: currency.to_string(),
            fees,
            total_fees: Decimal::ZERO,
            net_amount: Decimal::ZERO,
            refundable_amount: amount,
            refunded_amount: Decimal::ZERO,
            gateway_transaction_id: None,
            failure_reason: None,
            refunds: Vec::new(),
            version: 0,
            initiated_at: None,
            authorized_at: None,
            captured_at: None,
            settled_at: None,
            created_at: now,
            updated_at: now,
        };
        payment.recompute()?;
        Ok(payment)
    }

    /// Refreshes derived amounts and checks the balance invariants. Runs
    /// before every persist.
    pub fn recompute(&mut self) -> Result<(), PaymentError> {
        if self.fees.is_negative() {
            return Err(PaymentError::Invariant(format!(
                "payment {} has negative fees",
                self.payment_reference
            )));
        }
        self.total_fees = self.fees.total();
        self.net_amount = self.amount - self.total_fees;
        if self.net_amount < Decimal::ZERO {
            return Err(PaymentError::Invariant(format!(
                "payment {}: fees {} exceed amount {}",
                self.payment_reference, self.total_fees, self.amount
            )));
        }

        if self.refundable_amount < Decimal::ZERO || self.refundable_amount > self.amount {
            return Err(PaymentError::Invariant(format!(
                "payment {}: refundable {} outside 0..={}",
                self.payment_reference, self.refundable_amount, self.amount
            )));
        }
        if self.refunded_amount < Decimal::ZERO || self.refunded_amount + self.refundable_amount > self.amount {
            return Err(PaymentError::Invariant(format!(
                "payment {}: refunded {} + refundable {} > amount {}",
                self.payment_reference, self.refunded_amount, self.refundable_amount, self.amount
            )));
        }

        let completed: Decimal = self
            .refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum();
        if completed != self.refunded_amount {
            return Err(PaymentError::Invariant(format!(
                "payment {}: completed refunds {} != refunded {}",
                self.payment_reference, completed, self.refunded_amount
            )));
        }
        Ok(())
    }

    pub fn transition(&mut self, next: PaymentStatus) -> Result<(), PaymentError> {
        ensure_transition(self.status, next)?;
        let now = Utc::now();
        match next {
            PaymentStatus::Initiated => self.initiated_at = Some(now),
            PaymentStatus::Authorized => self.authorized_at = Some(now),
            PaymentStatus::Captured => self.captured_at = Some(now),
            PaymentStatus::Settled => self.settled_at = Some(now),
            // Only refunds already handed to the gateway can still complete;
            // the rest of the balance is lost to the dispute.
            PaymentStatus::Chargeback => self.refundable_amount = self.in_flight_refund_amount(),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Marks the charge as handed to the gateway.
    pub fn mark_initiated(&mut self, gateway_transaction_id: String) -> Result<(), PaymentError> {
        self.transition(PaymentStatus::Initiated)?;
        self.gateway_transaction_id = Some(gateway_transaction_id);
        Ok(())
    }

    /// Applies a provider status report. Repeated or out-of-date reports
    /// are recognised and leave the payment untouched.
    pub fn apply_gateway_event(&mut self, event: &GatewayEvent) -> Result<EventOutcome, PaymentError> {
        if event.payment_reference != self.payment_reference {
            return Err(ValidationError::Invalid(format!(
                "event for {} applied to payment {}",
                event.payment_reference, self.payment_reference
            ))
            .into());
        }
        if event.status == self.status {
            return Ok(EventOutcome::Duplicate);
        }
        if matches!(
            event.status,
            PaymentStatus::PartiallyRefunded | PaymentStatus::FullyRefunded
        ) {
            return Err(ValidationError::Invalid(format!(
                "{} is driven by refunds, not gateway events",
                event.status
            ))
            .into());
        }
        let path = match self.gateway_path(event.status) {
            Some(path) => path,
            None if event.status.progress_rank() < self.status.progress_rank() || self.status.is_terminal() => {
                return Ok(EventOutcome::Stale);
            }
            None => {
                return Err(ValidationError::IllegalTransition {
                    machine: PaymentStatus::MACHINE,
                    from: self.status.to_string(),
                    to: event.status.to_string(),
                }
                .into());
            }
        };
        if event.amount != self.amount {
            return Err(ValidationError::AmountExceeded {
                requested: event.amount,
                available: self.amount,
            }
            .into());
        }
        if let Some(fees) = &event.fees {
            ensure_fees_fit(fees, self.amount)?;
        }

        let from = self.status;
        for step in path {
            self.transition(step)?;
        }
        if let Some(txn) = &event.gateway_transaction_id {
            self.gateway_transaction_id = Some(txn.clone());
        }
        if let Some(fees) = event.fees {
            self.fees = fees;
        }
        if matches!(
            event.status,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Expired
        ) {
            self.failure_reason = event
                .failure_reason
                .clone()
                .or_else(|| Some(format!("gateway reported {}", event.status)));
        }
        Ok(EventOutcome::Applied { from })
    }

    /// Steps from the current status to `target`. A gateway reports only
    /// its latest status, so AUTHORIZED, CAPTURED or SETTLED may arrive for
    /// a payment still PENDING (the initiate call timed out, or the callback
    /// beat its acknowledgement). Each intermediate step is itself legal.
    fn gateway_path(&self, target: PaymentStatus) -> Option<Vec<PaymentStatus>> {
        use PaymentStatus::*;

        if self.status.can_transition_to(target) {
            return Some(vec![target]);
        }
        if !matches!(target, Authorized | Captured | Settled) {
            return None;
        }

        let mut path = Vec::new();
        let mut at = self.status;
        while !at.can_transition_to(target) {
            let step = [Captured, Authorized, Initiated].into_iter().find(|step| {
                step.progress_rank() > at.progress_rank()
                    && step.progress_rank() < target.progress_rank()
                    && at.can_transition_to(*step)
            })?;
            path.push(step);
            at = step;
        }
        path.push(target);
        Some(path)
    }

}

fn ensure_fees_fit(fees: &PaymentFees, amount: Decimal) -> Result<(), PaymentError> {
    match fees.checked_total() {
        Some(total) if !fees.is_negative() && total <= amount => Ok(()),
        Some(total) if fees.is_negative() => Err(ValidationError::InvalidAmount(format!(
            "fees cannot be negative (total {})",
            total
        ))
        .into()),
        Some(total) => Err(ValidationError::InvalidAmount(format!(
            "fees {} exceed payment amount {}",
            total, amount
        ))
        .into()),
        None => Err(ValidationError::InvalidAmount("fees are too large".to_string()).into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn schedule() -> FeeSchedule {
        FeeSchedule {
            gateway_fee_percent: dec!(2),
            processing_fee: dec!(5.00),
            convenience_fee: Decimal::ZERO,
        }
    }

    pub(crate) fn event(payment: &Payment, status: PaymentStatus) -> GatewayEvent {
        GatewayEvent {
            payment_reference: payment.payment_reference.clone(),
            status,
            amount: payment.amount,
            gateway_transaction_id: None,
            fees: None,
            failure_reason: None,
        }
    }

    pub(crate) fn captured_payment(amount: Decimal) -> Payment {
        let mut payment = Payment::new(
            Uuid::new_v4(),
            amount,
            "INR",
            PaymentMethod::Upi,
            Some("PAY-TEST".to_string()),
            None,
            &schedule(),
        )
        .unwrap();
        payment.mark_initiated("txn_1".to_string()).unwrap();
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Captured)).unwrap();
        payment.recompute().unwrap();
        payment
    }

    #[test]
    fn test_new_payment_defaults() {
        let payment = Payment::new(
            Uuid::new_v4(),
            dec!(1000.00),
            "INR",
            PaymentMethod::Card,
            None,
            Some("4111".to_string()),
            &schedule(),
        )
        .unwrap();

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.payment_reference.starts_with("PAY-"));
        assert_eq!(payment.refundable_amount, dec!(1000.00));
        assert_eq!(payment.total_fees, dec!(25.00));
        assert_eq!(payment.net_amount, dec!(975.00));
        assert_eq!(format!("{:?}", payment.method_details), "Some(********)");
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let result = Payment::new(Uuid::new_v4(), Decimal::ZERO, "INR", PaymentMethod::Upi, None, None, &schedule());
        assert!(matches!(result, Err(PaymentError::Validation(_))));
    }

    #[test]
    fn test_duplicate_and_stale_events() {
        let mut payment = captured_payment(dec!(1000.00));
        let snapshot = payment.clone();

        let outcome = payment.apply_gateway_event(&event(&payment, PaymentStatus::Captured)).unwrap();
        assert_eq!(outcome, EventOutcome::Duplicate);

        let outcome = payment.apply_gateway_event(&event(&payment, PaymentStatus::Authorized)).unwrap();
        assert_eq!(outcome, EventOutcome::Stale);
        assert_eq!(payment, snapshot);
    }

    #[test]
    fn test_illegal_event_rejected() {
        let mut payment = captured_payment(dec!(1000.00));
        let result = payment.apply_gateway_event(&event(&payment, PaymentStatus::Expired));
        assert!(matches!(
            result,
            Err(PaymentError::Validation(ValidationError::IllegalTransition { .. }))
        ));
    }

    #[test]
    fn test_amount_mismatch_rejected() {
        let mut payment = Payment::new(Uuid::new_v4(), dec!(500.00), "INR", PaymentMethod::Upi, None, None, &schedule()).unwrap();
        payment.mark_initiated("txn".to_string()).unwrap();
        let mut captured = event(&payment, PaymentStatus::Captured);
        captured.amount = dec!(499.00);
        assert!(payment.apply_gateway_event(&captured).is_err());
        assert_eq!(payment.status, PaymentStatus::Initiated);
    }

    #[test]
    fn test_event_fees_override_schedule() {
        let mut payment = Payment::new(Uuid::new_v4(), dec!(1000.00), "INR", PaymentMethod::Upi, None, None, &schedule()).unwrap();
        payment.mark_initiated("txn".to_string()).unwrap();
        let mut captured = event(&payment, PaymentStatus::Captured);
        captured.fees = Some(PaymentFees {
            gateway_fee: dec!(18.00),
            processing_fee: Decimal::ZERO,
            convenience_fee: dec!(2.00),
        });
        payment.apply_gateway_event(&captured).unwrap();
        payment.recompute().unwrap();
        assert_eq!(payment.net_amount, dec!(980.00));
        assert!(payment.captured_at.is_some());
    }

    #[test]
    fn test_failure_records_reason() {
        let mut payment = Payment::new(Uuid::new_v4(), dec!(10.00), "INR", PaymentMethod::Upi, None, None, &FeeSchedule::default()).unwrap();
        payment.mark_initiated("txn".to_string()).unwrap();
        let mut failed = event(&payment, PaymentStatus::Failed);
        failed.failure_reason = Some("card declined".to_string());
        payment.apply_gateway_event(&failed).unwrap();
        assert_eq!(payment.failure_reason.as_deref(), Some("card declined"));

        // Terminal: later reports are ignored.
        let outcome = payment.apply_gateway_event(&event(&payment, PaymentStatus::Captured)).unwrap();
        assert_eq!(outcome, EventOutcome::Stale);
    }

    #[test]
    fn test_chargeback_forfeits_refundable() {
        let mut payment = captured_payment(dec!(1000.00));
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Disputed)).unwrap();
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Chargeback)).unwrap();
        payment.recompute().unwrap();
        assert_eq!(payment.refundable_amount, Decimal::ZERO);
    }

    #[test]
    fn test_dispute_resolved_back_to_settled() {
        let mut payment = captured_payment(dec!(1000.00));
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Disputed)).unwrap();
        let outcome = payment.apply_gateway_event(&event(&payment, PaymentStatus::Settled)).unwrap();
        assert_eq!(outcome, EventOutcome::Applied { from: PaymentStatus::Disputed });
    }

    fn pending_payment(amount: Decimal) -> Payment {
        Payment::new(Uuid::new_v4(), amount, "INR", PaymentMethod::Upi, Some("PAY-P".to_string()), None, &schedule()).unwrap()
    }

    #[test]
    fn test_capture_report_on_pending_payment_catches_up() {
        let mut payment = pending_payment(dec!(500.00));
        let outcome = payment.apply_gateway_event(&event(&payment, PaymentStatus::Captured)).unwrap();
        assert_eq!(outcome, EventOutcome::Applied { from: PaymentStatus::Pending });
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert!(payment.initiated_at.is_some());
        assert!(payment.captured_at.is_some());
        assert!(payment.authorized_at.is_none());
    }

    #[test]
    fn test_authorized_and_settled_reports_on_pending_payment() {
        let mut payment = pending_payment(dec!(500.00));
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Authorized)).unwrap();
        assert_eq!(payment.status, PaymentStatus::Authorized);

        let mut payment = pending_payment(dec!(500.00));
        payment.apply_gateway_event(&event(&payment, PaymentStatus::Settled)).unwrap();
        assert_eq!(payment.status, PaymentStatus::Settled);
        assert!(payment.captured_at.is_some());
    }

    #[test]
    fn test_chargeback_cannot_skip_capture() {
        let mut payment = pending_payment(dec!(500.00));
        let result = payment.apply_gateway_event(&event(&payment, PaymentStatus::Chargeback));
        assert!(matches!(
            result,
            Err(PaymentError::Validation(ValidationError::IllegalTransition { .. }))
        ));
        assert_eq!(payment.status, PaymentStatus::Pending);
    }

    #[test]
    fn test_amount_below_flat_fees_rejected() {
        let result = Payment::new(Uuid::new_v4(), dec!(3.00), "INR", PaymentMethod::Upi, None, None, &schedule());
        assert!(matches!(
            result,
            Err(PaymentError::Validation(ValidationError::InvalidAmount(_)))
        ));
    }

    #[test]
    fn test_invalid_event_fees_rejected() {
        let mut payment = Payment::new(Uuid::new_v4(), dec!(100.00), "INR", PaymentMethod::Upi, None, None, &schedule()).unwrap();
        payment.mark_initiated("txn".to_string()).unwrap();

        let mut negative = event(&payment, PaymentStatus::Captured);
        negative.fees = Some(PaymentFees {
            gateway_fee: dec!(-1.00),
            ..PaymentFees::default()
        });
        assert!(matches!(
            payment.apply_gateway_event(&negative),
            Err(PaymentError::Validation(ValidationError::InvalidAmount(_)))
        ));

        let mut oversized = event(&payment, PaymentStatus::Captured);
        oversized.fees = Some(PaymentFees {
            gateway_fee: dec!(100.01),
            ..PaymentFees::default()
        });
        assert!(matches!(
            payment.apply_gateway_event(&oversized),
            Err(PaymentError::Validation(ValidationError::InvalidAmount(_)))
        ));

        let mut unsummable = event(&payment, PaymentStatus::Captured);
        unsummable.fees = Some(PaymentFees {
            gateway_fee: Decimal::MAX,
            processing_fee: Decimal::MAX,
            convenience_fee: Decimal::ZERO,
        });
        assert!(payment.apply_gateway_event(&unsummable).is_err());
        assert_eq!(payment.status, PaymentStatus::Initiated);
    }

    #[test]
    fn test_recompute_catches_fee_overrun() {
        let mut payment = captured_payment(dec!(10.00));
        payment.fees = PaymentFees {
            gateway_fee: dec!(11.00),
            ..PaymentFees::default()
        };
        assert!(matches!(payment.recompute(), Err(PaymentError::Invariant(_))));
    }
}
