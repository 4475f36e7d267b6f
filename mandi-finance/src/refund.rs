use chrono::Utc;
use mandi_core::status::{PaymentStatus, RefundStatus};
use mandi_core::{ensure_transition, CoreError, ValidationError};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Payment, PaymentRefund, RefundRequestInput};

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Refund not found: {0}")]
    NotFound(Uuid),

    #[error("Payment {reference} is {status} and cannot be refunded")]
    NotRefundable {
        reference: String,
        status: PaymentStatus,
    },
}

impl From<RefundError> for CoreError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::Validation(v) => CoreError::Validation(v),
            RefundError::NotFound(id) => CoreError::not_found("refund", id),
            RefundError::NotRefundable { reference, status } => {
                CoreError::Validation(ValidationError::GuardFailed {
                    to: "refund".to_string(),
                    reason: format!("payment {} is {}", reference, status),
                })
            }
        }
    }
}

impl Payment {
    pub fn refund(&self, refund_id: Uuid) -> Result<&PaymentRefund, RefundError> {
        self.refunds
            .iter()
            .find(|r| r.id == refund_id)
            .ok_or(RefundError::NotFound(refund_id))
    }

    fn refund_mut(&mut self, refund_id: Uuid) -> Result<&mut PaymentRefund, RefundError> {
        self.refunds
            .iter_mut()
            .find(|r| r.id == refund_id)
            .ok_or(RefundError::NotFound(refund_id))
    }

    pub fn refund_by_reference(&self, reference: &str) -> Option<&PaymentRefund> {
        self.refunds.iter().find(|r| r.refund_reference == reference)
    }

    /// Amount held by approved or in-flight refunds, excluding `except`.
    fn reserved_amount(&self, except: Option<Uuid>) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.status.holds_reservation() && Some(r.id) != except)
            .map(|r| r.amount)
            .sum()
    }

    /// Amount held by refunds already handed to the gateway.
    pub(crate) fn in_flight_refund_amount(&self) -> Decimal {
        self.refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Processing)
            .map(|r| r.amount)
            .sum()
    }

    /// What can still be promised to new refunds.
    pub fn available_for_refund(&self) -> Decimal {
        self.refundable_amount - self.reserved_amount(None)
    }

    fn ensure_refundable(&self) -> Result<(), RefundError> {
        if !self.status.is_refundable() {
            return Err(RefundError::NotRefundable {
                reference: self.payment_reference.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Records a refund request. Requests are idempotent on their
    /// reference: a repeat returns the existing refund and `false`.
    pub fn request_refund(&mut self, input: &RefundRequestInput) -> Result<(Uuid, bool), RefundError> {
        if let Some(reference) = input.refund_reference.as_deref() {
            if let Some(existing) = self.refund_by_reference(reference) {
                return Ok((existing.id, false));
            }
        }
        self.ensure_refundable()?;
        if input.amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!("refund amount {} must be positive", input.amount)).into());
        }
        let available = self.available_for_refund();
        if input.amount > available {
            return Err(ValidationError::AmountExceeded {
                requested: input.amount,
                available,
            }
            .into());
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let refund_reference = match input.refund_reference.as_deref() {
            Some(r) if !r.trim().is_empty() => r.trim().to_string(),
            _ => format!("RFD-{}", id.simple().to_string().to_uppercase()),
        };
        self.refunds.push(PaymentRefund {
            id,
            payment_id: self.id,
            order_id: self.order_id,
            refund_reference,
            amount: input.amount,
            reason: input.reason.clone(),
            status: RefundStatus::Requested,
            gateway_refund_id: None,
            failure_reason: None,
            requested_by: input.requested_by,
            approved_by: None,
            requested_at: now,
            approved_at: None,
            processed_at: None,
            updated_at: now,
        });
        self.updated_at = now;
        Ok((id, true))
    }

    /// REQUESTED → APPROVED. The balance is checked again here against
    /// whatever sibling refunds have reserved since the request.
    pub fn approve_refund(&mut self, refund_id: Uuid, approver: Option<Uuid>) -> Result<(), RefundError> {
        self.ensure_refundable()?;
        let refund = self.refund(refund_id)?;
        ensure_transition(refund.status, RefundStatus::Approved)?;

        let available = self.refundable_amount - self.reserved_amount(Some(refund_id));
        if refund.amount > available {
            return Err(ValidationError::AmountExceeded {
                requested: refund.amount,
                available,
            }
            .into());
        }

        let now = Utc::now();
        let refund = self.refund_mut(refund_id)?;
        refund.status = RefundStatus::Approved;
        refund.approved_by = approver;
        refund.approved_at = Some(now);
        refund.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    pub fn reject_refund(&mut self, refund_id: Uuid, reason: &str) -> Result<(), RefundError> {
        self.close_refund(refund_id, RefundStatus::Rejected, reason)
    }

    pub fn cancel_refund(&mut self, refund_id: Uuid) -> Result<(), RefundError> {
        self.close_refund(refund_id, RefundStatus::Cancelled, "cancelled")
    }

    pub fn fail_refund(&mut self, refund_id: Uuid, reason: &str) -> Result<(), RefundError> {
        self.close_refund(refund_id, RefundStatus::Failed, reason)
    }

    fn close_refund(&mut self, refund_id: Uuid, next: RefundStatus, reason: &str) -> Result<(), RefundError> {
        let now = Utc::now();
        let charged_back = self.status == PaymentStatus::Chargeback;
        let refund = self.refund_mut(refund_id)?;
        ensure_transition(refund.status, next)?;
        let released = if charged_back && refund.status == RefundStatus::Processing {
            refund.amount
        } else {
            Decimal::ZERO
        };
        refund.status = next;
        refund.failure_reason = Some(reason.to_string());
        refund.updated_at = now;
        // After a chargeback the balance kept for in-flight refunds is
        // forfeited once they can no longer pay out.
        self.refundable_amount -= released;
        self.updated_at = now;
        Ok(())
    }

    /// APPROVED → PROCESSING before the gateway call. A refund already
    /// PROCESSING is left as is so a timed-out call can be retried, even if
    /// the payment has since been disputed: the first call may have paid out.
    pub fn begin_refund_processing(&mut self, refund_id: Uuid) -> Result<(), RefundError> {
        if self.refund(refund_id)?.status == RefundStatus::Processing {
            return Ok(());
        }
        self.ensure_refundable()?;
        let now = Utc::now();
        let refund = self.refund_mut(refund_id)?;
        ensure_transition(refund.status, RefundStatus::Processing)?;
        refund.status = RefundStatus::Processing;
        refund.updated_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// PROCESSING → COMPLETED after the gateway confirmed the refund.
    /// Returns `false` if it was already completed. Balances move the same
    /// way under a dispute or chargeback, but the payment keeps that status.
    pub fn complete_refund(&mut self, refund_id: Uuid, gateway_refund_id: Option<String>) -> Result<bool, RefundError> {
        let refund = self.refund(refund_id)?;
        if refund.status == RefundStatus::Completed {
            return Ok(false);
        }
        ensure_transition(refund.status, RefundStatus::Completed)?;
        let amount = refund.amount;
        if amount > self.refundable_amount {
            return Err(ValidationError::AmountExceeded {
                requested: amount,
                available: self.refundable_amount,
            }
            .into());
        }

        let now = Utc::now();
        let refund = self.refund_mut(refund_id)?;
        refund.status = RefundStatus::Completed;
        refund.gateway_refund_id = gateway_refund_id;
        refund.processed_at = Some(now);
        refund.updated_at = now;

        self.refundable_amount -= amount;
        self.refunded_amount += amount;
        let next = if self.refundable_amount.is_zero() {
            PaymentStatus::FullyRefunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        if self.status.is_refundable() && next != self.status {
            ensure_transition(self.status, next)?;
            self.status = next;
        }
        self.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::tests::captured_payment;
    use rust_decimal_macros::dec;

    fn request(amount: Decimal, reference: &str) -> RefundRequestInput {
        RefundRequestInput {
            refund_reference: Some(reference.to_string()),
            amount,
            reason: "damaged in transit".to_string(),
            requested_by: None,
        }
    }

    fn run_to_completion(payment: &mut Payment, amount: Decimal, reference: &str) -> Uuid {
        let (id, _) = payment.request_refund(&request(amount, reference)).unwrap();
        payment.approve_refund(id, None).unwrap();
        payment.begin_refund_processing(id).unwrap();
        payment.complete_refund(id, Some(format!("gw_{}", reference))).unwrap();
        id
    }

    #[test]
    fn test_partial_refund_then_overdraw_rejected() {
        let mut payment = captured_payment(dec!(1000.00));
        run_to_completion(&mut payment, dec!(300.00), "RFD-1");
        payment.recompute().unwrap();

        assert_eq!(payment.refundable_amount, dec!(700.00));
        assert_eq!(payment.refunded_amount, dec!(300.00));
        assert_eq!(payment.status, PaymentStatus::PartiallyRefunded);

        let result = payment.request_refund(&request(dec!(800.00), "RFD-2"));
        assert!(matches!(
            result,
            Err(RefundError::Validation(ValidationError::AmountExceeded { .. }))
        ));
    }

    #[test]
    fn test_full_refund() {
        let mut payment = captured_payment(dec!(1000.00));
        run_to_completion(&mut payment, dec!(400.00), "RFD-1");
        run_to_completion(&mut payment, dec!(600.00), "RFD-2");
        payment.recompute().unwrap();

        assert_eq!(payment.status, PaymentStatus::FullyRefunded);
        assert_eq!(payment.refundable_amount, Decimal::ZERO);
        assert_eq!(payment.refunded_amount, dec!(1000.00));
        assert!(payment.request_refund(&request(dec!(1.00), "RFD-3")).is_err());
    }

    #[test]
    fn test_request_is_idempotent_on_reference() {
        let mut payment = captured_payment(dec!(1000.00));
        let (first, created) = payment.request_refund(&request(dec!(100.00), "RFD-1")).unwrap();
        assert!(created);
        let (second, created) = payment.request_refund(&request(dec!(100.00), "RFD-1")).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(payment.refunds.len(), 1);
    }

    #[test]
    fn test_approval_respects_sibling_reservations() {
        let mut payment = captured_payment(dec!(1000.00));
        let (a, _) = payment.request_refund(&request(dec!(600.00), "RFD-A")).unwrap();
        let (b, _) = payment.request_refund(&request(dec!(600.00), "RFD-B")).unwrap();

        payment.approve_refund(a, None).unwrap();
        let result = payment.approve_refund(b, None);
        assert!(matches!(
            result,
            Err(RefundError::Validation(ValidationError::AmountExceeded { available, .. })) if available == dec!(400.00)
        ));
        assert_eq!(payment.refund(b).unwrap().status, RefundStatus::Requested);
    }

    #[test]
    fn test_reservation_released_on_rejection() {
        let mut payment = captured_payment(dec!(1000.00));
        let (a, _) = payment.request_refund(&request(dec!(600.00), "RFD-A")).unwrap();
        payment.approve_refund(a, None).unwrap();
        assert_eq!(payment.available_for_refund(), dec!(400.00));

        payment.reject_refund(a, "duplicate claim").unwrap();
        assert_eq!(payment.available_for_refund(), dec!(1000.00));
    }

    #[test]
    fn test_cannot_complete_unapproved_refund() {
        let mut payment = captured_payment(dec!(1000.00));
        let (id, _) = payment.request_refund(&request(dec!(100.00), "RFD-1")).unwrap();
        assert!(payment.complete_refund(id, None).is_err());
        assert!(payment.begin_refund_processing(id).is_err());
    }

    #[test]
    fn test_complete_twice_is_noop() {
        let mut payment = captured_payment(dec!(1000.00));
        let id = run_to_completion(&mut payment, dec!(100.00), "RFD-1");
        assert!(!payment.complete_refund(id, None).unwrap());
        assert_eq!(payment.refunded_amount, dec!(100.00));
    }

    #[test]
    fn test_pending_payment_not_refundable() {
        let mut payment = captured_payment(dec!(1000.00));
        payment.status = PaymentStatus::Initiated;
        assert!(matches!(
            payment.request_refund(&request(dec!(1.00), "RFD-1")),
            Err(RefundError::NotRefundable { .. })
        ));
    }

    fn in_flight(payment: &mut Payment, amount: Decimal, reference: &str) -> Uuid {
        let (id, _) = payment.request_refund(&request(amount, reference)).unwrap();
        payment.approve_refund(id, None).unwrap();
        payment.begin_refund_processing(id).unwrap();
        id
    }

    fn gateway_report(payment: &mut Payment, status: PaymentStatus) {
        let event = crate::payment::tests::event(payment, status);
        payment.apply_gateway_event(&event).unwrap();
    }

    #[test]
    fn test_in_flight_refund_completes_during_dispute() {
        let mut payment = captured_payment(dec!(1000.00));
        let id = in_flight(&mut payment, dec!(300.00), "RFD-1");
        gateway_report(&mut payment, PaymentStatus::Disputed);

        payment.begin_refund_processing(id).unwrap();
        assert!(payment.complete_refund(id, Some("gw_1".to_string())).unwrap());
        payment.recompute().unwrap();

        assert_eq!(payment.status, PaymentStatus::Disputed);
        assert_eq!(payment.refunded_amount, dec!(300.00));
        assert_eq!(payment.refundable_amount, dec!(700.00));
        assert_eq!(payment.available_for_refund(), dec!(700.00));
    }

    #[test]
    fn test_in_flight_refund_survives_chargeback() {
        let mut payment = captured_payment(dec!(1000.00));
        let id = in_flight(&mut payment, dec!(300.00), "RFD-1");
        gateway_report(&mut payment, PaymentStatus::Disputed);
        gateway_report(&mut payment, PaymentStatus::Chargeback);
        assert_eq!(payment.refundable_amount, dec!(300.00));

        payment.begin_refund_processing(id).unwrap();
        payment.complete_refund(id, None).unwrap();
        payment.recompute().unwrap();
        assert_eq!(payment.status, PaymentStatus::Chargeback);
        assert_eq!(payment.refundable_amount, Decimal::ZERO);
        assert_eq!(payment.refunded_amount, dec!(300.00));
    }

    #[test]
    fn test_declined_refund_after_chargeback_releases_balance() {
        let mut payment = captured_payment(dec!(1000.00));
        let id = in_flight(&mut payment, dec!(300.00), "RFD-1");
        gateway_report(&mut payment, PaymentStatus::Disputed);
        gateway_report(&mut payment, PaymentStatus::Chargeback);

        payment.fail_refund(id, "declined").unwrap();
        payment.recompute().unwrap();
        assert_eq!(payment.refundable_amount, Decimal::ZERO);
    }

    #[test]
    fn test_disputed_payment_takes_no_new_refunds() {
        let mut payment = captured_payment(dec!(1000.00));
        let (id, _) = payment.request_refund(&request(dec!(100.00), "RFD-1")).unwrap();
        payment.approve_refund(id, None).unwrap();
        gateway_report(&mut payment, PaymentStatus::Disputed);
        assert!(matches!(
            payment.begin_refund_processing(id),
            Err(RefundError::NotRefundable { .. })
        ));
    }

    #[test]
    fn test_unknown_refund() {
        let mut payment = captured_payment(dec!(1000.00));
        assert!(matches!(
            payment.approve_refund(Uuid::new_v4(), None),
            Err(RefundError::NotFound(_))
        ));
    }
}
