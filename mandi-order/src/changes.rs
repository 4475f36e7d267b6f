use chrono::Utc;
use mandi_core::status::{ItemStatus, OrderStatus};
use mandi_core::{ensure_transition, Lifecycle, ValidationError};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::fulfillment::FulfillmentUpdate;
use crate::models::{ApplicationKind, NewOrderItem, Order, OrderError, OrderItem, PaymentApplication};

/// Order-level mutations. Each one works on an in-memory copy of the
/// aggregate; the caller commits or discards it.
pub struct ChangeHandler;

impl ChangeHandler {
    /// Guarded order status move. Every status change goes through here.
    pub fn transition(order: &mut Order, next: OrderStatus) -> Result<(), OrderError> {
        ensure_transition(order.status, next)?;
        Self::check_guard(order, next)?;
        order.status = next;
        order.touch();
        Ok(())
    }

    fn check_guard(order: &Order, next: OrderStatus) -> Result<(), OrderError> {
        let fail = |reason: String| -> OrderError {
            ValidationError::GuardFailed {
                to: next.to_string(),
                reason,
            }
            .into()
        };

        match next {
            OrderStatus::PartiallyShipped | OrderStatus::Shipped => {
                if !order.items.iter().any(|i| i.quantity_shipped > 0) {
                    return Err(fail("no units have shipped".to_string()));
                }
            }
            OrderStatus::PartiallyDelivered | OrderStatus::Delivered => {
                if !order.items.iter().any(|i| i.quantity_delivered > 0) {
                    return Err(fail("no units have been delivered".to_string()));
                }
            }
            OrderStatus::Completed => {
                let totals = order.projected_totals()?;
                if !totals.outstanding.is_zero() {
                    return Err(fail(format!("{} still outstanding", totals.outstanding)));
                }
                if let Some(item) = order
                    .items
                    .iter()
                    .find(|i| i.quantity_delivered + i.quantity_returned != i.active_quantity())
                {
                    return Err(fail(format!("item {} is not fully delivered", item.product_name)));
                }
                if order.captured_amount().is_zero() && !totals.total.is_zero() {
                    return Err(fail("payment is still pending".to_string()));
                }
            }
            OrderStatus::Returned => {
                if !order.items.iter().any(|i| i.quantity_returned > 0) {
                    return Err(fail("no units have been returned".to_string()));
                }
            }
            OrderStatus::Refunded => {
                if order.captured_amount().is_zero() {
                    return Err(fail("nothing was collected".to_string()));
                }
                let paid = order.captured_amount() - order.refunded_amount();
                if !paid.is_zero() {
                    return Err(fail(format!("{} has not been refunded", paid)));
                }
            }
            OrderStatus::Failed => {
                let paid = order.captured_amount() - order.refunded_amount();
                if !paid.is_zero() {
                    return Err(fail(format!("{} collected on this order", paid)));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// DRAFT → PENDING
    pub fn submit(order: &mut Order) -> Result<(), OrderError> {
        Self::transition(order, OrderStatus::Pending)
    }

    /// PENDING → CONFIRMED. Lines still pending are confirmed with it.
    pub fn confirm(order: &mut Order) -> Result<(), OrderError> {
        Self::transition(order, OrderStatus::Confirmed)?;
        for item in order.items.iter_mut().filter(|i| i.status == ItemStatus::Pending) {
            item.advance_to(ItemStatus::Confirmed)?;
        }
        Ok(())
    }

    pub fn start_processing(order: &mut Order) -> Result<(), OrderError> {
        Self::transition(order, OrderStatus::Processing)?;
        for item in order.items.iter_mut().filter(|i| i.status == ItemStatus::Confirmed) {
            item.advance_to(ItemStatus::Processing)?;
        }
        Ok(())
    }

    /// Applies a fulfillment update to one line, then rolls the order
    /// status forward if the new quantities allow it.
    pub fn update_fulfillment(order: &mut Order, item_id: Uuid, update: FulfillmentUpdate) -> Result<(), OrderError> {
        let moves_goods = matches!(
            update.target,
            ItemStatus::Shipped
                | ItemStatus::PartiallyShipped
                | ItemStatus::Delivered
                | ItemStatus::PartiallyDelivered
                | ItemStatus::Returned
        );
        if moves_goods && !order.status.allows_fulfillment() {
            return Err(ValidationError::GuardFailed {
                to: update.target.to_string(),
                reason: format!("order is {}", order.status),
            }
            .into());
        }

        order.item_mut(item_id)?.apply_fulfillment(update)?;

        if matches!(update.target, ItemStatus::Cancelled | ItemStatus::Returned | ItemStatus::Refunded) {
            order.ensure_funds_covered()?;
        }
        Self::advance_with_fulfillment(order)?;
        order.touch();
        Ok(())
    }

    /// Forward-only sync of the order status with its fulfillment state.
    fn advance_with_fulfillment(order: &mut Order) -> Result<(), OrderError> {
        let shipped = order.items.iter().any(|i| i.quantity_shipped > 0);
        if order.status == OrderStatus::Confirmed && shipped {
            Self::transition(order, OrderStatus::Processing)?;
        }

        let active: u32 = order.items.iter().map(OrderItem::active_quantity).sum();
        let shipped: u32 = order.items.iter().map(|i| i.quantity_shipped).sum();
        let delivered: u32 = order
            .items
            .iter()
            .map(|i| i.quantity_delivered + i.quantity_returned)
            .sum();

        let target = if active > 0 && delivered == active {
            OrderStatus::Delivered
        } else if delivered > 0 {
            OrderStatus::PartiallyDelivered
        } else if active > 0 && shipped == active {
            OrderStatus::Shipped
        } else if shipped > 0 {
            OrderStatus::PartiallyShipped
        } else {
            return Ok(());
        };

        if target != order.status && order.status.can_transition_to(target) {
            Self::transition(order, target)?;
        }
        Ok(())
    }

    /// Cancels `quantity` unshipped units of one line.
    pub fn cancel_item_units(order: &mut Order, item_id: Uuid, quantity: u32) -> Result<(), OrderError> {
        Self::update_fulfillment(order, item_id, FulfillmentUpdate::new(ItemStatus::Cancelled, quantity))
    }

    /// Cancels the whole order. Every unshipped unit is cancelled and, when
    /// nothing left the warehouse, shipping and order discount are voided.
    pub fn cancel(order: &mut Order, reason: Option<String>) -> Result<(), OrderError> {
        ensure_transition(order.status, OrderStatus::Cancelled)?;

        for item in order.items.iter_mut() {
            let remaining = item.remaining_to_ship();
            if remaining > 0 && !item.status.is_terminal() {
                item.cancel_units(remaining)?;
            }
        }
        if order.items.iter().all(|i| i.quantity_shipped == 0) {
            order.shipping_amount = Decimal::ZERO;
            order.discount_amount = Decimal::ZERO;
        }
        order.ensure_funds_covered()?;

        if let Some(reason) = reason {
            order.notes = Some(match order.notes.take() {
                Some(notes) => format!("{}\nCancelled: {}", notes, reason),
                None => format!("Cancelled: {}", reason),
            });
        }
        Self::transition(order, OrderStatus::Cancelled)
    }

    pub fn complete(order: &mut Order) -> Result<(), OrderError> {
        Self::transition(order, OrderStatus::Completed)
    }

    /// Add a new line while the order is still editable
    pub fn add_item(order: &mut Order, new_item: NewOrderItem) -> Result<Uuid, OrderError> {
        if !order.status.is_editable() {
            return Err(not_editable(order));
        }
        let item = OrderItem::from_snapshot(order.id, new_item)?;
        let id = item.id;
        order.items.push(item);
        order.touch();
        Ok(id)
    }

    /// Replaces order-level shipping and discount while the order is editable.
    pub fn set_charges(order: &mut Order, shipping: Decimal, discount: Decimal) -> Result<(), OrderError> {
        if !order.status.is_editable() {
            return Err(not_editable(order));
        }
        if shipping < Decimal::ZERO || discount < Decimal::ZERO {
            return Err(ValidationError::InvalidAmount("charges cannot be negative".to_string()).into());
        }
        order.shipping_amount = shipping;
        order.discount_amount = discount;
        order.ensure_non_negative_total()?;
        order.ensure_funds_covered()?;
        order.touch();
        Ok(())
    }

    /// Credits a captured payment. Returns false when `reference` was
    /// already applied, so redelivered captures are harmless.
    pub fn apply_capture(order: &mut Order, payment_id: Uuid, reference: &str, amount: Decimal) -> Result<bool, OrderError> {
        if order.has_application(reference) {
            return Ok(false);
        }
        if amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!("capture amount {}", amount)).into());
        }
        if !order.status.accepts_payment() {
            return Err(ValidationError::GuardFailed {
                to: "capture".to_string(),
                reason: format!("order {} is {}", order.order_number, order.status),
            }
            .into());
        }
        let totals = order.projected_totals()?;
        if amount > totals.outstanding {
            return Err(ValidationError::AmountExceeded {
                requested: amount,
                available: totals.outstanding,
            }
            .into());
        }
        Self::record(order, payment_id, reference, ApplicationKind::Capture, amount);
        Ok(true)
    }

    /// Debits a completed refund, idempotent per refund reference. The
    /// debit is bounded by what the refunded payment itself contributed; a
    /// payment that never reached the ledger leaves the order untouched.
    pub fn apply_refund(order: &mut Order, payment_id: Uuid, reference: &str, amount: Decimal) -> Result<bool, OrderError> {
        if order.has_application(reference) {
            return Ok(false);
        }
        if amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!("refund amount {}", amount)).into());
        }
        let applied = order.net_applied(payment_id);
        if applied <= Decimal::ZERO {
            return Ok(false);
        }
        if amount > applied {
            return Err(ValidationError::AmountExceeded {
                requested: amount,
                available: applied,
            }
            .into());
        }
        Self::record(order, payment_id, reference, ApplicationKind::Refund, amount);
        Ok(true)
    }

    /// Reverses every capture of a payment lost to a chargeback.
    pub fn apply_chargeback(order: &mut Order, payment_id: Uuid, reference: &str) -> Result<bool, OrderError> {
        if order.has_application(reference) {
            return Ok(false);
        }
        let captured = order.net_applied(payment_id);
        if captured <= Decimal::ZERO {
            return Ok(false);
        }
        Self::record(order, payment_id, reference, ApplicationKind::Refund, captured);
        Ok(true)
    }

    fn record(order: &mut Order, payment_id: Uuid, reference: &str, kind: ApplicationKind, amount: Decimal) {
        order.payments.push(PaymentApplication {
            reference: reference.to_string(),
            payment_id,
            kind,
            amount,
            applied_at: Utc::now(),
        });
        order.touch();
    }
}

fn not_editable(order: &Order) -> OrderError {
    ValidationError::GuardFailed {
        to: "edit".to_string(),
        reason: format!("order {} is {}", order.order_number, order.status),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{create_request, snapshot};
    use mandi_core::status::{FulfillmentStatus, OrderPaymentStatus};
    use rust_decimal_macros::dec;

    fn order_with(items: Vec<NewOrderItem>) -> Order {
        Order::create(create_request(items)).unwrap()
    }

    fn confirmed(items: Vec<NewOrderItem>) -> Order {
        let mut order = order_with(items);
        ChangeHandler::confirm(&mut order).unwrap();
        order
    }

    #[test]
    fn test_confirm_confirms_items() {
        let order = confirmed(vec![snapshot("Cement", dec!(400.00), 2)]);
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.items[0].status, ItemStatus::Confirmed);
    }

    #[test]
    fn test_cannot_skip_to_delivered() {
        let mut order = order_with(vec![snapshot("Cement", dec!(400.00), 2)]);
        let err = ChangeHandler::transition(&mut order, OrderStatus::Delivered).unwrap_err();
        assert!(matches!(
            err,
            OrderError::Validation(ValidationError::IllegalTransition { .. })
        ));
        assert_eq!(order.status, OrderStatus::Pending);
    }

    #[test]
    fn test_shipping_advances_order_status() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(400.00), 2), snapshot("Sand", dec!(50.00), 4)]);
        let cement = order.items[0].id;
        let sand = order.items[1].id;

        ChangeHandler::update_fulfillment(&mut order, cement, FulfillmentUpdate::new(ItemStatus::Shipped, 2)).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyShipped);

        ChangeHandler::update_fulfillment(&mut order, sand, FulfillmentUpdate::all(ItemStatus::Shipped)).unwrap();
        assert_eq!(order.status, OrderStatus::Shipped);

        ChangeHandler::update_fulfillment(&mut order, cement, FulfillmentUpdate::all(ItemStatus::Delivered)).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyDelivered);

        ChangeHandler::update_fulfillment(&mut order, sand, FulfillmentUpdate::all(ItemStatus::Delivered)).unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);

        order.recompute().unwrap();
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Delivered);
    }

    #[test]
    fn test_pending_order_cannot_ship() {
        let mut order = order_with(vec![snapshot("Cement", dec!(400.00), 2)]);
        let id = order.items[0].id;
        let result = ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::new(ItemStatus::Shipped, 1));
        assert!(matches!(result, Err(OrderError::Validation(ValidationError::GuardFailed { .. }))));
    }

    #[test]
    fn test_unknown_item() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(400.00), 2)]);
        let result = ChangeHandler::cancel_item_units(&mut order, Uuid::new_v4(), 1);
        assert!(matches!(result, Err(OrderError::ItemNotFound(_))));
    }

    #[test]
    fn test_cancel_units_reprices_order() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 4)]);
        let id = order.items[0].id;
        ChangeHandler::cancel_item_units(&mut order, id, 1).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.total_amount, dec!(300.00));
    }

    #[test]
    fn test_cancel_after_payment_requires_refund() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 4)]);
        ChangeHandler::apply_capture(&mut order, Uuid::new_v4(), "PAY-1", dec!(400.00)).unwrap();
        let id = order.items[0].id;

        let err = ChangeHandler::cancel_item_units(&mut order, id, 1).unwrap_err();
        assert!(matches!(
            err,
            OrderError::Validation(ValidationError::RefundRequired(amount)) if amount == dec!(100.00)
        ));
    }

    #[test]
    fn test_cancel_order_voids_charges() {
        let mut request = create_request(vec![snapshot("Cement", dec!(100.00), 2)]);
        request.shipping_amount = dec!(25.00);
        let mut order = Order::create(request).unwrap();

        ChangeHandler::cancel(&mut order, Some("buyer request".to_string())).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.total_amount, Decimal::ZERO);
        assert_eq!(order.items[0].status, ItemStatus::Cancelled);
        assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
        assert!(order.notes.unwrap().contains("buyer request"));
    }

    #[test]
    fn test_completed_orders_cannot_be_cancelled() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        let id = order.items[0].id;
        ChangeHandler::apply_capture(&mut order, Uuid::new_v4(), "PAY-1", dec!(100.00)).unwrap();
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Shipped)).unwrap();
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Delivered)).unwrap();
        ChangeHandler::complete(&mut order).unwrap();

        assert!(ChangeHandler::cancel(&mut order, None).is_err());
    }

    #[test]
    fn test_returned_order_keeps_side_branches() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        let id = order.items[0].id;
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Shipped)).unwrap();
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Delivered)).unwrap();
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Returned)).unwrap();
        ChangeHandler::transition(&mut order, OrderStatus::Returned).unwrap();

        let mut failed = order.clone();
        ChangeHandler::transition(&mut failed, OrderStatus::Failed).unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);

        ChangeHandler::cancel(&mut order, Some("restocked".to_string())).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_complete_requires_payment() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        let id = order.items[0].id;
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Shipped)).unwrap();
        ChangeHandler::update_fulfillment(&mut order, id, FulfillmentUpdate::all(ItemStatus::Delivered)).unwrap();

        let err = ChangeHandler::complete(&mut order).unwrap_err();
        assert!(matches!(err, OrderError::Validation(ValidationError::GuardFailed { .. })));
    }

    #[test]
    fn test_capture_is_idempotent_per_reference() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 2)]);
        let payment_id = Uuid::new_v4();

        assert!(ChangeHandler::apply_capture(&mut order, payment_id, "PAY-1", dec!(150.00)).unwrap());
        assert!(!ChangeHandler::apply_capture(&mut order, payment_id, "PAY-1", dec!(150.00)).unwrap());
        order.recompute().unwrap();

        assert_eq!(order.paid_amount, dec!(150.00));
        assert_eq!(order.outstanding_amount, dec!(50.00));
        assert_eq!(order.payment_status, OrderPaymentStatus::PartiallyPaid);
    }

    #[test]
    fn test_overpayment_rejected() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        let result = ChangeHandler::apply_capture(&mut order, Uuid::new_v4(), "PAY-1", dec!(100.01));
        assert!(matches!(
            result,
            Err(OrderError::Validation(ValidationError::AmountExceeded { .. }))
        ));
    }

    #[test]
    fn test_refunds_reduce_paid() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 10)]);
        let payment_id = Uuid::new_v4();
        ChangeHandler::apply_capture(&mut order, payment_id, "PAY-1", dec!(1000.00)).unwrap();
        ChangeHandler::apply_refund(&mut order, payment_id, "RFD-1", dec!(300.00)).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.paid_amount, dec!(700.00));
        assert_eq!(order.payment_status, OrderPaymentStatus::PartiallyRefunded);

        assert!(ChangeHandler::apply_refund(&mut order, payment_id, "RFD-2", dec!(800.00)).is_err());
        ChangeHandler::apply_refund(&mut order, payment_id, "RFD-2", dec!(700.00)).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.payment_status, OrderPaymentStatus::Refunded);
        ChangeHandler::transition(&mut order, OrderStatus::Refunded).unwrap();
    }

    #[test]
    fn test_refund_cannot_debit_another_payments_credit() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 5)]);
        let applied = Uuid::new_v4();
        let unapplied = Uuid::new_v4();
        ChangeHandler::apply_capture(&mut order, applied, "PAY-A", dec!(500.00)).unwrap();

        // The second payment was never credited, so refunding it must not
        // touch the first payment's credit.
        assert!(!ChangeHandler::apply_refund(&mut order, unapplied, "RFD-B", dec!(500.00)).unwrap());
        order.recompute().unwrap();
        assert_eq!(order.paid_amount, dec!(500.00));
        assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
    }

    #[test]
    fn test_refund_bounded_by_payment_contribution() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 5)]);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        ChangeHandler::apply_capture(&mut order, first, "PAY-A", dec!(200.00)).unwrap();
        ChangeHandler::apply_capture(&mut order, second, "PAY-B", dec!(300.00)).unwrap();

        let result = ChangeHandler::apply_refund(&mut order, first, "RFD-A", dec!(250.00));
        assert!(matches!(
            result,
            Err(OrderError::Validation(ValidationError::AmountExceeded { available, .. })) if available == dec!(200.00)
        ));
        assert!(ChangeHandler::apply_refund(&mut order, first, "RFD-A", dec!(200.00)).unwrap());
    }

    #[test]
    fn test_failed_requires_no_collected_funds() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        ChangeHandler::apply_capture(&mut order, Uuid::new_v4(), "PAY-1", dec!(50.00)).unwrap();
        assert!(ChangeHandler::transition(&mut order, OrderStatus::Failed).is_err());
    }

    #[test]
    fn test_set_charges_only_while_editable() {
        let mut order = order_with(vec![snapshot("Cement", dec!(100.00), 1)]);
        ChangeHandler::set_charges(&mut order, dec!(10.00), dec!(5.00)).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.total_amount, dec!(105.00));

        ChangeHandler::confirm(&mut order).unwrap();
        assert!(ChangeHandler::set_charges(&mut order, dec!(0), dec!(0)).is_err());
    }

    #[test]
    fn test_add_item_while_editable() {
        let mut order = order_with(vec![snapshot("Cement", dec!(100.00), 1)]);
        ChangeHandler::add_item(&mut order, snapshot("Sand", dec!(20.00), 5)).unwrap();
        order.recompute().unwrap();
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.total_amount, dec!(200.00));
    }

    #[test]
    fn test_chargeback_reverses_payment() {
        let mut order = confirmed(vec![snapshot("Cement", dec!(100.00), 1)]);
        let payment_id = Uuid::new_v4();
        ChangeHandler::apply_capture(&mut order, payment_id, "PAY-1", dec!(100.00)).unwrap();
        ChangeHandler::apply_refund(&mut order, payment_id, "RFD-1", dec!(40.00)).unwrap();
        assert!(ChangeHandler::apply_chargeback(&mut order, payment_id, "CBK-PAY-1").unwrap());
        order.recompute().unwrap();
        assert_eq!(order.paid_amount, Decimal::ZERO);
        assert_eq!(order.outstanding_amount, dec!(100.00));
    }
}
