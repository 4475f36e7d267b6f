use chrono::Utc;
use mandi_core::status::ItemStatus;
use mandi_core::{ensure_transition, Lifecycle, ValidationError};
use serde::{Deserialize, Serialize};

use crate::models::OrderItem;

/// A request to move an item toward `target`. Quantity-bearing targets
/// (shipped, delivered, cancelled, returned) act on `quantity` units, or on
/// every eligible unit when it is omitted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FulfillmentUpdate {
    pub target: ItemStatus,
    pub quantity: Option<u32>,
}

impl FulfillmentUpdate {
    pub fn new(target: ItemStatus, quantity: u32) -> Self {
        Self {
            target,
            quantity: Some(quantity),
        }
    }

    pub fn all(target: ItemStatus) -> Self {
        Self {
            target,
            quantity: None,
        }
    }
}

impl OrderItem {
    /// Units that can still leave the warehouse.
    pub fn remaining_to_ship(&self) -> u32 {
        self.quantity_ordered
            .saturating_sub(self.quantity_shipped)
            .saturating_sub(self.quantity_cancelled)
    }

    /// Shipped units not yet delivered or returned.
    pub fn in_transit(&self) -> u32 {
        self.quantity_shipped
            .saturating_sub(self.quantity_delivered)
            .saturating_sub(self.quantity_returned)
    }

    pub fn apply_fulfillment(&mut self, update: FulfillmentUpdate) -> Result<(), ValidationError> {
        match update.target {
            ItemStatus::Confirmed | ItemStatus::Processing | ItemStatus::Packed => {
                self.advance_to(update.target)
            }
            ItemStatus::Shipped | ItemStatus::PartiallyShipped => {
                let quantity = update.quantity.unwrap_or_else(|| self.remaining_to_ship());
                self.ship(quantity)
            }
            ItemStatus::Delivered | ItemStatus::PartiallyDelivered => {
                let quantity = update.quantity.unwrap_or_else(|| self.in_transit());
                self.deliver(quantity)
            }
            ItemStatus::Cancelled => {
                let quantity = update.quantity.unwrap_or_else(|| self.remaining_to_ship());
                self.cancel_units(quantity)
            }
            ItemStatus::Returned => {
                let quantity = update.quantity.unwrap_or(self.quantity_delivered);
                self.return_units(quantity)
            }
            ItemStatus::Refunded => self.mark_refunded(),
            ItemStatus::Pending => Err(ValidationError::IllegalTransition {
                machine: ItemStatus::MACHINE,
                from: self.status.to_string(),
                to: update.target.to_string(),
            }),
        }
    }

    /// Explicit pre-shipment moves (confirm, pick, pack).
    pub fn advance_to(&mut self, next: ItemStatus) -> Result<(), ValidationError> {
        ensure_transition(self.status, next)?;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn ship(&mut self, quantity: u32) -> Result<(), ValidationError> {
        if !self.status.can_ship() {
            return Err(ValidationError::GuardFailed {
                to: ItemStatus::Shipped.to_string(),
                reason: format!("item {} is {}", self.product_name, self.status),
            });
        }
        let available = self.remaining_to_ship();
        check_quantity("ship", quantity, available)?;
        self.quantity_shipped += quantity;
        self.sync_status();
        Ok(())
    }

    pub fn deliver(&mut self, quantity: u32) -> Result<(), ValidationError> {
        check_quantity("deliver", quantity, self.in_transit())?;
        self.quantity_delivered += quantity;
        self.sync_status();
        Ok(())
    }

    /// Only units that have not shipped can be cancelled.
    pub fn cancel_units(&mut self, quantity: u32) -> Result<(), ValidationError> {
        if self.status.is_terminal() {
            return Err(ValidationError::IllegalTransition {
                machine: ItemStatus::MACHINE,
                from: self.status.to_string(),
                to: ItemStatus::Cancelled.to_string(),
            });
        }
        check_quantity("cancel", quantity, self.remaining_to_ship())?;
        self.quantity_cancelled += quantity;
        self.sync_status();
        Ok(())
    }

    /// Returned units leave the delivered bucket, so only units that are
    /// currently delivered can come back.
    pub fn return_units(&mut self, quantity: u32) -> Result<(), ValidationError> {
        check_quantity("return", quantity, self.quantity_delivered)?;
        self.quantity_delivered -= quantity;
        self.quantity_returned += quantity;
        self.sync_status();
        Ok(())
    }

    /// Closes the line after its money went back to the buyer. Goods still
    /// with the buyer or in transit must be returned first.
    pub fn mark_refunded(&mut self) -> Result<(), ValidationError> {
        ensure_transition(self.status, ItemStatus::Refunded)?;
        let outstanding_goods = self.in_transit() + self.quantity_delivered;
        if outstanding_goods > 0 {
            return Err(ValidationError::GuardFailed {
                to: ItemStatus::Refunded.to_string(),
                reason: format!("{} unit(s) not yet returned", outstanding_goods),
            });
        }
        self.quantity_cancelled += self.remaining_to_ship();
        self.status = ItemStatus::Refunded;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Status implied by the quantity buckets, if any.
    pub fn derived_status(&self) -> Option<ItemStatus> {
        let active = self.active_quantity();
        if active == 0 {
            Some(ItemStatus::Cancelled)
        } else if self.quantity_returned == active {
            Some(ItemStatus::Returned)
        } else if self.quantity_delivered > 0
            && self.quantity_delivered + self.quantity_returned == active
        {
            Some(ItemStatus::Delivered)
        } else if self.quantity_delivered > 0 {
            Some(ItemStatus::PartiallyDelivered)
        } else if self.quantity_shipped == active {
            Some(ItemStatus::Shipped)
        } else if self.quantity_shipped > 0 {
            Some(ItemStatus::PartiallyShipped)
        } else {
            None
        }
    }

    /// Moves the status to whatever the quantities imply when the
    /// transition table allows it; otherwise the status stays put.
    fn sync_status(&mut self) {
        if let Some(next) = self.derived_status() {
            if next != self.status && self.status.can_transition_to(next) {
                self.status = next;
            }
        }
        self.updated_at = Utc::now();
    }
}

fn check_quantity(operation: &'static str, requested: u32, available: u32) -> Result<(), ValidationError> {
    if requested == 0 {
        return Err(ValidationError::Invalid(format!(
            "quantity to {} must be positive",
            operation
        )));
    }
    if requested > available {
        return Err(ValidationError::QuantityExceeded {
            operation,
            requested,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::snapshot;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn confirmed_item(quantity: u32) -> OrderItem {
        let mut item = OrderItem::from_snapshot(Uuid::new_v4(), snapshot("Tile 2x2", dec!(10.00), quantity)).unwrap();
        item.advance_to(ItemStatus::Confirmed).unwrap();
        item
    }

    #[test]
    fn test_partial_ship_then_deliver() {
        let mut item = confirmed_item(10);

        item.ship(4).unwrap();
        assert_eq!(item.status, ItemStatus::PartiallyShipped);

        item.deliver(4).unwrap();
        assert_eq!(item.status, ItemStatus::PartiallyDelivered);

        item.ship(6).unwrap();
        item.deliver(6).unwrap();
        assert_eq!(item.status, ItemStatus::Delivered);
        assert_eq!(item.quantity_delivered, 10);
    }

    #[test]
    fn test_over_ship_rejected_without_clamping() {
        let mut item = confirmed_item(5);
        item.ship(3).unwrap();

        let err = item.ship(3).unwrap_err();
        assert_eq!(
            err,
            ValidationError::QuantityExceeded {
                operation: "ship",
                requested: 3,
                available: 2
            }
        );
        assert_eq!(item.quantity_shipped, 3);
    }

    #[test]
    fn test_cannot_ship_pending_item() {
        let mut item = OrderItem::from_snapshot(Uuid::new_v4(), snapshot("Tile", dec!(1.00), 2)).unwrap();
        assert!(matches!(item.ship(1), Err(ValidationError::GuardFailed { .. })));
    }

    #[test]
    fn test_deliver_more_than_in_transit_rejected() {
        let mut item = confirmed_item(5);
        item.ship(2).unwrap();
        assert!(matches!(
            item.deliver(3),
            Err(ValidationError::QuantityExceeded { available: 2, .. })
        ));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let mut item = confirmed_item(5);
        assert!(matches!(item.ship(0), Err(ValidationError::Invalid(_))));
    }

    #[test]
    fn test_cancel_only_unshipped_units() {
        let mut item = confirmed_item(5);
        item.ship(3).unwrap();

        assert!(item.cancel_units(3).is_err());
        item.cancel_units(2).unwrap();
        assert_eq!(item.billable_quantity(), 3);
        assert_eq!(item.remaining_to_ship(), 0);
    }

    #[test]
    fn test_cancel_everything_marks_item_cancelled() {
        let mut item = confirmed_item(5);
        item.apply_fulfillment(FulfillmentUpdate::all(ItemStatus::Cancelled)).unwrap();
        assert_eq!(item.status, ItemStatus::Cancelled);
        assert_eq!(item.billable_quantity(), 0);
    }

    #[test]
    fn test_return_reduces_billable_quantity() {
        let mut item = confirmed_item(4);
        item.ship(4).unwrap();
        item.deliver(4).unwrap();

        item.return_units(1).unwrap();
        assert_eq!(item.quantity_delivered, 3);
        assert_eq!(item.quantity_returned, 1);
        assert_eq!(item.billable_quantity(), 3);
        assert_eq!(item.status, ItemStatus::Delivered);

        item.return_units(3).unwrap();
        assert_eq!(item.status, ItemStatus::Returned);
        assert!(item.return_units(1).is_err());
    }

    #[test]
    fn test_refund_requires_goods_back() {
        let mut item = confirmed_item(2);
        item.ship(2).unwrap();
        assert!(item.mark_refunded().is_err());

        item.deliver(2).unwrap();
        item.return_units(2).unwrap();
        item.mark_refunded().unwrap();
        assert_eq!(item.status, ItemStatus::Refunded);
    }

    #[test]
    fn test_pending_target_rejected() {
        let mut item = confirmed_item(2);
        assert!(item.apply_fulfillment(FulfillmentUpdate::all(ItemStatus::Pending)).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Ship(u32),
        Deliver(u32),
        Cancel(u32),
        Return(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..8).prop_map(Op::Ship),
            (0u32..8).prop_map(Op::Deliver),
            (0u32..8).prop_map(Op::Cancel),
            (0u32..8).prop_map(Op::Return),
        ]
    }

    proptest! {
        #[test]
        fn quantity_buckets_never_overflow(ordered in 1u32..20, ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut item = confirmed_item(ordered);
            for op in ops {
                let before = item.clone();
                let result = match op {
                    Op::Ship(n) => item.ship(n),
                    Op::Deliver(n) => item.deliver(n),
                    Op::Cancel(n) => item.cancel_units(n),
                    Op::Return(n) => item.return_units(n),
                };
                if result.is_err() {
                    prop_assert_eq!(&item, &before);
                }
                prop_assert!(item.check_quantities().is_ok());
                prop_assert!(item.billable_quantity() <= item.quantity_ordered);
            }
        }
    }
}
