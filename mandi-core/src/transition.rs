//! Legal-transition tables for every state machine. Mutators never compare
//! statuses ad hoc; they ask [`ensure_transition`] first.

use std::fmt::{Debug, Display};

use crate::status::{
    InvoiceStatus, ItemStatus, OrderStatus, PaymentStatus, RefundStatus,
};
use crate::ValidationError;

pub trait Lifecycle: Copy + Eq + Debug + Display + 'static {
    /// Name used in error messages ("order", "payment", ...)
    const MACHINE: &'static str;

    /// Statuses reachable in one step.
    fn successors(self) -> &'static [Self];

    fn can_transition_to(self, next: Self) -> bool {
        self.successors().contains(&next)
    }

    fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }
}

/// Validates a single status move against the machine's table.
pub fn ensure_transition<S: Lifecycle>(from: S, to: S) -> Result<(), ValidationError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ValidationError::IllegalTransition {
            machine: S::MACHINE,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

impl Lifecycle for OrderStatus {
    const MACHINE: &'static str = "order";

    fn successors(self) -> &'static [Self] {
        use OrderStatus::*;
        match self {
            Draft => &[Pending, Cancelled, Refunded, Returned, Failed],
            Pending => &[Confirmed, Cancelled, Refunded, Returned, Failed],
            Confirmed => &[Processing, Cancelled, Refunded, Returned, Failed],
            Processing => &[
                PartiallyShipped,
                Shipped,
                Cancelled,
                Refunded,
                Returned,
                Failed,
            ],
            PartiallyShipped => &[
                Shipped,
                PartiallyDelivered,
                Delivered,
                Cancelled,
                Refunded,
                Returned,
                Failed,
            ],
            Shipped => &[
                PartiallyDelivered,
                Delivered,
                Cancelled,
                Refunded,
                Returned,
                Failed,
            ],
            PartiallyDelivered => &[Delivered, Completed, Cancelled, Refunded, Returned, Failed],
            Delivered => &[Completed, Cancelled, Refunded, Returned, Failed],
            Returned => &[Cancelled, Refunded, Failed],
            Completed | Cancelled | Refunded | Failed => &[],
        }
    }
}

impl Lifecycle for ItemStatus {
    const MACHINE: &'static str = "order item";

    fn successors(self) -> &'static [Self] {
        use ItemStatus::*;
        match self {
            Pending => &[Confirmed, Processing, Cancelled, Refunded],
            Confirmed => &[Processing, Packed, PartiallyShipped, Shipped, Cancelled, Refunded],
            Processing => &[Packed, PartiallyShipped, Shipped, Cancelled, Refunded],
            Packed => &[PartiallyShipped, Shipped, Cancelled, Refunded],
            PartiallyShipped => &[
                Shipped,
                PartiallyDelivered,
                Delivered,
                Cancelled,
                Returned,
                Refunded,
            ],
            Shipped => &[PartiallyDelivered, Delivered, Returned, Refunded],
            PartiallyDelivered => &[Delivered, Returned, Refunded],
            Delivered => &[Returned, Refunded],
            Returned => &[Refunded],
            Cancelled | Refunded => &[],
        }
    }
}

impl Lifecycle for PaymentStatus {
    const MACHINE: &'static str = "payment";

    fn successors(self) -> &'static [Self] {
        use PaymentStatus::*;
        match self {
            Pending => &[Initiated, Failed, Cancelled, Expired],
            Initiated => &[Authorized, Captured, Failed, Cancelled, Expired],
            Authorized => &[Captured, Failed, Cancelled, Expired],
            Captured => &[Settled, PartiallyRefunded, FullyRefunded, Disputed, Chargeback],
            Settled => &[PartiallyRefunded, FullyRefunded, Disputed, Chargeback],
            PartiallyRefunded => &[FullyRefunded, Disputed, Chargeback],
            Disputed => &[Settled, Chargeback],
            FullyRefunded | Chargeback | Failed | Cancelled | Expired => &[],
        }
    }
}

impl Lifecycle for RefundStatus {
    const MACHINE: &'static str = "refund";

    fn successors(self) -> &'static [Self] {
        use RefundStatus::*;
        match self {
            Requested => &[Approved, Rejected, Failed, Cancelled],
            Approved => &[Processing, Rejected, Failed, Cancelled],
            Processing => &[Completed, Rejected, Failed, Cancelled],
            Completed | Rejected | Failed | Cancelled => &[],
        }
    }
}

impl Lifecycle for InvoiceStatus {
    const MACHINE: &'static str = "invoice";

    fn successors(self) -> &'static [Self] {
        use InvoiceStatus::*;
        match self {
            Draft => &[Sent, Paid, Cancelled],
            Sent => &[Paid, Overdue, Cancelled],
            Overdue => &[Paid, Cancelled],
            Paid | Cancelled => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_happy_path_is_legal() {
        use OrderStatus::*;
        let path = [Draft, Pending, Confirmed, Processing, Shipped, Delivered, Completed];
        for pair in path.windows(2) {
            ensure_transition(pair[0], pair[1]).unwrap();
        }
    }

    #[test]
    fn test_completed_order_cannot_be_cancelled() {
        let err = ensure_transition(OrderStatus::Completed, OrderStatus::Cancelled).unwrap_err();
        assert_eq!(
            err,
            ValidationError::IllegalTransition {
                machine: "order",
                from: "COMPLETED".to_string(),
                to: "CANCELLED".to_string(),
            }
        );
    }

    #[test]
    fn test_side_branches_reachable_from_every_open_order_state() {
        use OrderStatus::*;
        for status in [Draft, Pending, Confirmed, Processing, PartiallyShipped, Shipped, PartiallyDelivered, Delivered] {
            for side in [Cancelled, Refunded, Returned, Failed] {
                assert!(status.can_transition_to(side), "{} -> {}", status, side);
            }
        }
        for side in [Cancelled, Refunded, Failed] {
            assert!(Returned.can_transition_to(side), "RETURNED -> {}", side);
        }
        assert!(!Returned.can_transition_to(Completed));
    }

    #[test]
    fn test_payment_cannot_be_cancelled_after_capture() {
        assert!(PaymentStatus::Authorized.can_transition_to(PaymentStatus::Cancelled));
        assert!(!PaymentStatus::Captured.can_transition_to(PaymentStatus::Cancelled));
        assert!(!PaymentStatus::Settled.can_transition_to(PaymentStatus::Failed));
    }

    #[test]
    fn test_refund_terminals() {
        for status in [RefundStatus::Completed, RefundStatus::Rejected, RefundStatus::Failed, RefundStatus::Cancelled] {
            assert!(status.is_terminal());
        }
        assert!(!RefundStatus::Processing.is_terminal());
    }

    #[test]
    fn test_paid_invoice_is_frozen() {
        assert!(InvoiceStatus::Paid.is_terminal());
        assert!(ensure_transition(InvoiceStatus::Sent, InvoiceStatus::Overdue).is_ok());
        assert!(ensure_transition(InvoiceStatus::Paid, InvoiceStatus::Sent).is_err());
    }
}
