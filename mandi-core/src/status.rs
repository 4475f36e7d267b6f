//! Status enums for every state machine in the engine. The legal moves
//! between them live in [`crate::transition`].

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Generates `as_str`, `Display` and `FromStr` using the same
/// SCREAMING_SNAKE_CASE names serde uses, so database columns and JSON agree.
macro_rules! status_strings {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ValidationError::UnknownValue {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

/// Order lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Draft,
    Pending,
    Confirmed,
    Processing,
    PartiallyShipped,
    Shipped,
    PartiallyDelivered,
    Delivered,
    Completed,
    Cancelled,
    Refunded,
    Returned,
    Failed,
}

status_strings!(OrderStatus, "order status", {
    Draft => "DRAFT",
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Processing => "PROCESSING",
    PartiallyShipped => "PARTIALLY_SHIPPED",
    Shipped => "SHIPPED",
    PartiallyDelivered => "PARTIALLY_DELIVERED",
    Delivered => "DELIVERED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
    Refunded => "REFUNDED",
    Returned => "RETURNED",
    Failed => "FAILED",
});

impl OrderStatus {
    pub fn is_cancellable(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Items, charges and quantities may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, OrderStatus::Draft | OrderStatus::Pending)
    }

    /// Money may be collected against the order.
    pub fn accepts_payment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::PartiallyShipped
                | OrderStatus::Shipped
                | OrderStatus::PartiallyDelivered
                | OrderStatus::Delivered
        )
    }

    /// Warehouse operations may move item quantities.
    pub fn allows_fulfillment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed
                | OrderStatus::Processing
                | OrderStatus::PartiallyShipped
                | OrderStatus::Shipped
                | OrderStatus::PartiallyDelivered
                | OrderStatus::Delivered
        )
    }
}

/// Aggregate fulfillment view derived from the line items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    #[default]
    Unfulfilled,
    PartiallyShipped,
    Shipped,
    PartiallyDelivered,
    Delivered,
    Cancelled,
    Returned,
}

status_strings!(FulfillmentStatus, "fulfillment status", {
    Unfulfilled => "UNFULFILLED",
    PartiallyShipped => "PARTIALLY_SHIPPED",
    Shipped => "SHIPPED",
    PartiallyDelivered => "PARTIALLY_DELIVERED",
    Delivered => "DELIVERED",
    Cancelled => "CANCELLED",
    Returned => "RETURNED",
});

/// Order-level view of money collected, derived from the payment ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderPaymentStatus {
    #[default]
    Pending,
    PartiallyPaid,
    Paid,
    PartiallyRefunded,
    Refunded,
}

status_strings!(OrderPaymentStatus, "order payment status", {
    Pending => "PENDING",
    PartiallyPaid => "PARTIALLY_PAID",
    Paid => "PAID",
    PartiallyRefunded => "PARTIALLY_REFUNDED",
    Refunded => "REFUNDED",
});

/// Per-line fulfillment sub-status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    #[default]
    Pending,
    Confirmed,
    Processing,
    Packed,
    PartiallyShipped,
    Shipped,
    PartiallyDelivered,
    Delivered,
    Cancelled,
    Returned,
    Refunded,
}

status_strings!(ItemStatus, "item status", {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Processing => "PROCESSING",
    Packed => "PACKED",
    PartiallyShipped => "PARTIALLY_SHIPPED",
    Shipped => "SHIPPED",
    PartiallyDelivered => "PARTIALLY_DELIVERED",
    Delivered => "DELIVERED",
    Cancelled => "CANCELLED",
    Returned => "RETURNED",
    Refunded => "REFUNDED",
});

impl ItemStatus {
    /// Units of the line may leave the warehouse.
    pub fn can_ship(&self) -> bool {
        matches!(
            self,
            ItemStatus::Confirmed
                | ItemStatus::Processing
                | ItemStatus::Packed
                | ItemStatus::PartiallyShipped
                | ItemStatus::PartiallyDelivered
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Initiated,
    Authorized,
    Captured,
    Settled,
    Failed,
    Cancelled,
    Expired,
    PartiallyRefunded,
    FullyRefunded,
    Disputed,
    Chargeback,
}

status_strings!(PaymentStatus, "payment status", {
    Pending => "PENDING",
    Initiated => "INITIATED",
    Authorized => "AUTHORIZED",
    Captured => "CAPTURED",
    Settled => "SETTLED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
    Expired => "EXPIRED",
    PartiallyRefunded => "PARTIALLY_REFUNDED",
    FullyRefunded => "FULLY_REFUNDED",
    Disputed => "DISPUTED",
    Chargeback => "CHARGEBACK",
});

impl PaymentStatus {
    /// Money has been taken from the buyer.
    pub fn is_collected(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured
                | PaymentStatus::Settled
                | PaymentStatus::PartiallyRefunded
                | PaymentStatus::FullyRefunded
                | PaymentStatus::Disputed
                | PaymentStatus::Chargeback
        )
    }

    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Captured | PaymentStatus::Settled | PaymentStatus::PartiallyRefunded
        )
    }

    /// Position along the forward collection path. Used to recognise
    /// gateway events that arrive late for a payment that already moved on.
    pub fn progress_rank(&self) -> u8 {
        match self {
            PaymentStatus::Pending => 0,
            PaymentStatus::Initiated => 1,
            PaymentStatus::Authorized => 2,
            PaymentStatus::Captured => 3,
            PaymentStatus::Settled => 4,
            PaymentStatus::PartiallyRefunded => 5,
            PaymentStatus::Disputed => 6,
            PaymentStatus::FullyRefunded
            | PaymentStatus::Chargeback
            | PaymentStatus::Failed
            | PaymentStatus::Cancelled
            | PaymentStatus::Expired => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    #[default]
    Payment,
    Refund,
    Adjustment,
}

status_strings!(PaymentType, "payment type", {
    Payment => "PAYMENT",
    Refund => "REFUND",
    Adjustment => "ADJUSTMENT",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[default]
    Card,
    Upi,
    NetBanking,
    BankTransfer,
    Wallet,
    Credit,
}

status_strings!(PaymentMethod, "payment method", {
    Card => "CARD",
    Upi => "UPI",
    NetBanking => "NET_BANKING",
    BankTransfer => "BANK_TRANSFER",
    Wallet => "WALLET",
    Credit => "CREDIT",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    #[default]
    Requested,
    Approved,
    Processing,
    #[serde(alias = "PROCESSED")]
    Completed,
    Rejected,
    Failed,
    Cancelled,
}

status_strings!(RefundStatus, "refund status", {
    Requested => "REQUESTED",
    Approved => "APPROVED",
    Processing => "PROCESSING",
    Completed => "COMPLETED",
    Rejected => "REJECTED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl RefundStatus {
    /// Approved but not yet settled: the amount is reserved against the
    /// payment's refundable balance.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, RefundStatus::Approved | RefundStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[default]
    Draft,
    Sent,
    Paid,
    Overdue,
    Cancelled,
}

status_strings!(InvoiceStatus, "invoice status", {
    Draft => "DRAFT",
    Sent => "SENT",
    Paid => "PAID",
    Overdue => "OVERDUE",
    Cancelled => "CANCELLED",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceType {
    #[default]
    Standard,
    Refund,
}

status_strings!(InvoiceType, "invoice type", {
    Standard => "STANDARD",
    Refund => "REFUND",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!("PARTIALLY_SHIPPED".parse::<OrderStatus>().unwrap(), OrderStatus::PartiallyShipped);
        assert_eq!(PaymentStatus::FullyRefunded.to_string(), "FULLY_REFUNDED");
        assert_eq!(" completed ".parse::<RefundStatus>().unwrap(), RefundStatus::Completed);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = "SHIPPING".parse::<OrderStatus>().unwrap_err();
        assert!(matches!(err, ValidationError::UnknownValue { kind: "order status", .. }));
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&ItemStatus::PartiallyDelivered).unwrap();
        assert_eq!(json, format!("\"{}\"", ItemStatus::PartiallyDelivered));
        let refund: RefundStatus = serde_json::from_str("\"PROCESSED\"").unwrap();
        assert_eq!(refund, RefundStatus::Completed);
    }

    #[test]
    fn test_cancellable_orders() {
        assert!(OrderStatus::Processing.is_cancellable());
        assert!(!OrderStatus::Completed.is_cancellable());
        assert!(!OrderStatus::Refunded.is_cancellable());
    }
}
