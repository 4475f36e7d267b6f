use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ORDER_TOPIC: &str = "mandi.order.events";
pub const PAYMENT_TOPIC: &str = "mandi.payment.events";
pub const INVOICE_TOPIC: &str = "mandi.invoice.events";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OrderConfirmedEvent {
    pub order_id: Uuid,
    pub order_number: String,
    pub buyer_id: Uuid,
    pub total: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OrderStatusChangedEvent {
    pub order_id: Uuid,
    pub from: String,
    pub to: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PaymentStatusEvent {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub payment_reference: String,
    pub status: String,
    pub amount: Decimal,
    pub net_amount: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RefundCompletedEvent {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub refund_reference: String,
    pub amount: Decimal,
    pub remaining_refundable: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InvoiceGeneratedEvent {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub invoice_type: String,
    pub total: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
}

/// Status-change notifications emitted after a unit of work commits.
/// Consumers (notifications, analytics) receive them out of band.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderConfirmed(OrderConfirmedEvent),
    OrderStatusChanged(OrderStatusChangedEvent),
    PaymentCaptured(PaymentStatusEvent),
    PaymentSettled(PaymentStatusEvent),
    PaymentFailed(PaymentStatusEvent),
    RefundCompleted(RefundCompletedEvent),
    InvoiceGenerated(InvoiceGeneratedEvent),
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::OrderConfirmed(_) | DomainEvent::OrderStatusChanged(_) => ORDER_TOPIC,
            DomainEvent::PaymentCaptured(_)
            | DomainEvent::PaymentSettled(_)
            | DomainEvent::PaymentFailed(_)
            | DomainEvent::RefundCompleted(_) => PAYMENT_TOPIC,
            DomainEvent::InvoiceGenerated(_) => INVOICE_TOPIC,
        }
    }

    /// Partition key: every event of one aggregate lands on the same partition.
    pub fn key(&self) -> String {
        match self {
            DomainEvent::OrderConfirmed(e) => e.order_id.to_string(),
            DomainEvent::OrderStatusChanged(e) => e.order_id.to_string(),
            DomainEvent::PaymentCaptured(e)
            | DomainEvent::PaymentSettled(e)
            | DomainEvent::PaymentFailed(e) => e.payment_id.to_string(),
            DomainEvent::RefundCompleted(e) => e.payment_id.to_string(),
            DomainEvent::InvoiceGenerated(e) => e.invoice_id.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::OrderConfirmed(_) => "order_confirmed",
            DomainEvent::OrderStatusChanged(_) => "order_status_changed",
            DomainEvent::PaymentCaptured(_) => "payment_captured",
            DomainEvent::PaymentSettled(_) => "payment_settled",
            DomainEvent::PaymentFailed(_) => "payment_failed",
            DomainEvent::RefundCompleted(_) => "refund_completed",
            DomainEvent::InvoiceGenerated(_) => "invoice_generated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DomainEvent::OrderStatusChanged(OrderStatusChangedEvent {
            order_id: Uuid::new_v4(),
            from: "CONFIRMED".to_string(),
            to: "PROCESSING".to_string(),
            occurred_at: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_status_changed");
        assert_eq!(json["to"], "PROCESSING");
        assert_eq!(event.topic(), ORDER_TOPIC);
    }

    #[test]
    fn test_refund_events_keyed_by_payment() {
        let payment_id = Uuid::new_v4();
        let event = DomainEvent::RefundCompleted(RefundCompletedEvent {
            refund_id: Uuid::new_v4(),
            payment_id,
            order_id: Uuid::new_v4(),
            refund_reference: "RF-1".to_string(),
            amount: Decimal::new(30000, 2),
            remaining_refundable: Decimal::new(70000, 2),
            occurred_at: Utc::now(),
        });
        assert_eq!(event.key(), payment_id.to_string());
        assert_eq!(event.topic(), PAYMENT_TOPIC);
    }
}
