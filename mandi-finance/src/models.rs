use chrono::{DateTime, NaiveDate, Utc};
use mandi_core::money::{round_money, GstRates, Jurisdiction};
use mandi_core::status::{InvoiceStatus, InvoiceType, PaymentMethod, PaymentStatus, PaymentType, RefundStatus};
use mandi_shared::Masked;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// A single collection attempt against an order, together with every
/// refund issued against it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Idempotency key shared with the gateway.
    pub payment_reference: String,
    pub payment_type: PaymentType,
    pub method: PaymentMethod,
    pub method_details: Option<Masked<String>>,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub fees: PaymentFees,
    pub total_fees: Decimal,
    pub net_amount: Decimal,
    pub refundable_amount: Decimal,
    pub refunded_amount: Decimal,
    pub gateway_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refunds: Vec<PaymentRefund>,
    pub version: i64,
    pub initiated_at: Option<DateTime<Utc>>,
    pub authorized_at: Option<DateTime<Utc>>,
    pub captured_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentFees {
    #[serde(default)]
    pub gateway_fee: Decimal,
    #[serde(default)]
    pub processing_fee: Decimal,
    #[serde(default)]
    pub convenience_fee: Decimal,
}

impl PaymentFees {
    pub fn total(&self) -> Decimal {
        self.gateway_fee + self.processing_fee + self.convenience_fee
    }

    /// `None` when the components cannot be summed.
    pub fn checked_total(&self) -> Option<Decimal> {
        self.gateway_fee
            .checked_add(self.processing_fee)?
            .checked_add(self.convenience_fee)
    }

    pub fn is_negative(&self) -> bool {
        self.gateway_fee < Decimal::ZERO
            || self.processing_fee < Decimal::ZERO
            || self.convenience_fee < Decimal::ZERO
    }
}

/// Marketplace charges deducted from each collected payment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Percentage of the payment amount kept by the gateway.
    pub gateway_fee_percent: Decimal,
    pub processing_fee: Decimal,
    pub convenience_fee: Decimal,
}

impl FeeSchedule {
    pub fn fees_for(&self, amount: Decimal) -> PaymentFees {
        PaymentFees {
            gateway_fee: round_money(amount * self.gateway_fee_percent / HUNDRED),
            processing_fee: round_money(self.processing_fee),
            convenience_fee: round_money(self.convenience_fee),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRefund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub refund_reference: String,
    pub amount: Decimal,
    pub reason: String,
    pub status: RefundStatus,
    pub gateway_refund_id: Option<String>,
    pub failure_reason: Option<String>,
    pub requested_by: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub requested_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Status report from the payment provider, delivered by webhook or the
/// gateway-events topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayEvent {
    pub payment_reference: String,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub gateway_transaction_id: Option<String>,
    pub fees: Option<PaymentFees>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturePaymentRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub method_details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequestInput {
    pub refund_reference: Option<String>,
    pub amount: Decimal,
    pub reason: String,
    pub requested_by: Option<Uuid>,
}

/// Where the tax is owed: the two GST state codes, the rate, and whether
/// the amount being invoiced already contains the tax.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaxContext {
    pub vendor_state: String,
    pub buyer_state: String,
    pub gst_rate: Decimal,
    #[serde(default)]
    pub amount_includes_tax: bool,
}

impl TaxContext {
    pub fn rates(&self) -> GstRates {
        GstRates::from_total(self.gst_rate)
    }
}

/// Recurring-billing event from the subscription service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionCharge {
    pub subscription_id: Uuid,
    /// Identifies this billing cycle; one invoice per cycle.
    pub billing_event_id: Uuid,
    pub company_id: Uuid,
    pub plan_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceSource {
    Payment(Uuid),
    Refund(Uuid),
    Subscription(Uuid),
}

impl InvoiceSource {
    pub fn kind(&self) -> &'static str {
        match self {
            InvoiceSource::Payment(_) => "PAYMENT",
            InvoiceSource::Refund(_) => "REFUND",
            InvoiceSource::Subscription(_) => "SUBSCRIPTION",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            InvoiceSource::Payment(id) | InvoiceSource::Refund(id) | InvoiceSource::Subscription(id) => *id,
        }
    }
}

/// Tax invoice or credit note. Every money field is frozen at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub invoice_type: InvoiceType,
    pub status: InvoiceStatus,
    pub source: InvoiceSource,
    pub order_id: Option<Uuid>,
    pub company_id: Option<Uuid>,
    pub description: String,
    pub vendor_state: String,
    pub buyer_state: String,
    pub jurisdiction: Jurisdiction,
    pub subtotal: Decimal,
    pub cgst_rate: Decimal,
    pub cgst_amount: Decimal,
    pub sgst_rate: Decimal,
    pub sgst_amount: Decimal,
    pub igst_rate: Decimal,
    pub igst_amount: Decimal,
    pub total_tax: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
