use chrono::{DateTime, Utc};
use mandi_core::money::{self, LineDiscount, LineInput, LineTotals, OrderCharges, OrderTotals};
use mandi_core::status::{FulfillmentStatus, ItemStatus, OrderPaymentStatus, OrderStatus};
use mandi_core::{CoreError, ValidationError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Order item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("Order invariant violated: {0}")]
    Invariant(String),
}

impl From<OrderError> for CoreError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::Validation(v) => CoreError::Validation(v),
            OrderError::ItemNotFound(id) => CoreError::not_found("order item", id),
            OrderError::Invariant(msg) => CoreError::FatalInvariant(msg),
        }
    }
}

/// One purchase transaction and the single consistency boundary for its lines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub buyer_id: Uuid,
    pub company_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub status: OrderStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub payment_status: OrderPaymentStatus,
    pub items: Vec<OrderItem>,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub shipping_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    /// Multiplier from order currency to the marketplace base currency.
    pub exchange_rate: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    /// Captures and refunds applied to this order, keyed by their reference.
    pub payments: Vec<PaymentApplication>,
    pub notes: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    Capture,
    Refund,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentApplication {
    pub reference: String,
    pub payment_id: Uuid,
    pub kind: ApplicationKind,
    pub amount: Decimal,
    pub applied_at: DateTime<Utc>,
}

/// Product snapshot supplied at checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub vendor_id: Option<Uuid>,
    pub product_name: String,
    pub sku: Option<String>,
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(default)]
    pub discounts: Vec<LineDiscount>,
    #[serde(default)]
    pub tax_rate: Decimal,
    #[serde(default)]
    pub tax_inclusive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrder {
    pub buyer_id: Uuid,
    pub company_id: Option<Uuid>,
    pub vendor_id: Option<Uuid>,
    pub currency: String,
    #[serde(default = "default_exchange_rate")]
    pub exchange_rate: Decimal,
    pub items: Vec<NewOrderItem>,
    #[serde(default)]
    pub shipping_amount: Decimal,
    #[serde(default)]
    pub discount_amount: Decimal,
    /// Keep the order in DRAFT instead of submitting it as PENDING.
    #[serde(default)]
    pub draft: bool,
    pub notes: Option<String>,
}

fn default_exchange_rate() -> Decimal {
    Decimal::ONE
}

fn max_exchange_rate() -> Decimal {
    Decimal::from(1_000_000)
}

impl Order {
    pub fn create(request: CreateOrder) -> Result<Self, OrderError> {
        if request.items.is_empty() {
            return Err(ValidationError::Invalid("an order needs at least one item".to_string()).into());
        }
        if request.shipping_amount < Decimal::ZERO || request.discount_amount < Decimal::ZERO {
            return Err(ValidationError::InvalidAmount("charges cannot be negative".to_string()).into());
        }
        if request.exchange_rate <= Decimal::ZERO || request.exchange_rate > max_exchange_rate() {
            return Err(ValidationError::InvalidAmount(format!(
                "exchange rate {} must be positive and at most {}",
                request.exchange_rate,
                max_exchange_rate()
            ))
            .into());
        }
        let currency = request.currency.trim().to_uppercase();
        if currency.len() != 3 {
            return Err(ValidationError::Invalid(format!("invalid currency code: {}", request.currency)).into());
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let items = request
            .items
            .into_iter()
            .map(|item| OrderItem::from_snapshot(id, item))
            .collect::<Result<Vec<_>, _>>()?;

        let mut order = Self {
            id,
            order_number: Self::generate_order_number(&id, now),
            buyer_id: request.buyer_id,
            company_id: request.company_id,
            vendor_id: request.vendor_id,
            status: if request.draft {
                OrderStatus::Draft
            } else {
                OrderStatus::Pending
            },
            fulfillment_status: FulfillmentStatus::Unfulfilled,
            payment_status: OrderPaymentStatus::Pending,
            items,
            subtotal: Decimal::ZERO,
            tax_amount: Decimal::ZERO,
            shipping_amount: request.shipping_amount,
            discount_amount: request.discount_amount,
            total_amount: Decimal::ZERO,
            currency,
            exchange_rate: request.exchange_rate,
            paid_amount: Decimal::ZERO,
            outstanding_amount: Decimal::ZERO,
            payments: Vec::new(),
            notes: request.notes,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        order.ensure_non_negative_total()?;
        order.recompute()?;
        Ok(order)
    }

    /// Format: ORD-{yyyymmdd}-{short_uuid}
    fn generate_order_number(id: &Uuid, at: DateTime<Utc>) -> String {
        let short_id = &id.simple().to_string()[..8];
        format!("ORD-{}-{}", at.format("%Y%m%d"), short_id.to_uppercase())
    }

    pub fn item(&self, item_id: Uuid) -> Result<&OrderItem, OrderError> {
        self.items
            .iter()
            .find(|i| i.id == item_id)
            .ok_or(OrderError::ItemNotFound(item_id))
    }

    pub fn item_mut(&mut self, item_id: Uuid) -> Result<&mut OrderItem, OrderError> {
        self.items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or(OrderError::ItemNotFound(item_id))
    }

    pub fn charges(&self) -> OrderCharges {
        OrderCharges {
            shipping: self.shipping_amount,
            discount: self.discount_amount,
        }
    }

    pub fn captured_amount(&self) -> Decimal {
        self.ledger_sum(ApplicationKind::Capture)
    }

    pub fn refunded_amount(&self) -> Decimal {
        self.ledger_sum(ApplicationKind::Refund)
    }

    fn ledger_sum(&self, kind: ApplicationKind) -> Decimal {
        self.payments
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.amount)
            .sum()
    }

    /// Captures minus refunds recorded for one payment.
    pub fn net_applied(&self, payment_id: Uuid) -> Decimal {
        self.payments
            .iter()
            .filter(|p| p.payment_id == payment_id)
            .map(|p| match p.kind {
                ApplicationKind::Capture => p.amount,
                ApplicationKind::Refund => -p.amount,
            })
            .sum()
    }

    pub fn has_application(&self, reference: &str) -> bool {
        self.payments.iter().any(|p| p.reference == reference)
    }

    /// Totals as they would be after the current in-memory mutations,
    /// without checking invariants or writing anything back.
    pub fn projected_totals(&self) -> Result<OrderTotals, OrderError> {
        let lines = self
            .items
            .iter()
            .map(OrderItem::line_totals)
            .collect::<Result<Vec<_>, _>>()?;
        let paid = self.captured_amount() - self.refunded_amount();
        Ok(money::compute_order_totals(&lines, &self.charges(), paid)?)
    }

    /// Recompute-then-verify: refreshes every derived field from the items
    /// and the payment ledger, then checks the totals identities. Runs at
    /// the start of every commit so persisted rows are never stale.
    pub fn recompute(&mut self) -> Result<(), OrderError> {
        for item in &mut self.items {
            item.check_quantities().map_err(OrderError::Invariant)?;
            item.recalculate()?;
        }

        let totals = self.projected_totals()?;
        totals.verify().map_err(|e| {
            OrderError::Invariant(format!("order {}: {}", self.order_number, e))
        })?;

        self.subtotal = totals.subtotal;
        self.tax_amount = totals.tax;
        self.shipping_amount = totals.shipping;
        self.discount_amount = totals.discount;
        self.total_amount = totals.total;
        self.paid_amount = totals.paid;
        self.outstanding_amount = totals.outstanding;
        self.fulfillment_status = self.derive_fulfillment_status();
        self.payment_status = self.derive_payment_status(&totals);
        Ok(())
    }

    /// Rejects changes that would leave more collected money on the order
    /// than it is now worth. The excess has to be refunded first.
    pub fn ensure_funds_covered(&self) -> Result<(), OrderError> {
        let totals = self.projected_totals()?;
        if totals.paid > totals.total {
            return Err(ValidationError::RefundRequired(totals.paid - totals.total).into());
        }
        Ok(())
    }

    pub fn ensure_non_negative_total(&self) -> Result<(), OrderError> {
        let totals = self.projected_totals()?;
        if totals.total < Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(format!(
                "order discount {} exceeds order value",
                totals.discount
            ))
            .into());
        }
        Ok(())
    }

    fn derive_fulfillment_status(&self) -> FulfillmentStatus {
        let active: u32 = self.items.iter().map(OrderItem::active_quantity).sum();
        let shipped: u32 = self.items.iter().map(|i| i.quantity_shipped).sum();
        let delivered: u32 = self.items.iter().map(|i| i.quantity_delivered).sum();
        let returned: u32 = self.items.iter().map(|i| i.quantity_returned).sum();

        if active == 0 {
            FulfillmentStatus::Cancelled
        } else if returned == active {
            FulfillmentStatus::Returned
        } else if delivered > 0 && delivered + returned == active {
            FulfillmentStatus::Delivered
        } else if delivered > 0 {
            FulfillmentStatus::PartiallyDelivered
        } else if shipped == active {
            FulfillmentStatus::Shipped
        } else if shipped > 0 {
            FulfillmentStatus::PartiallyShipped
        } else {
            FulfillmentStatus::Unfulfilled
        }
    }

    fn derive_payment_status(&self, totals: &OrderTotals) -> OrderPaymentStatus {
        let captured = self.captured_amount();
        let refunded = self.refunded_amount();

        if captured.is_zero() {
            OrderPaymentStatus::Pending
        } else if refunded >= captured {
            OrderPaymentStatus::Refunded
        } else if !refunded.is_zero() {
            OrderPaymentStatus::PartiallyRefunded
        } else if totals.outstanding.is_zero() {
            OrderPaymentStatus::Paid
        } else {
            OrderPaymentStatus::PartiallyPaid
        }
    }

    /// Order value converted with the exchange-rate multiplier.
    pub fn base_currency_total(&self) -> Decimal {
        money::to_base_currency(self.total_amount, self.exchange_rate)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An individual product line within an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub vendor_id: Option<Uuid>,
    pub product_name: String,
    pub sku: Option<String>,
    pub unit_price: Decimal,
    pub quantity_ordered: u32,
    pub quantity_shipped: u32,
    pub quantity_delivered: u32,
    pub quantity_cancelled: u32,
    pub quantity_returned: u32,
    pub discounts: Vec<LineDiscount>,
    pub discount_amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_inclusive: bool,
    pub tax_amount: Decimal,
    pub total_price: Decimal,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderItem {
    /// Copies the catalog snapshot in. Later catalog changes never reach
    /// this line.
    pub fn from_snapshot(order_id: Uuid, snapshot: NewOrderItem) -> Result<Self, OrderError> {
        if snapshot.quantity == 0 {
            return Err(ValidationError::Invalid(format!(
                "quantity for {} must be positive",
                snapshot.product_name
            ))
            .into());
        }
        if snapshot.product_name.trim().is_empty() {
            return Err(ValidationError::Invalid("product name is required".to_string()).into());
        }

        let now = Utc::now();
        let mut item = Self {
            id: Uuid::new_v4(),
            order_id,
            product_id: snapshot.product_id,
            vendor_id: snapshot.vendor_id,
            product_name: snapshot.product_name,
            sku: snapshot.sku,
            unit_price: snapshot.unit_price,
            quantity_ordered: snapshot.quantity,
            quantity_shipped: 0,
            quantity_delivered: 0,
            quantity_cancelled: 0,
            quantity_returned: 0,
            discounts: snapshot.discounts,
            discount_amount: Decimal::ZERO,
            tax_rate: snapshot.tax_rate,
            tax_inclusive: snapshot.tax_inclusive,
            tax_amount: Decimal::ZERO,
            total_price: Decimal::ZERO,
            status: ItemStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        item.recalculate()?;
        Ok(item)
    }

    /// Units not cancelled.
    pub fn active_quantity(&self) -> u32 {
        self.quantity_ordered.saturating_sub(self.quantity_cancelled)
    }

    /// Units still charged for.
    pub fn billable_quantity(&self) -> u32 {
        self.active_quantity().saturating_sub(self.quantity_returned)
    }

    pub fn line_totals(&self) -> Result<LineTotals, OrderError> {
        Ok(money::compute_item_total(&LineInput {
            unit_price: self.unit_price,
            quantity_ordered: self.quantity_ordered,
            billable_quantity: self.billable_quantity(),
            discounts: &self.discounts,
            tax_rate: self.tax_rate,
            tax_inclusive: self.tax_inclusive,
        })?)
    }

    pub fn recalculate(&mut self) -> Result<(), OrderError> {
        let totals = self.line_totals()?;
        self.discount_amount = totals.discount_amount();
        self.tax_amount = totals.tax_amount();
        self.total_price = totals.total_price();
        Ok(())
    }

    /// `shipped + cancelled ≤ ordered` and `delivered + returned ≤ shipped`.
    pub fn check_quantities(&self) -> Result<(), String> {
        if self.quantity_shipped + self.quantity_cancelled > self.quantity_ordered {
            return Err(format!(
                "item {}: shipped {} + cancelled {} > ordered {}",
                self.id, self.quantity_shipped, self.quantity_cancelled, self.quantity_ordered
            ));
        }
        if self.quantity_delivered + self.quantity_returned > self.quantity_shipped {
            return Err(format!(
                "item {}: delivered {} + returned {} > shipped {}",
                self.id, self.quantity_delivered, self.quantity_returned, self.quantity_shipped
            ));
        }
        Ok(())
    }
}
